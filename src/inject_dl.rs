//! Drive the tracee's own dynamic linker: `dlopen`, `dlsym` and `dlclose`
//! calls are synthesized as short machine-code stubs, written into a scratch
//! region inside the tracee and executed there.
//!
//! Errors that leave the tracee in a coherent state are returned to the
//! caller. Errors after the tracee's registers or memory have been altered
//! mean the tracee cannot be repaired; those panic.

use log::debug;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use simple_error::try_with;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::alloc;
use crate::cpu;
use crate::machine_code::MachineCode;
use crate::memory;
use crate::ptrace::Thread;
use crate::result::Result;
use crate::symbols;

/// Size of the head of a scratch region reserved for machine code. String
/// arguments are written behind this offset.
pub const CODE_SCRATCH_PAD_SIZE: u64 = 1024;

/// Tracee memory leased for one operation. Unmapped when dropped; a failing
/// unmap means the tracee is damaged and aborts the tracer.
struct ScratchRegion<'a> {
    thread: &'a Thread,
    address: u64,
    size: u64,
}

impl<'a> ScratchRegion<'a> {
    fn allocate(thread: &'a Thread, size: u64) -> Result<Self> {
        let address = try_with!(
            alloc::allocate_in_tracee(thread, size),
            "cannot allocate scratch region in tracee"
        );
        Ok(ScratchRegion {
            thread,
            address,
            size,
        })
    }
}

impl<'a> Drop for ScratchRegion<'a> {
    fn drop(&mut self) {
        if let Err(e) = alloc::free_in_tracee(self.thread, self.address, self.size) {
            panic!(
                "unable to free previously allocated memory in tracee: {}",
                e
            );
        }
    }
}

// return_value = dlopen(path, flag);
// The calling convention is to put the parameters in registers rdi and rsi.
// Assembly in Intel syntax (destination first), machine code on the right:
//
// movabsq rdi, path_address        48 bf path_address
// movl esi, flag                   be flag
// movabsq rax, dlopen_address      48 b8 dlopen_address
// call rax                         ff d0
// int3                             cc
fn dlopen_stub(path_address: u64, flag: u32, dlopen_address: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_imm64(path_address)
        .append_bytes(&[0xbe])
        .append_imm32(flag)
        .append_bytes(&[0x48, 0xb8])
        .append_imm64(dlopen_address)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

// return_value = dlsym(handle, symbol);
//
// movabsq rdi, handle              48 bf handle
// movabsq rsi, name_address        48 be name_address
// movabsq rax, dlsym_address       48 b8 dlsym_address
// call rax                         ff d0
// int3                             cc
fn dlsym_stub(handle: u64, name_address: u64, dlsym_address: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_imm64(handle)
        .append_bytes(&[0x48, 0xbe])
        .append_imm64(name_address)
        .append_bytes(&[0x48, 0xb8])
        .append_imm64(dlsym_address)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

// dlclose(handle);
//
// movabsq rdi, handle              48 bf handle
// movabsq rax, dlclose_address     48 b8 dlclose_address
// call rax                         ff d0
// int3                             cc
fn dlclose_stub(handle: u64, dlclose_address: u64) -> MachineCode {
    let mut code = MachineCode::new();
    code.append_bytes(&[0x48, 0xbf])
        .append_imm64(handle)
        .append_bytes(&[0x48, 0xb8])
        .append_imm64(dlclose_address)
        .append_bytes(&[0xff, 0xd0])
        .append_bytes(&[0xcc]);
    code
}

/// Execute the code at `code_address`. The code has to end in `int3`.
fn execute_stub(thread: &Thread, original_regs: &cpu::Regs, code_address: u64) {
    let mut regs = *original_regs;
    regs.rip = code_address;
    // Clear the pending-syscall state: if the tracee was stopped inside an
    // interrupted syscall the kernel rewinds rip on resume to restart it,
    // which would land two bytes in front of the stub.
    regs.rax = 0;
    regs.orig_rax = -1_i64 as u64;
    // The stub calls into the tracee's libc: step over the interrupted
    // frame's red zone and hand the call a 16-byte aligned stack.
    regs.rsp = (regs.rsp - 128) & !0xf;
    if let Err(e) = thread.setregs(&regs) {
        panic!("unable to set registers in tracee: {}", e);
    }
    if let Err(e) = thread.cont(None) {
        panic!("unable to continue tracee: {}", e);
    }
    match waitpid(thread.tid, None) {
        Ok(WaitStatus::Stopped(pid, Signal::SIGTRAP)) if pid == thread.tid => {}
        other => panic!(
            "failed to wait for sigtrap after continuing tracee, got: {:?}",
            other
        ),
    }
}

fn return_value_or_die(thread: &Thread) -> u64 {
    match thread.getregs() {
        Ok(regs) => regs.rax,
        Err(e) => panic!("unable to read registers after function call: {}", e),
    }
}

fn restore_registers_or_die(thread: &Thread, regs: &cpu::Regs) {
    if let Err(e) = thread.setregs(regs) {
        panic!("unable to restore register state in tracee: {}", e);
    }
}

/// Resolve one of the dl entrypoints in the tracee. Probes the public name in
/// libdl first and the historical internal alias in libc second; glibc 2.34
/// merged libdl into libc and removed the aliases, so the public name is
/// probed in libc last.
fn resolve_dl_function(pid: Pid, function_name: &str, internal_name: &str) -> Result<u64> {
    match symbols::find_function_address_with_fallback(
        pid,
        function_name,
        "libdl",
        internal_name,
        "libc",
    ) {
        Ok(address) => Ok(address),
        Err(e) => match symbols::find_function_address(pid, function_name, "libc") {
            Ok(address) => Ok(address),
            Err(_) => Err(e),
        },
    }
}

/// Load the shared library at `path` into the tracee. Returns the handle as
/// the tracee's `dlopen` returned it; a NULL handle is passed through and is
/// the caller's to interpret.
pub fn dlopen_in_tracee(thread: &Thread, path: &Path, flag: u32) -> Result<u64> {
    let address_dlopen = resolve_dl_function(thread.tid, "dlopen", "__libc_dlopen_mode")?;

    let original_regs = try_with!(thread.getregs(), "cannot back up registers of tracee");

    let mut path_bytes = path.as_os_str().as_bytes().to_vec();
    path_bytes.push(0);
    let memory_size = CODE_SCRATCH_PAD_SIZE + path_bytes.len() as u64;
    let scratch = ScratchRegion::allocate(thread, memory_size)?;

    let address_path = scratch.address + CODE_SCRATCH_PAD_SIZE;
    try_with!(
        memory::write_bytes(thread.tid, address_path, &path_bytes),
        "cannot write library path into tracee"
    );

    let code = dlopen_stub(address_path, flag, address_dlopen);
    try_with!(
        memory::write_bytes(thread.tid, scratch.address, code.as_slice()),
        "cannot write dlopen stub into tracee"
    );

    execute_stub(thread, &original_regs, scratch.address);
    let handle = return_value_or_die(thread);
    restore_registers_or_die(thread, &original_regs);
    debug!("dlopen({}) in tracee returned {:#x}", path.display(), handle);
    Ok(handle)
}

/// Look up `symbol` via the tracee's `dlsym` on a handle obtained from
/// `dlopen_in_tracee`. The tracee's return value is passed through, so a
/// missing symbol comes back as 0.
pub fn dlsym_in_tracee(thread: &Thread, handle: u64, symbol: &str) -> Result<u64> {
    let address_dlsym = resolve_dl_function(thread.tid, "dlsym", "__libc_dlsym")?;

    let original_regs = try_with!(thread.getregs(), "cannot back up registers of tracee");

    // zero-initialized so any tail of the buffer terminates the name
    let mut name_bytes = vec![0_u8; symbol.len() + 1];
    name_bytes[..symbol.len()].copy_from_slice(symbol.as_bytes());
    let memory_size = CODE_SCRATCH_PAD_SIZE + name_bytes.len() as u64;
    let scratch = ScratchRegion::allocate(thread, memory_size)?;

    let address_name = scratch.address + CODE_SCRATCH_PAD_SIZE;
    try_with!(
        memory::write_bytes(thread.tid, address_name, &name_bytes),
        "cannot write symbol name into tracee"
    );

    let code = dlsym_stub(handle, address_name, address_dlsym);
    try_with!(
        memory::write_bytes(thread.tid, scratch.address, code.as_slice()),
        "cannot write dlsym stub into tracee"
    );

    execute_stub(thread, &original_regs, scratch.address);
    let address = return_value_or_die(thread);
    restore_registers_or_die(thread, &original_regs);
    debug!("dlsym({}) in tracee returned {:#x}", symbol, address);
    Ok(address)
}

/// Unload a handle obtained from `dlopen_in_tracee` via the tracee's
/// `dlclose`. A non-zero return from `dlclose` means the tracee's linker
/// state is unknown; that is fatal.
pub fn dlclose_in_tracee(thread: &Thread, handle: u64) -> Result<()> {
    let address_dlclose = resolve_dl_function(thread.tid, "dlclose", "__libc_dlclose")?;

    let original_regs = try_with!(thread.getregs(), "cannot back up registers of tracee");

    let scratch = ScratchRegion::allocate(thread, CODE_SCRATCH_PAD_SIZE)?;

    let code = dlclose_stub(handle, address_dlclose);
    try_with!(
        memory::write_bytes(thread.tid, scratch.address, code.as_slice()),
        "cannot write dlclose stub into tracee"
    );

    execute_stub(thread, &original_regs, scratch.address);
    let ret = return_value_or_die(thread);
    if ret != 0 {
        panic!("unable to unload dynamic library from tracee: dlclose returned {:#x}", ret);
    }
    restore_registers_or_die(thread, &original_regs);
    debug!("dlclose({:#x}) in tracee succeeded", handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc;
    use crate::ptrace;
    use crate::testutil::{compile_shared_object, TracedChild};

    #[test]
    fn test_stub_encodings() {
        let code = dlopen_stub(0x1122_3344_5566_7788, 0x101, 0x99aa_bbcc_ddee_ff00);
        let mut expected = vec![0x48, 0xbf];
        expected.extend_from_slice(&0x1122_3344_5566_7788_u64.to_le_bytes());
        expected.push(0xbe);
        expected.extend_from_slice(&0x101_u32.to_le_bytes());
        expected.extend_from_slice(&[0x48, 0xb8]);
        expected.extend_from_slice(&0x99aa_bbcc_ddee_ff00_u64.to_le_bytes());
        expected.extend_from_slice(&[0xff, 0xd0, 0xcc]);
        assert_eq!(code.as_slice(), expected.as_slice());

        let code = dlsym_stub(0x1, 0x2, 0x3);
        assert_eq!(code.as_slice()[0], 0x48);
        assert_eq!(code.len(), 2 + 8 + 2 + 8 + 2 + 8 + 2 + 1);

        let code = dlclose_stub(0x1, 0x2);
        assert_eq!(code.len(), 2 + 8 + 2 + 8 + 2 + 1);
    }

    #[test]
    fn test_stubs_end_in_int3() {
        for code in &[
            dlopen_stub(0x1000, 0x2, 0x2000),
            dlsym_stub(0x1000, 0x2000, 0x3000),
            dlclose_stub(0x1000, 0x2000),
        ] {
            assert_eq!(*code.as_slice().last().expect("stub is empty"), 0xcc);
            assert!(code.len() as u64 <= CODE_SCRATCH_PAD_SIZE);
        }
    }

    #[test]
    fn test_load_resolve_unload() {
        let child = TracedChild::spawn();
        let so_path = child.dir().join("libtarget.so");
        compile_shared_object(
            r#"
int exported_fn(int a) { return a + 1; }
"#,
            &so_path,
        );

        let thread = ptrace::attach(child.pid()).expect("cannot attach to child");
        let regs_before = thread.getregs().expect("cannot read registers");
        let flag = (libc::RTLD_NOW | libc::RTLD_GLOBAL) as u32;

        // a failing dlopen comes back as NULL and must leave no trace
        let bogus = dlopen_in_tracee(&thread, Path::new("/does/not/exist.so"), flag)
            .expect("dlopen in tracee failed");
        assert_eq!(bogus, 0, "dlopen of a missing library returned a handle");
        let regs_now = thread.getregs().expect("cannot read registers");
        assert_eq!(regs_before, regs_now);

        let handle =
            dlopen_in_tracee(&thread, &so_path, flag).expect("dlopen in tracee failed");
        assert!(handle != 0, "dlopen in tracee returned NULL");
        let modules = proc::read_modules(child.pid()).expect("cannot read child modules");
        assert!(
            modules.iter().any(|m| m.path == so_path),
            "library not mapped after dlopen"
        );

        let address =
            dlsym_in_tracee(&thread, handle, "exported_fn").expect("dlsym in tracee failed");
        assert!(address != 0, "dlsym in tracee returned NULL");
        let so_name = so_path.to_str().expect("so path is not utf-8");
        let within_module = proc::maps(child.pid())
            .expect("cannot read child maps")
            .iter()
            .any(|m| m.pathname == so_name && m.contains(address));
        assert!(within_module, "resolved address is outside the library");

        let missing =
            dlsym_in_tracee(&thread, handle, "not_there").expect("dlsym in tracee failed");
        assert_eq!(missing, 0, "dlsym found a symbol that does not exist");

        dlclose_in_tracee(&thread, handle).expect("dlclose in tracee failed");
        let modules = proc::read_modules(child.pid()).expect("cannot read child modules");
        assert!(
            !modules.iter().any(|m| m.path == so_path),
            "library still mapped after dlclose"
        );

        let regs_after = thread.getregs().expect("cannot read registers");
        assert_eq!(regs_before, regs_after);

        drop(thread);
        child.finish();
    }
}
