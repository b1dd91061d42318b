use libc::{c_long, c_void, MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use simple_error::{bail, try_with};

use crate::cpu;
use crate::ptrace::Thread;
use crate::result::Result;

/// Scoped syscall injection: saves the thread's registers and the text word
/// under its instruction pointer, patches in a `syscall` instruction, and puts
/// both back when dropped. The thread must be stopped.
struct RemoteSyscall<'a> {
    thread: &'a Thread,
    saved_regs: cpu::Regs,
    saved_text: c_long,
}

impl<'a> RemoteSyscall<'a> {
    fn new(thread: &'a Thread) -> Result<Self> {
        let saved_regs = try_with!(
            thread.getregs(),
            "cannot back up registers of {}",
            thread.tid
        );
        let ip = saved_regs.ip();
        let saved_text = try_with!(
            thread.read(ip as *mut c_void),
            "cannot read text at {:#x}",
            ip
        );
        try_with!(
            unsafe { thread.write(ip as *mut c_void, cpu::SYSCALL_TEXT as *mut c_void) },
            "cannot patch syscall instruction"
        );
        Ok(RemoteSyscall {
            thread,
            saved_regs,
            saved_text,
        })
    }

    /// Run one syscall in the tracee and return its raw result register.
    fn syscall(&self, nr: u64, args: &[u64; 6]) -> Result<i64> {
        let regs = self.saved_regs.prepare_syscall(&[
            nr, args[0], args[1], args[2], args[3], args[4], args[5],
        ]);
        try_with!(self.thread.setregs(&regs), "cannot set syscall arguments");
        loop {
            try_with!(self.thread.syscall(), "cannot resume tracee to syscall");
            let mut status = try_with!(waitpid(self.thread.tid, None), "waitpid failed");

            if let WaitStatus::Stopped(_, Signal::SIGTRAP) = status {
                // stopped at syscall entry, drive it to the exit stop
                try_with!(self.thread.syscall(), "cannot resume tracee to syscall");
                status = try_with!(waitpid(self.thread.tid, None), "waitpid failed");
            }

            match status {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let result_regs =
                        try_with!(self.thread.getregs(), "cannot read syscall result");
                    assert!(self.saved_regs.ip() == result_regs.ip() - cpu::SYSCALL_SIZE);
                    return Ok(result_regs.syscall_ret() as i64);
                }
                WaitStatus::Stopped(_, signal) => {
                    bail!("tracee was stopped by unexpected signal: {}", signal);
                }
                WaitStatus::Exited(_, status) => bail!("tracee exited with: {}", status),
                WaitStatus::Signaled(_, signal, _) => {
                    bail!("tracee was killed by signal: {}", signal)
                }
                WaitStatus::PtraceEvent(_, _, _) => bail!("got unexpected ptrace event"),
                WaitStatus::PtraceSyscall(_) => bail!("got unexpected ptrace syscall event"),
                WaitStatus::StillAlive => bail!("got unexpected still-alive waitpid() event"),
                WaitStatus::Continued(_) => {} // noop
            }
        }
    }
}

impl<'a> Drop for RemoteSyscall<'a> {
    fn drop(&mut self) {
        let ip = self.saved_regs.ip();
        if let Err(e) = unsafe {
            self.thread
                .write(ip as *mut c_void, self.saved_text as *mut c_void)
        } {
            log::warn!("cannot restore text at {:#x}: {}", ip, e);
        }
        if let Err(e) = self.thread.setregs(&self.saved_regs) {
            log::warn!("cannot restore registers of {}: {}", self.thread.tid, e);
        }
    }
}

/// Map a page-aligned, readable, writable and executable region of at least
/// `size` bytes into the tracee.
pub fn allocate_in_tracee(thread: &Thread, size: u64) -> Result<u64> {
    let injection = RemoteSyscall::new(thread)?;
    let ret = try_with!(
        injection.syscall(
            libc::SYS_mmap as u64,
            &[
                0,
                size,
                (PROT_READ | PROT_WRITE | PROT_EXEC) as u64,
                (MAP_PRIVATE | MAP_ANONYMOUS) as u64,
                (-1_i64) as u64,
                0,
            ],
        ),
        "cannot inject mmap into tracee"
    );
    if ret < 0 {
        bail!("mmap in tracee failed: {}", Errno::from_i32(-ret as i32));
    }
    log::debug!("allocated {} bytes at {:#x} in tracee", size, ret);
    Ok(ret as u64)
}

/// Unmap a region previously returned by `allocate_in_tracee`.
pub fn free_in_tracee(thread: &Thread, address: u64, size: u64) -> Result<()> {
    let injection = RemoteSyscall::new(thread)?;
    let ret = try_with!(
        injection.syscall(libc::SYS_munmap as u64, &[address, size, 0, 0, 0, 0]),
        "cannot inject munmap into tracee"
    );
    if ret != 0 {
        bail!("munmap in tracee failed: {}", Errno::from_i32(-ret as i32));
    }
    log::debug!("freed {} bytes at {:#x} in tracee", size, address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc;
    use crate::testutil::TracedChild;
    use crate::{memory, ptrace};

    #[test]
    fn test_allocate_write_read_free() {
        let mut child = TracedChild::spawn();
        let thread = ptrace::attach(child.pid()).expect("cannot attach to child");

        let address = allocate_in_tracee(&thread, 4096).expect("cannot allocate in tracee");
        assert_eq!(address % 4096, 0);
        let mapped = proc::maps(child.pid())
            .expect("cannot read child maps")
            .iter()
            .any(|m| m.contains(address));
        assert!(mapped);

        let data = b"scratch bytes".to_vec();
        memory::write_bytes(child.pid(), address, &data).expect("cannot write to tracee");
        let read = memory::read_bytes(child.pid(), address, data.len())
            .expect("cannot read back from tracee");
        assert_eq!(read, data);

        free_in_tracee(&thread, address, 4096).expect("cannot free in tracee");
        let mapped = proc::maps(child.pid())
            .expect("cannot read child maps")
            .iter()
            .any(|m| m.contains(address));
        assert!(!mapped);

        drop(thread);
        child.finish();
    }
}
