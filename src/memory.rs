use nix::sys::uio::{process_vm_readv, process_vm_writev, IoVec, RemoteIoVec};
use nix::unistd::Pid;
use simple_error::{bail, try_with};

use crate::result::Result;

/// Read `len` bytes from the tracee's address space.
pub fn read_bytes(pid: Pid, address: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    let local = [IoVec::from_mut_slice(&mut buf)];
    let remote = [RemoteIoVec {
        base: address as usize,
        len,
    }];
    let read = try_with!(
        process_vm_readv(pid, &local, &remote),
        "cannot read {} bytes at {:#x} from process {}",
        len,
        address,
        pid
    );
    if read != len {
        bail!(
            "short read from process {}: {} bytes instead of {}",
            pid,
            read,
            len
        );
    }
    Ok(buf)
}

/// Write `bytes` into the tracee's address space. No alignment requirement.
pub fn write_bytes(pid: Pid, address: u64, bytes: &[u8]) -> Result<()> {
    let local = [IoVec::from_slice(bytes)];
    let remote = [RemoteIoVec {
        base: address as usize,
        len: bytes.len(),
    }];
    let written = try_with!(
        process_vm_writev(pid, &local, &remote),
        "cannot write {} bytes at {:#x} to process {}",
        bytes.len(),
        address,
        pid
    );
    if written != bytes.len() {
        bail!(
            "short write to process {}: {} bytes instead of {}",
            pid,
            written,
            bytes.len()
        );
    }
    Ok(())
}
