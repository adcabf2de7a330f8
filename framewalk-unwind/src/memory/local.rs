//! Memory of the calling process.

use std::io::IoSliceMut;

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

use super::Memory;

/// No element of a single scatter request may straddle a page, and the
/// kernel caps the iovec count per call.
const MAX_IOVECS: usize = 64;

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Bulk-reads from `pid` using `process_vm_readv`.
///
/// The remote span is split at page boundaries because a partial transfer
/// applies at the granularity of iovec elements: an element touching an
/// unmapped page would otherwise drag down readable neighbours.
pub(crate) fn process_vm_read(pid: Pid, remote_src: u64, dst: &mut [u8]) -> usize {
    let page_size = page_size() as u64;

    let mut cur = remote_src;
    let mut len = dst.len();
    let mut total_read = 0usize;

    while len > 0 {
        let mut remote_iovs = Vec::with_capacity(MAX_IOVECS);
        let mut chunk_len = 0usize;
        while len > 0 && remote_iovs.len() < MAX_IOVECS {
            if cur >= usize::MAX as u64 {
                return total_read;
            }
            let misalignment = cur & (page_size - 1);
            let iov_len = ((page_size - misalignment) as usize).min(len);
            remote_iovs.push(RemoteIoVec {
                base: cur as usize,
                len: iov_len,
            });
            len -= iov_len;
            let Some(next) = cur.checked_add(iov_len as u64) else {
                return total_read;
            };
            cur = next;
            chunk_len += iov_len;
        }

        let local = &mut dst[total_read..total_read + chunk_len];
        let mut local_iovs = [IoSliceMut::new(local)];
        match process_vm_readv(pid, &mut local_iovs, &remote_iovs) {
            Ok(read) => {
                total_read += read;
                if read != chunk_len {
                    return total_read;
                }
            }
            Err(_) => return total_read,
        }
    }
    total_read
}

/// The address space of the process the unwinder itself runs in.
///
/// Uses the same scatter/gather syscall as the remote variant, pointed at
/// our own pid; this keeps wild pointers from faulting the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryLocal;

impl MemoryLocal {
    /// Creates a view of the calling process's memory.
    pub fn new() -> Self {
        MemoryLocal
    }
}

impl Memory for MemoryLocal {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        process_vm_read(nix::unistd::getpid(), addr, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_data() {
        let data: Vec<u8> = (0..255).collect();
        let memory = MemoryLocal::new();
        let mut dst = vec![0u8; data.len()];
        assert!(memory.read_fully(data.as_ptr() as u64, &mut dst));
        assert_eq!(dst, data);
    }

    #[test]
    fn test_read_unmapped() {
        let memory = MemoryLocal::new();
        let mut dst = [0u8; 8];
        // Page zero is never mapped.
        assert_eq!(memory.read(0x10, &mut dst), 0);
    }

    #[test]
    fn test_read_straddles_unreadable_page() {
        // A large read that runs off the end of a mapping returns the
        // readable prefix.
        let page = page_size();
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(map, libc::MAP_FAILED);

        let memory = MemoryLocal::new();
        let mut dst = vec![0u8; page * 2];
        let read = memory.read(map as u64, &mut dst);
        // At least the first page must be readable; the second may or may
        // not be mapped depending on layout.
        assert!(read >= page);

        unsafe { libc::munmap(map, page) };
    }
}
