//! Memory of a ptrace-attached process.

use std::sync::atomic::{AtomicU8, Ordering};

use nix::sys::ptrace;
use nix::unistd::Pid;

use super::local::process_vm_read;
use super::Memory;

/// Word-at-a-time fallback using `PTRACE_PEEKTEXT`.
///
/// Handles unaligned starts and tails by copying out of the containing
/// word. Requires the target to be in ptrace-stop.
fn ptrace_read(pid: Pid, addr: u64, dst: &mut [u8]) -> usize {
    const WORD: u64 = std::mem::size_of::<libc::c_long>() as u64;

    if addr.checked_add(dst.len() as u64).is_none() {
        return 0;
    }

    let read_long = |addr: u64| -> Option<libc::c_long> {
        ptrace::read(pid, addr as ptrace::AddressType).ok()
    };

    let mut addr = addr;
    let mut bytes_read = 0usize;
    let mut remaining = dst.len();

    let align_bytes = (addr & (WORD - 1)) as usize;
    if align_bytes != 0 {
        let Some(data) = read_long(addr & !(WORD - 1)) else {
            return 0;
        };
        let data = data.to_ne_bytes();
        let copy_bytes = (WORD as usize - align_bytes).min(remaining);
        dst[..copy_bytes].copy_from_slice(&data[align_bytes..align_bytes + copy_bytes]);
        addr += copy_bytes as u64;
        remaining -= copy_bytes;
        bytes_read += copy_bytes;
    }

    for _ in 0..remaining / WORD as usize {
        let Some(data) = read_long(addr) else {
            return bytes_read;
        };
        dst[bytes_read..bytes_read + WORD as usize].copy_from_slice(&data.to_ne_bytes());
        addr += WORD;
        bytes_read += WORD as usize;
    }

    let left_over = remaining % WORD as usize;
    if left_over != 0 {
        let Some(data) = read_long(addr) else {
            return bytes_read;
        };
        dst[bytes_read..bytes_read + left_over].copy_from_slice(&data.to_ne_bytes()[..left_over]);
        bytes_read += left_over;
    }
    bytes_read
}

const READ_UNKNOWN: u8 = 0;
const READ_VM: u8 = 1;
const READ_PTRACE: u8 = 2;

/// The address space of another process.
///
/// Prefers `process_vm_readv` and latches onto whichever method first
/// returns data, assuming that a method that worked once keeps working.
pub struct MemoryRemote {
    pid: Pid,
    read_method: AtomicU8,
}

impl MemoryRemote {
    /// Creates a view of `pid`'s memory.
    ///
    /// The caller is responsible for having the target stopped (ptrace
    /// attach or seize) for the duration of any reads.
    pub fn new(pid: i32) -> Self {
        MemoryRemote {
            pid: Pid::from_raw(pid),
            read_method: AtomicU8::new(READ_UNKNOWN),
        }
    }

    /// The process this memory reads from.
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl Memory for MemoryRemote {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        // A 32-bit client cannot address 64-bit targets.
        #[cfg(target_pointer_width = "32")]
        if addr > u32::MAX as u64 {
            return 0;
        }

        match self.read_method.load(Ordering::Relaxed) {
            READ_VM => process_vm_read(self.pid, addr, dst),
            READ_PTRACE => ptrace_read(self.pid, addr, dst),
            _ => {
                let bytes = process_vm_read(self.pid, addr, dst);
                if bytes > 0 {
                    self.read_method.store(READ_VM, Ordering::Relaxed);
                    return bytes;
                }
                let bytes = ptrace_read(self.pid, addr, dst);
                if bytes > 0 {
                    self.read_method.store(READ_PTRACE, Ordering::Relaxed);
                }
                bytes
            }
        }
    }
}
