//! Per-architecture register files.
//!
//! Registers are indexed by their DWARF column numbers, so CFI rows apply
//! without translation. All values are held as `u64`; 32-bit architectures
//! zero-extend. Each file knows how to recognize its kernel's
//! signal-return trampoline and, on a narrow set of architectures, how to
//! walk frame pointers as a last resort.

use std::fmt;

use framewalk_common::Arch;

use crate::elf::Elf;
use crate::memory::Memory;

mod arm;
mod arm64;
mod mips;
mod riscv64;
mod x86;
mod x86_64;

pub use arm::RegsArm;
pub use arm64::RegsArm64;
pub use mips::{RegsMips32, RegsMips64};
pub use riscv64::{vlenb_from_local, vlenb_from_remote, RegsRiscv64};
pub use x86::RegsX86;
pub use x86_64::RegsX86_64;

/// A register file for one paused execution context.
///
/// The unwinder consumes the file in place; callers clone first if they
/// want to replay.
pub trait Regs: Send {
    /// The architecture this file belongs to.
    fn arch(&self) -> Arch;

    /// The number of register slots, including pc/sp pseudo slots.
    fn total_regs(&self) -> u16;

    /// Reads a register by DWARF column number.
    fn get(&self, reg: u16) -> Option<u64>;

    /// Writes a register by DWARF column number.
    fn set(&mut self, reg: u16, value: u64);

    /// The current program counter.
    fn pc(&self) -> u64;

    /// The current stack pointer.
    fn sp(&self) -> u64;

    /// Sets the program counter.
    fn set_pc(&mut self, pc: u64);

    /// Sets the stack pointer.
    fn set_sp(&mut self, sp: u64);

    /// The bits a pointer-authenticating CPU may have inserted into
    /// return-address registers. Zero on everything but arm64.
    fn pac_mask(&self) -> u64 {
        0
    }

    /// Replaces the pc with the return-address register's value.
    ///
    /// Returns false if that would not change the pc. Architectures that
    /// keep the return address on the stack read it through `memory`.
    fn set_pc_from_return_address(&mut self, memory: &dyn Memory) -> bool;

    /// Recognizes a kernel signal-return trampoline at `rel_pc` and, on a
    /// match, reloads this file from the signal frame on the stack.
    fn step_if_signal_handler(
        &mut self,
        rel_pc: u64,
        elf: &Elf,
        process_memory: &dyn Memory,
    ) -> bool;

    /// Last-resort stepper when no CFI covers the pc. Walks frame pointers
    /// where the ABI reserves one; returns false elsewhere.
    fn fallback_step(&mut self, _process_memory: &dyn Memory) -> bool {
        false
    }

    /// How far to back the pc up over the call site for this frame.
    fn pc_adjustment(&self, rel_pc: u64, _elf: &Elf) -> u64 {
        self.arch().pc_adjustment(rel_pc)
    }

    /// The register names of this architecture, in snapshot (`regs.txt`)
    /// order, paired with their column numbers.
    fn register_names(&self) -> &'static [(&'static str, u16)];

    /// Clones the file behind a box.
    fn clone_boxed(&self) -> Box<dyn Regs>;

    /// Sets a register by its snapshot name. Returns false for unknown
    /// names.
    fn set_from_name(&mut self, name: &str, value: u64) -> bool {
        for &(known, reg) in self.register_names() {
            if known == name {
                self.set(reg, value);
                return true;
            }
        }
        false
    }

    /// Iterates `(name, value)` pairs in snapshot order.
    fn iter_registers(&self) -> Vec<(&'static str, u64)> {
        self.register_names()
            .iter()
            .map(|&(name, reg)| (name, self.get(reg).unwrap_or(0)))
            .collect()
    }
}

impl Clone for Box<dyn Regs> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

impl fmt::Debug for dyn Regs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter_registers() {
            map.entry(&name, &format_args!("{value:#x}"));
        }
        map.finish()
    }
}

/// Creates an empty register file for `arch`.
pub fn regs_for_arch(arch: Arch) -> Box<dyn Regs> {
    match arch {
        Arch::Arm => Box::new(RegsArm::new()),
        Arch::Arm64 => Box::new(RegsArm64::new()),
        Arch::X86 => Box::new(RegsX86::new()),
        Arch::X86_64 => Box::new(RegsX86_64::new()),
        Arch::Riscv64 => Box::new(RegsRiscv64::new()),
        Arch::Mips32 => Box::new(RegsMips32::new()),
        Arch::Mips64 => Box::new(RegsMips64::new()),
        _ => unreachable!("unhandled architecture"),
    }
}

/// Captures the registers of the calling thread.
///
/// Only the program counter, stack pointer and callee-saved registers are
/// meaningful; caller-saved registers are whatever the capture sequence
/// left in them. Returns `None` on architectures without a capture
/// sequence.
pub fn local_regs() -> Option<Box<dyn Regs>> {
    #[cfg(target_arch = "x86_64")]
    return Some(Box::new(x86_64::capture_local()));
    #[cfg(target_arch = "aarch64")]
    return Some(Box::new(arm64::capture_local()));
    #[allow(unreachable_code)]
    None
}

/// Reads the registers of a ptrace-stopped thread of the same architecture
/// as this process.
pub fn remote_regs(pid: i32) -> Option<Box<dyn Regs>> {
    let mut data = [0u64; 64];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: std::mem::size_of_val(&data),
    };
    // NT_PRSTATUS regset.
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET as _,
            pid,
            1usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if result == -1 {
        return None;
    }

    #[cfg(target_arch = "x86_64")]
    return Some(Box::new(x86_64::from_user_regs(&data)));
    #[cfg(target_arch = "aarch64")]
    return Some(Box::new(arm64::from_user_regs(&data)));
    #[cfg(target_arch = "riscv64")]
    return Some(Box::new(riscv64::from_user_regs(&data, pid)));
    #[allow(unreachable_code)]
    {
        let _ = data;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regs_for_arch_layout() {
        for arch in [
            Arch::Arm,
            Arch::Arm64,
            Arch::X86,
            Arch::X86_64,
            Arch::Riscv64,
            Arch::Mips32,
            Arch::Mips64,
        ] {
            let regs = regs_for_arch(arch);
            assert_eq!(regs.arch(), arch);
            assert!(regs.total_regs() > 0);
            assert!(regs.get(regs.total_regs()).is_none());
        }
    }

    #[test]
    fn test_set_from_name() {
        let mut regs = regs_for_arch(Arch::Arm64);
        assert!(regs.set_from_name("pc", 0x64d09d4fd8));
        assert!(regs.set_from_name("sp", 0x7fe0d84040));
        assert!(regs.set_from_name("x30", 0x1234));
        assert!(!regs.set_from_name("vlenb", 1));
        assert_eq!(regs.pc(), 0x64d09d4fd8);
        assert_eq!(regs.sp(), 0x7fe0d84040);
        assert_eq!(regs.get(30), Some(0x1234));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut regs = regs_for_arch(Arch::X86_64);
        regs.set_pc(0x1000);
        let copy = regs.clone_boxed();
        regs.set_pc(0x2000);
        assert_eq!(copy.pc(), 0x1000);
        assert_eq!(regs.pc(), 0x2000);
    }
}
