//! The 64-bit RISC-V register file.

use framewalk_common::Arch;

use super::Regs;
use crate::elf::Elf;
use crate::memory::Memory;

const REG_PC: u16 = 0;
const REG_RA: u16 = 1;
const REG_SP: u16 = 2;
const REG_FP: u16 = 8;
/// Slot count actually present in the kernel's register dump.
const REG_REAL_COUNT: u16 = 32;
/// vlenb rides along as an extra pseudo register.
const REG_VLENB: u16 = 32;
const REG_COUNT: u16 = 33;

/// `li a7, __NR_rt_sigreturn ; ecall`
const SIGRETURN_INSTRUCTIONS: [u8; 8] = [0x93, 0x08, 0xb0, 0x08, 0x73, 0x00, 0x00, 0x00];

static NAMES: &[(&str, u16)] = &[
    ("pc", 0),
    ("ra", 1),
    ("sp", 2),
    ("gp", 3),
    ("tp", 4),
    ("t0", 5),
    ("t1", 6),
    ("t2", 7),
    ("s0", 8),
    ("s1", 9),
    ("a0", 10),
    ("a1", 11),
    ("a2", 12),
    ("a3", 13),
    ("a4", 14),
    ("a5", 15),
    ("a6", 16),
    ("a7", 17),
    ("s2", 18),
    ("s3", 19),
    ("s4", 20),
    ("s5", 21),
    ("s6", 22),
    ("s7", 23),
    ("s8", 24),
    ("s9", 25),
    ("s10", 26),
    ("s11", 27),
    ("t3", 28),
    ("t4", 29),
    ("t5", 30),
    ("t6", 31),
    ("vlenb", 32),
];

/// Registers of a paused riscv64 context.
///
/// The pc occupies column zero: the zero register never needs storage and
/// the kernel's register dump puts the pc there anyway.
#[derive(Clone, Debug)]
pub struct RegsRiscv64 {
    regs: [u64; REG_COUNT as usize],
}

impl Default for RegsRiscv64 {
    fn default() -> Self {
        Self {
            regs: [0u64; REG_COUNT as usize],
        }
    }
}

impl RegsRiscv64 {
    /// Creates a zeroed register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates the vendor vlenb CSR column (0x1c22) onto the pseudo
    /// slot; a row naming the pseudo slot directly is never legal input.
    pub fn convert_reg(reg: u16) -> u16 {
        if reg == 0x1c22 {
            return REG_VLENB;
        }
        if reg == REG_VLENB {
            return REG_COUNT;
        }
        reg
    }
}

impl Regs for RegsRiscv64 {
    fn arch(&self) -> Arch {
        Arch::Riscv64
    }

    fn total_regs(&self) -> u16 {
        REG_COUNT
    }

    fn get(&self, reg: u16) -> Option<u64> {
        self.regs.get(Self::convert_reg(reg) as usize).copied()
    }

    fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.regs.get_mut(Self::convert_reg(reg) as usize) {
            *slot = value;
        }
    }

    fn pc(&self) -> u64 {
        self.regs[REG_PC as usize]
    }

    fn sp(&self) -> u64 {
        self.regs[REG_SP as usize]
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs[REG_PC as usize] = pc;
    }

    fn set_sp(&mut self, sp: u64) {
        self.regs[REG_SP as usize] = sp;
    }

    fn set_pc_from_return_address(&mut self, _memory: &dyn Memory) -> bool {
        let ra = self.regs[REG_RA as usize];
        if self.pc() == ra {
            return false;
        }
        self.set_pc(ra);
        true
    }

    fn step_if_signal_handler(
        &mut self,
        rel_pc: u64,
        elf: &Elf,
        process_memory: &dyn Memory,
    ) -> bool {
        let Some(memory) = elf.memory() else {
            return false;
        };
        let mut data = [0u8; 8];
        if !memory.read_fully(rel_pc, &mut data) || data != SIGRETURN_INSTRUCTIONS {
            return false;
        }

        // SP + sizeof(siginfo_t) + uc_mcontext offset + pc offset.
        let addr = self.sp() + 0x80 + 0xb0;
        let mut buf = [0u8; REG_REAL_COUNT as usize * 8];
        if !process_memory.read_fully(addr, &mut buf) {
            return false;
        }
        for (index, chunk) in buf.chunks_exact(8).enumerate() {
            self.regs[index] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        true
    }

    fn fallback_step(&mut self, process_memory: &dyn Memory) -> bool {
        // The frame record sits below the frame pointer: ra at fp - 8,
        // caller's fp at fp - 16.
        let fp = self.regs[REG_FP as usize];
        if fp < 16 || fp & 0x7 != 0 {
            return false;
        }
        let Some(new_pc) = process_memory.read_u64(fp - 8) else {
            return false;
        };
        let Some(new_fp) = process_memory.read_u64(fp - 16) else {
            return false;
        };
        if new_pc == 0 || new_pc == self.pc() {
            return false;
        }
        self.set_sp(fp);
        self.regs[REG_FP as usize] = new_fp;
        self.regs[REG_RA as usize] = new_pc;
        self.set_pc(new_pc);
        true
    }

    fn register_names(&self) -> &'static [(&'static str, u16)] {
        NAMES
    }

    fn clone_boxed(&self) -> Box<dyn Regs> {
        Box::new(self.clone())
    }
}

/// Reads the vlenb vector CSR of a stopped thread via the NT_RISCV_VECTOR
/// regset, sampling our own core when the kernel cannot provide it.
pub fn vlenb_from_remote(pid: i32) -> u64 {
    if pid != 0 {
        // The vector regset starts with { datap, vstart, vl, vtype, vlenb }.
        let mut data = [0u64; 8];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of_val(&data),
        };
        const NT_RISCV_VECTOR: usize = 0x902;
        let result = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET as _,
                pid,
                NT_RISCV_VECTOR as *mut libc::c_void,
                &mut iov as *mut libc::iovec,
            )
        };
        if result != -1 {
            return data[4];
        }
        // Some kernels do not expose the regset; assume all cores match
        // ours. This can be wrong on heterogeneous cores.
    }
    vlenb_from_local()
}

/// Reads vlenb from the current core.
pub fn vlenb_from_local() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let vlenb: u64;
        unsafe {
            std::arch::asm!("csrr {}, 0xc22", out(reg) vlenb);
        }
        return vlenb;
    }
    #[allow(unreachable_code)]
    0
}

/// Builds a register file from an NT_PRSTATUS regset dump (pc, x1..x31).
#[cfg(target_arch = "riscv64")]
pub(crate) fn from_user_regs(data: &[u64; 64], pid: i32) -> RegsRiscv64 {
    let mut regs = RegsRiscv64::new();
    regs.regs[..REG_REAL_COUNT as usize].copy_from_slice(&data[..REG_REAL_COUNT as usize]);
    regs.regs[REG_VLENB as usize] = vlenb_from_remote(pid);
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlenb_column_conversion() {
        assert_eq!(RegsRiscv64::convert_reg(0x1c22), REG_VLENB);
        assert_eq!(RegsRiscv64::convert_reg(REG_VLENB), REG_COUNT);
        assert_eq!(RegsRiscv64::convert_reg(2), 2);

        let mut regs = RegsRiscv64::new();
        regs.set(0x1c22, 16);
        assert_eq!(regs.get(0x1c22), Some(16));
        // The raw pseudo column is rejected.
        assert_eq!(regs.get(REG_VLENB), None);
    }

    #[test]
    fn test_fallback_step() {
        let mut stack = vec![0u8; 32];
        // fp = 0x1010: caller fp at 0x1000, ra at 0x1008.
        stack[0..8].copy_from_slice(&0x2020u64.to_le_bytes());
        stack[8..16].copy_from_slice(&0x40000u64.to_le_bytes());
        let memory = crate::memory::MemoryOfflineBuffer::new(stack, 0x1000);

        let mut regs = RegsRiscv64::new();
        regs.set(REG_FP, 0x1010);
        assert!(regs.fallback_step(&memory));
        assert_eq!(regs.pc(), 0x40000);
        assert_eq!(regs.sp(), 0x1010);
        assert_eq!(regs.get(REG_FP), Some(0x2020));
    }
}
