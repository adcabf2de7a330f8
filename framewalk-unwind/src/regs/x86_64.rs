//! The 64-bit x86 register file.

use framewalk_common::Arch;

use super::Regs;
use crate::elf::Elf;
use crate::memory::Memory;

const REG_RSP: u16 = 7;
const REG_RIP: u16 = 16;
const REG_COUNT: u16 = 17;

static NAMES: &[(&str, u16)] = &[
    ("rax", 0),
    ("rdx", 1),
    ("rcx", 2),
    ("rbx", 3),
    ("rsi", 4),
    ("rdi", 5),
    ("rbp", 6),
    ("rsp", 7),
    ("r8", 8),
    ("r9", 9),
    ("r10", 10),
    ("r11", 11),
    ("r12", 12),
    ("r13", 13),
    ("r14", 14),
    ("r15", 15),
    ("rip", 16),
];

/// Registers of a paused x86-64 context.
#[derive(Clone, Debug, Default)]
pub struct RegsX86_64 {
    regs: [u64; REG_COUNT as usize],
}

impl RegsX86_64 {
    /// Creates a zeroed register file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Regs for RegsX86_64 {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn total_regs(&self) -> u16 {
        REG_COUNT
    }

    fn get(&self, reg: u16) -> Option<u64> {
        self.regs.get(reg as usize).copied()
    }

    fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value;
        }
    }

    fn pc(&self) -> u64 {
        self.regs[REG_RIP as usize]
    }

    fn sp(&self) -> u64 {
        self.regs[REG_RSP as usize]
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs[REG_RIP as usize] = pc;
    }

    fn set_sp(&mut self, sp: u64) {
        self.regs[REG_RSP as usize] = sp;
    }

    fn set_pc_from_return_address(&mut self, memory: &dyn Memory) -> bool {
        // The return address lives on the stack.
        let Some(new_pc) = memory.read_u64(self.sp()) else {
            return false;
        };
        if new_pc == self.pc() {
            return false;
        }
        self.set_pc(new_pc);
        self.set_sp(self.sp() + 8);
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
        // mov $__NR_rt_sigreturn, %rax ; syscall
        let Some(data) = memory.read_u64(rel_pc) else {
            return false;
        };
        if data != 0x0f0000000fc0c748 {
            return false;
        }
        match memory.read_u8(rel_pc + 8) {
            Some(0x05) => {}
            _ => return false,
        }

        // The stack holds the ucontext; the mcontext starts at 0x28.
        let mcontext = self.sp() + 0x28;
        let mut buf = [0u8; 17 * 8];
        if !process_memory.read_fully(mcontext, &mut buf) {
            return false;
        }
        let word = |index: usize| -> u64 {
            u64::from_le_bytes(buf[index * 8..index * 8 + 8].try_into().unwrap())
        };
        // sigcontext order: r8..r15, rdi, rsi, rbp, rbx, rdx, rax, rcx,
        // rsp, rip.
        for reg in 0..8 {
            self.regs[8 + reg] = word(reg);
        }
        self.regs[5] = word(8); // rdi
        self.regs[4] = word(9); // rsi
        self.regs[6] = word(10); // rbp
        self.regs[3] = word(11); // rbx
        self.regs[1] = word(12); // rdx
        self.regs[0] = word(13); // rax
        self.regs[2] = word(14); // rcx
        self.regs[REG_RSP as usize] = word(15);
        self.regs[REG_RIP as usize] = word(16);
        true
    }

    fn register_names(&self) -> &'static [(&'static str, u16)] {
        NAMES
    }

    fn clone_boxed(&self) -> Box<dyn Regs> {
        Box::new(self.clone())
    }
}

/// Captures the calling thread's pc, sp and callee-saved registers.
#[cfg(target_arch = "x86_64")]
pub(crate) fn capture_local() -> RegsX86_64 {
    let mut regs = RegsX86_64::new();
    let (rip, rsp, rbp, rbx): (u64, u64, u64, u64);
    let (r12, r13, r14, r15): (u64, u64, u64, u64);
    unsafe {
        std::arch::asm!(
            "lea {rip}, [rip]",
            "mov {rsp}, rsp",
            "mov {rbp}, rbp",
            "mov {rbx}, rbx",
            rip = out(reg) rip,
            rsp = out(reg) rsp,
            rbp = out(reg) rbp,
            rbx = out(reg) rbx,
        );
        std::arch::asm!(
            "mov {r12}, r12",
            "mov {r13}, r13",
            "mov {r14}, r14",
            "mov {r15}, r15",
            r12 = out(reg) r12,
            r13 = out(reg) r13,
            r14 = out(reg) r14,
            r15 = out(reg) r15,
        );
    }
    regs.set_pc(rip);
    regs.set_sp(rsp);
    regs.regs[6] = rbp;
    regs.regs[3] = rbx;
    regs.regs[12] = r12;
    regs.regs[13] = r13;
    regs.regs[14] = r14;
    regs.regs[15] = r15;
    regs
}

/// Builds a register file from an NT_PRSTATUS regset dump
/// (`struct user_regs_struct`).
#[cfg(target_arch = "x86_64")]
pub(crate) fn from_user_regs(data: &[u64; 64]) -> RegsX86_64 {
    // user_regs_struct order: r15, r14, r13, r12, rbp, rbx, r11, r10, r9,
    // r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip, cs, eflags, rsp, ss.
    let mut regs = RegsX86_64::new();
    regs.regs[15] = data[0];
    regs.regs[14] = data[1];
    regs.regs[13] = data[2];
    regs.regs[12] = data[3];
    regs.regs[6] = data[4];
    regs.regs[3] = data[5];
    regs.regs[11] = data[6];
    regs.regs[10] = data[7];
    regs.regs[9] = data[8];
    regs.regs[8] = data[9];
    regs.regs[0] = data[10];
    regs.regs[2] = data[11];
    regs.regs[1] = data[12];
    regs.regs[4] = data[13];
    regs.regs[5] = data[14];
    regs.regs[16] = data[16];
    regs.regs[7] = data[19];
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_frame() {
        let stub_bytes = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
        let stub = crate::memory::MemoryBuffer::new(stub_bytes.to_vec());
        let elf = Elf::new(Some(Box::new(stub)));

        let sp = 0x7000u64;
        let mut image = vec![0u8; 0x200];
        let mcontext = 0x28usize;
        image[mcontext + 16 * 8..mcontext + 17 * 8]
            .copy_from_slice(&0x561550b17a80u64.to_le_bytes());
        image[mcontext + 15 * 8..mcontext + 16 * 8]
            .copy_from_slice(&0x7ffcc8596ce8u64.to_le_bytes());
        let process = crate::memory::MemoryOfflineBuffer::new(image, sp);

        let mut regs = RegsX86_64::new();
        regs.set_sp(sp);
        assert!(regs.step_if_signal_handler(0, &elf, &process));
        assert_eq!(regs.pc(), 0x561550b17a80);
        assert_eq!(regs.sp(), 0x7ffcc8596ce8);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_capture_local() {
        let regs = capture_local();
        assert_ne!(regs.pc(), 0);
        assert_ne!(regs.sp(), 0);
    }
}
