//! The 32-bit ARM register file.

use framewalk_common::Arch;

use super::Regs;
use crate::elf::Elf;
use crate::memory::Memory;

const REG_SP: u16 = 13;
const REG_LR: u16 = 14;
const REG_PC: u16 = 15;
const REG_COUNT: u16 = 16;

static NAMES: &[(&str, u16)] = &[
    ("r0", 0),
    ("r1", 1),
    ("r2", 2),
    ("r3", 3),
    ("r4", 4),
    ("r5", 5),
    ("r6", 6),
    ("r7", 7),
    ("r8", 8),
    ("r9", 9),
    ("r10", 10),
    ("r11", 11),
    ("ip", 12),
    ("r12", 12),
    ("sp", 13),
    ("lr", 14),
    ("pc", 15),
];

/// Registers of a paused 32-bit ARM context.
#[derive(Clone, Debug, Default)]
pub struct RegsArm {
    regs: [u64; REG_COUNT as usize],
}

impl RegsArm {
    /// Creates a zeroed register file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Regs for RegsArm {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn total_regs(&self) -> u16 {
        REG_COUNT
    }

    fn get(&self, reg: u16) -> Option<u64> {
        self.regs.get(reg as usize).copied()
    }

    fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value as u32 as u64;
        }
    }

    fn pc(&self) -> u64 {
        self.regs[REG_PC as usize]
    }

    fn sp(&self) -> u64 {
        self.regs[REG_SP as usize]
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs[REG_PC as usize] = pc as u32 as u64;
    }

    fn set_sp(&mut self, sp: u64) {
        self.regs[REG_SP as usize] = sp as u32 as u64;
    }

    fn set_pc_from_return_address(&mut self, _memory: &dyn Memory) -> bool {
        let ra = self.regs[REG_LR as usize];
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
        let Some(data) = elf.memory().and_then(|memory| memory.read_u32(rel_pc)) else {
            return false;
        };

        let offset = match data {
            // mov r7, #0x77 / svc 0x900077 / thumb svc: non-RT sigreturn.
            // SP + uc_mcontext offset + r0 offset.
            0xe3a07077 | 0xef900077 | 0xdf002777 => self.sp() + 0x14 + 0xc,
            // mov r7, #0xad variants: rt_sigreturn.
            // SP + sizeof(siginfo_t) + uc_mcontext offset + r0 offset.
            0xe3a070ad | 0xef9000ad | 0xdf0027ad => self.sp() + 0x80 + 0x14 + 0xc,
            _ => return false,
        };

        let mut buf = [0u8; REG_COUNT as usize * 4];
        if !process_memory.read_fully(offset, &mut buf) {
            return false;
        }
        for (index, chunk) in buf.chunks_exact(4).enumerate() {
            self.regs[index] = u32::from_le_bytes(chunk.try_into().unwrap()) as u64;
        }
        true
    }

    fn pc_adjustment(&self, rel_pc: u64, elf: &Elf) -> u64 {
        if rel_pc < 5 {
            return 0;
        }
        if rel_pc & 1 != 0 {
            // Thumb mode: the call could be a 2 or 4 byte instruction.
            let value = elf
                .memory()
                .and_then(|memory| memory.read_u32(rel_pc - 5));
            match value {
                Some(value) if value & 0xe000f000 == 0xe000f000 => 4,
                _ => 2,
            }
        } else {
            4
        }
    }

    fn register_names(&self) -> &'static [(&'static str, u16)] {
        NAMES
    }

    fn clone_boxed(&self) -> Box<dyn Regs> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_zero_extended() {
        let mut regs = RegsArm::new();
        regs.set(0, 0xdead_beef_f00d_0001);
        assert_eq!(regs.get(0), Some(0xf00d_0001));
    }

    #[test]
    fn test_signal_frame_non_rt() {
        // Module memory holding the non-RT sigreturn stub at pc 0.
        let stub = crate::memory::MemoryBuffer::new(0xe3a07077u32.to_le_bytes().to_vec());
        let elf = Elf::new(Some(Box::new(stub)));

        // Signal frame: r0..r15 at sp + 0x20.
        let sp = 0x8000u64;
        let mut stack = vec![0u8; 0x100];
        for reg in 0..16u32 {
            let offset = (0x14 + 0xc + reg * 4) as usize;
            stack[offset..offset + 4].copy_from_slice(&(0x100 + reg).to_le_bytes());
        }
        let process = crate::memory::MemoryOfflineBuffer::new(stack, sp);

        let mut regs = RegsArm::new();
        regs.set_sp(sp);
        assert!(regs.step_if_signal_handler(0, &elf, &process));
        assert_eq!(regs.get(0), Some(0x100));
        assert_eq!(regs.pc(), 0x10f);
        assert_eq!(regs.sp(), 0x10d);
    }
}
