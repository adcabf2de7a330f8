//! The 32- and 64-bit MIPS register files.

use framewalk_common::Arch;

use super::Regs;
use crate::elf::Elf;
use crate::memory::Memory;

const REG_SP: u16 = 29;
const REG_RA: u16 = 31;
const REG_PC: u16 = 32;
const REG_COUNT: u16 = 33;

static NAMES: &[(&str, u16)] = &[
    ("zero", 0),
    ("at", 1),
    ("v0", 2),
    ("v1", 3),
    ("a0", 4),
    ("a1", 5),
    ("a2", 6),
    ("a3", 7),
    ("t0", 8),
    ("t1", 9),
    ("t2", 10),
    ("t3", 11),
    ("t4", 12),
    ("t5", 13),
    ("t6", 14),
    ("t7", 15),
    ("s0", 16),
    ("s1", 17),
    ("s2", 18),
    ("s3", 19),
    ("s4", 20),
    ("s5", 21),
    ("s6", 22),
    ("s7", 23),
    ("t8", 24),
    ("t9", 25),
    ("k0", 26),
    ("k1", 27),
    ("gp", 28),
    ("sp", 29),
    ("fp", 30),
    ("ra", 31),
    ("pc", 32),
];

/// The signal frame's register block: pc followed by r0..r31, all held as
/// 64-bit values even for O32.
fn read_signal_regs(
    regs: &mut [u64; REG_COUNT as usize],
    process_memory: &dyn Memory,
    sigcontext: u64,
    mask32: bool,
) -> bool {
    let Some(pc) = process_memory.read_u64(sigcontext + 8) else {
        return false;
    };
    let mut buf = [0u8; 32 * 8];
    if !process_memory.read_fully(sigcontext + 16, &mut buf) {
        return false;
    }
    for (index, chunk) in buf.chunks_exact(8).enumerate() {
        let value = u64::from_le_bytes(chunk.try_into().unwrap());
        regs[index] = if mask32 { value as u32 as u64 } else { value };
    }
    regs[REG_PC as usize] = if mask32 { pc as u32 as u64 } else { pc };
    true
}

macro_rules! mips_regs {
    ($name:ident, $arch:expr, $mask32:expr, $sigreturn:expr, $rt_sigreturn:expr,
     $rt_mcontext:expr) => {
        /// Registers of a paused MIPS context.
        #[derive(Clone, Debug)]
        pub struct $name {
            regs: [u64; REG_COUNT as usize],
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    regs: [0u64; REG_COUNT as usize],
                }
            }
        }

        impl $name {
            /// Creates a zeroed register file.
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Regs for $name {
            fn arch(&self) -> Arch {
                $arch
            }

            fn total_regs(&self) -> u16 {
                REG_COUNT
            }

            fn get(&self, reg: u16) -> Option<u64> {
                self.regs.get(reg as usize).copied()
            }

            fn set(&mut self, reg: u16, value: u64) {
                if let Some(slot) = self.regs.get_mut(reg as usize) {
                    *slot = if $mask32 { value as u32 as u64 } else { value };
                }
            }

            fn pc(&self) -> u64 {
                self.regs[REG_PC as usize]
            }

            fn sp(&self) -> u64 {
                self.regs[REG_SP as usize]
            }

            fn set_pc(&mut self, pc: u64) {
                self.set(REG_PC, pc);
            }

            fn set_sp(&mut self, sp: u64) {
                self.set(REG_SP, sp);
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
                // li v0, <nr> ; syscall
                let Some(data) = elf.memory().and_then(|memory| memory.read_u64(rel_pc))
                else {
                    return false;
                };
                let sigcontext = if data == 0x0000000c_u64 << 32 | $sigreturn {
                    // Non-RT frame: the sigcontext follows the sigframe
                    // header on the stack.
                    self.sp() + 24
                } else if data == 0x0000000c_u64 << 32 | $rt_sigreturn {
                    // RT frame: header, siginfo, then the ucontext.
                    self.sp() + 24 + 128 + $rt_mcontext
                } else {
                    return false;
                };
                read_signal_regs(&mut self.regs, process_memory, sigcontext, $mask32)
            }

            fn register_names(&self) -> &'static [(&'static str, u16)] {
                NAMES
            }

            fn clone_boxed(&self) -> Box<dyn Regs> {
                Box::new(self.clone())
            }
        }
    };
}

mips_regs!(RegsMips32, Arch::Mips32, true, 0x24021017u64, 0x24021061u64, 24);
mips_regs!(RegsMips64, Arch::Mips64, false, 0x2402145bu64, 0x2402145bu64, 40);
