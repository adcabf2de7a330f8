//! Architecture types used across `framewalk`.

use std::fmt;
use std::str;

use thiserror::Error;

/// An error returned when parsing an unknown [`Arch`] from a string.
#[derive(Debug, Error)]
#[error("unknown architecture")]
pub struct UnknownArchError;

/// A CPU architecture the unwinding engine understands.
///
/// The architecture determines the width of registers and pointers, the
/// layout of the register file, the opcode signatures of kernel signal
/// trampolines, and how return addresses relate to call sites.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Arch {
    /// 32-bit ARM (ARMv7 and below, including Thumb).
    Arm,
    /// 64-bit ARM (AArch64).
    Arm64,
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X86_64,
    /// 64-bit RISC-V.
    Riscv64,
    /// 32-bit MIPS.
    Mips32,
    /// 64-bit MIPS.
    Mips64,
}

impl Arch {
    /// Returns the size in bytes of pointers and general-purpose registers.
    pub fn pointer_size(self) -> usize {
        match self {
            Arch::Arm | Arch::X86 | Arch::Mips32 => 4,
            Arch::Arm64 | Arch::X86_64 | Arch::Riscv64 | Arch::Mips64 => 8,
        }
    }

    /// Returns true if this architecture stores registers in 64 bits.
    pub fn is_64bit(self) -> bool {
        self.pointer_size() == 8
    }

    /// The maximum value a register can hold on this architecture.
    ///
    /// Arithmetic in DWARF expressions wraps at this width.
    pub fn word_mask(self) -> u64 {
        match self.pointer_size() {
            4 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }

    /// How far to back up the program counter of a non-leaf frame so that it
    /// points into the call instruction rather than the return site.
    ///
    /// On arm, the adjustment depends on whether the call site was a thumb
    /// instruction; the register file refines this value with a memory read.
    /// The value returned here is the architecture's default.
    pub fn pc_adjustment(self, rel_pc: u64) -> u64 {
        match self {
            Arch::Arm => {
                if rel_pc < 5 {
                    0
                } else {
                    4
                }
            }
            Arch::Arm64 => {
                if rel_pc < 4 {
                    0
                } else {
                    4
                }
            }
            Arch::X86 | Arch::X86_64 => {
                if rel_pc == 0 {
                    0
                } else {
                    1
                }
            }
            Arch::Riscv64 => {
                if rel_pc < 2 {
                    0
                } else {
                    2
                }
            }
            Arch::Mips32 | Arch::Mips64 => {
                if rel_pc < 8 {
                    0
                } else {
                    // Account for both the branch instruction and its delay slot.
                    8
                }
            }
        }
    }

    /// Returns the name of this architecture as used in snapshot files.
    pub fn name(self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Riscv64 => "riscv64",
            Arch::Mips32 => "mips",
            Arch::Mips64 => "mips64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl str::FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string {
            "arm" => Arch::Arm,
            "arm64" | "aarch64" => Arch::Arm64,
            "x86" | "i386" | "i686" => Arch::X86,
            "x86_64" | "amd64" => Arch::X86_64,
            "riscv64" => Arch::Riscv64,
            "mips" => Arch::Mips32,
            "mips64" => Arch::Mips64,
            _ => return Err(UnknownArchError),
        })
    }
}
