//! Error types reported by the unwinding engine.

use std::fmt;

use thiserror::Error;

/// The kinds of failure an unwind step can record.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorCode {
    /// No error occurred.
    #[default]
    None,
    /// A memory read failed or returned short.
    MemoryInvalid,
    /// No unwind information covered the program counter.
    UnwindInfoMissing,
    /// The unwind information used an unsupported feature.
    Unsupported,
    /// The module backing the program counter is not a valid ELF.
    InvalidElf,
    /// The program counter is not covered by any mapping.
    InvalidMap,
    /// The frame cap was reached before the unwind terminated.
    MaxFramesExceeded,
    /// The unwind produced the same program counter twice in a row.
    RepeatedFrame,
    /// A caller-supplied parameter was invalid.
    InvalidParameter,
    /// A DWARF expression indexed outside its operand stack or branched out
    /// of its program.
    ArgOutOfRange,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "no error"),
            Self::MemoryInvalid => write!(f, "memory read failed"),
            Self::UnwindInfoMissing => write!(f, "no unwind information"),
            Self::Unsupported => write!(f, "unsupported unwind feature"),
            Self::InvalidElf => write!(f, "invalid elf"),
            Self::InvalidMap => write!(f, "pc not in a valid map"),
            Self::MaxFramesExceeded => write!(f, "frame cap reached"),
            Self::RepeatedFrame => write!(f, "repeated frame"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::ArgOutOfRange => write!(f, "dwarf expression argument out of range"),
        }
    }
}

/// An error recorded during an unwind, optionally with the faulting address.
///
/// Only memory errors carry an address; for every other code the address
/// reads zero.
#[derive(Clone, Copy, Debug, Default, Error, Eq, PartialEq)]
#[error("{code}")]
pub struct Error {
    /// The kind of failure.
    pub code: ErrorCode,
    /// The address whose read failed, when `code` is
    /// [`ErrorCode::MemoryInvalid`].
    pub address: u64,
}

impl Error {
    /// Creates an error with no faulting address.
    pub fn new(code: ErrorCode) -> Self {
        Error { code, address: 0 }
    }

    /// Creates a memory error at the given faulting address.
    pub fn memory_invalid(address: u64) -> Self {
        Error {
            code: ErrorCode::MemoryInvalid,
            address,
        }
    }

    /// Returns true if this represents no error.
    pub fn is_none(&self) -> bool {
        self.code == ErrorCode::None
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}
