//! The DWARF call-frame-information engine.
//!
//! This module parses `.eh_frame`, `.eh_frame_hdr` and `.debug_frame`,
//! builds per-PC rows of register rules, and evaluates those rows against a
//! register snapshot to produce the caller's frame. A small expression VM
//! executes `DW_OP` programs embedded in the rules.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::error::{Error, ErrorCode};

pub mod cfa;
pub mod encoding;
pub mod memory;
pub mod op;
pub mod section;

pub use section::{DwarfDebugFrame, DwarfEhFrame, DwarfEhFrameWithHdr, DwarfSection};

/// The pseudo register index carrying the CFA rule in a location row.
pub const CFA_REG: u32 = 1 << 30;

/// The kinds of failure the DWARF engine can report.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DwarfErrorCode {
    /// A memory read failed while decoding or evaluating.
    MemoryInvalid,
    /// An encoded value was not legal at its position.
    IllegalValue,
    /// The decoder reached a state the format does not allow.
    IllegalState,
    /// An expression indexed outside its operand stack or branched out of
    /// its program.
    StackIndexNotValid,
    /// A recognized but unimplemented feature was encountered.
    NotImplemented,
    /// Instruction execution exceeded the iteration cap.
    TooManyIterations,
    /// The row defines register rules but no CFA.
    CfaNotDefined,
    /// The CIE version is not supported.
    UnsupportedVersion,
    /// The section contains no frame descriptions.
    NoFdes,
}

impl fmt::Display for DwarfErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryInvalid => write!(f, "memory read failed"),
            Self::IllegalValue => write!(f, "illegal value"),
            Self::IllegalState => write!(f, "illegal state"),
            Self::StackIndexNotValid => write!(f, "stack index not valid"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::TooManyIterations => write!(f, "too many iterations"),
            Self::CfaNotDefined => write!(f, "cfa not defined"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::NoFdes => write!(f, "no frame descriptions"),
        }
    }
}

/// An error from the DWARF engine, with the faulting address for memory
/// failures.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("{code}")]
pub struct DwarfError {
    /// The kind of failure.
    pub code: DwarfErrorCode,
    /// The faulting address, when `code` is memory related.
    pub address: u64,
}

impl DwarfError {
    /// Creates an error with no faulting address.
    pub fn new(code: DwarfErrorCode) -> Self {
        DwarfError { code, address: 0 }
    }

    /// Creates a memory error at the faulting address.
    pub fn memory_invalid(address: u64) -> Self {
        DwarfError {
            code: DwarfErrorCode::MemoryInvalid,
            address,
        }
    }
}

impl From<DwarfErrorCode> for DwarfError {
    fn from(code: DwarfErrorCode) -> Self {
        DwarfError::new(code)
    }
}

impl From<DwarfError> for Error {
    fn from(err: DwarfError) -> Self {
        match err.code {
            DwarfErrorCode::MemoryInvalid => Error::memory_invalid(err.address),
            DwarfErrorCode::NotImplemented => Error::new(ErrorCode::Unsupported),
            DwarfErrorCode::StackIndexNotValid => Error::new(ErrorCode::ArgOutOfRange),
            _ => Error::new(ErrorCode::UnwindInfoMissing),
        }
    }
}

/// A specialized result type for the DWARF engine.
pub type DwarfResult<T> = Result<T, DwarfError>;

/// One register rule of a CFI row.
///
/// Expression rules keep `(length, end_offset)` references into the section
/// so the program is only walked when the rule is evaluated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DwarfLocation {
    /// The register's value is unrecoverable.
    Undefined,
    /// The register lives at `CFA + offset` in memory.
    Offset(i64),
    /// The register's value is `CFA + offset` itself.
    ValOffset(i64),
    /// The register's value is in another register, shifted by an offset.
    /// With a zero offset this doubles as the CFA `register + offset` rule.
    Register {
        /// The source register.
        reg: u32,
        /// The offset added to its value.
        offset: i64,
    },
    /// The register lives at the address computed by a `DW_OP` program.
    Expression {
        /// Length of the program in bytes.
        length: u64,
        /// Section offset one past the end of the program.
        end_offset: u64,
    },
    /// The register's value is the result of a `DW_OP` program.
    ValExpression {
        /// Length of the program in bytes.
        length: u64,
        /// Section offset one past the end of the program.
        end_offset: u64,
    },
}

/// A row of register rules valid for `[pc_start, pc_end)`.
#[derive(Clone, Debug, Default)]
pub struct DwarfLocations {
    /// First pc covered by this row.
    pub pc_start: u64,
    /// First pc past this row.
    pub pc_end: u64,
    /// The column holding the return address, from the owning CIE.
    pub return_address_register: u64,
    /// Set when the owning CIE marks its frames as signal frames.
    pub is_signal_frame: bool,
    regs: HashMap<u32, DwarfLocation>,
}

impl DwarfLocations {
    /// Returns the rule for a register, if the row describes it.
    pub fn get(&self, reg: u32) -> Option<&DwarfLocation> {
        self.regs.get(&reg)
    }

    /// Sets the rule for a register.
    pub fn set(&mut self, reg: u32, location: DwarfLocation) {
        self.regs.insert(reg, location);
    }

    /// Removes the rule for a register, restoring same-value semantics.
    pub fn remove(&mut self, reg: u32) {
        self.regs.remove(&reg);
    }

    /// Iterates over all described registers.
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &DwarfLocation)> {
        self.regs.iter()
    }

    /// The number of described registers, including the CFA slot.
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    /// Returns true if no rules are recorded.
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

/// A Common Information Entry: context shared by a group of FDEs.
#[derive(Clone, Debug)]
pub struct DwarfCie {
    /// CIE version; 1, 3, 4 and 5 are supported.
    pub version: u8,
    /// Encoding of FDE start addresses.
    pub fde_address_encoding: u8,
    /// Encoding of the language-specific data area pointer.
    pub lsda_encoding: u8,
    /// Segment selector size (version 4+).
    pub segment_size: u8,
    /// The raw augmentation string.
    pub augmentation: Vec<u8>,
    /// The column holding the return address.
    pub return_address_register: u64,
    /// Section offset of the initial instructions.
    pub cfa_instructions_offset: u64,
    /// Section offset one past the initial instructions.
    pub cfa_instructions_end: u64,
    /// Factor applied to advance deltas.
    pub code_alignment_factor: u64,
    /// Factor applied to offset rules.
    pub data_alignment_factor: i64,
    /// Set when the augmentation marks frames of this CIE as signal frames.
    pub is_signal_frame: bool,
}

impl Default for DwarfCie {
    fn default() -> Self {
        DwarfCie {
            version: 0,
            fde_address_encoding: encoding::DW_EH_PE_ABSPTR,
            lsda_encoding: encoding::DW_EH_PE_OMIT,
            segment_size: 0,
            augmentation: Vec::new(),
            return_address_register: 0,
            cfa_instructions_offset: 0,
            cfa_instructions_end: 0,
            code_alignment_factor: 0,
            data_alignment_factor: 0,
            is_signal_frame: false,
        }
    }
}

/// A Frame Description Entry: the unwind program for one pc range.
#[derive(Clone, Debug, Default)]
pub struct DwarfFde {
    /// Section offset of the owning CIE.
    pub cie_offset: u64,
    /// Section offset of the FDE instructions.
    pub cfa_instructions_offset: u64,
    /// Section offset one past the FDE instructions.
    pub cfa_instructions_end: u64,
    /// First pc covered, in module-relative space.
    pub pc_start: u64,
    /// First pc past the covered range.
    pub pc_end: u64,
    /// Address of the language-specific data area, if any.
    pub lsda_address: u64,
    /// The owning CIE, resolved at parse time.
    pub cie: DwarfCie,
}
