//! A stack-unwinding engine for native and managed code on Linux-like
//! targets.
//!
//! Given a paused execution context -- a register file plus a memory oracle
//! over the target process -- the engine reconstructs the sequence of call
//! frames: for each frame a program counter, stack pointer, owning module,
//! symbolic function name and function-relative offset. It supports
//! unwinding the calling process, a remote process attached via ptrace, and
//! wholly offline snapshots, and it interoperates with ART's JIT debug
//! interface to name frames whose code was produced at runtime.
//!
//! The main entry point is the [`Unwinder`], driven by a [`Maps`] list, a
//! register file implementing [`Regs`], and a [`Memory`] oracle:
//!
//! ```no_run
//! use std::sync::Arc;
//! use framewalk_unwind::{Maps, MemoryRemote, Unwinder, UnwindOptions, remote_regs};
//!
//! # fn example(pid: i32) -> Option<()> {
//! let maps = Maps::remote(pid).ok()?;
//! let mut regs = remote_regs(pid)?;
//! let memory = Arc::new(MemoryRemote::new(pid));
//!
//! let mut unwinder = Unwinder::new(&maps, &mut *regs, memory);
//! let options = UnwindOptions::default();
//! unwinder.unwind(&options);
//! for index in 0..unwinder.num_frames() {
//!     println!("{}", unwinder.format_frame(index, &options));
//! }
//! # Some(())
//! # }
//! ```
//!
//! This crate is part of the `framewalk` workspace.

#![warn(missing_docs)]

pub mod dex;
pub mod dwarf;
pub mod elf;
mod error;
mod format;
pub mod jit;
mod map_info;
mod maps;
pub mod memory;
mod offline;
pub mod regs;
mod unwinder;

pub use crate::dex::{DexFile, DexSymbols, MethodInfo};
pub use crate::elf::Elf;
pub use crate::error::{Error, ErrorCode};
pub use crate::format::format_frame;
pub use crate::jit::{DexFiles, JitDebug};
pub use crate::map_info::MapInfo;
pub use crate::maps::{
    basename, Maps, MAPS_FLAGS_DEVICE_MAP, MAPS_FLAGS_JIT_SYMFILE_MAP, PROT_EXEC, PROT_READ,
    PROT_WRITE,
};
pub use crate::memory::{
    Memory, MemoryBuffer, MemoryCache, MemoryFileAtOffset, MemoryLocal, MemoryOfflineBuffer,
    MemoryOfflineParts, MemoryRange, MemoryRanges, MemoryRemote, MemoryXz,
};
pub use crate::offline::OfflineSnapshot;
pub use crate::regs::{local_regs, regs_for_arch, remote_regs, Regs};
pub use crate::unwinder::{Frame, UnwindOptions, Unwinder};

pub use framewalk_common::{Arch, SharedString};
