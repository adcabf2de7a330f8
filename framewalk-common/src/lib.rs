//! Common functionality for `framewalk`.
//!
//! This crate exposes the small set of types shared by every part of the
//! unwinding engine:
//!
//!  - [`Arch`]: The CPU architectures the engine can unwind, along with the
//!    properties that drive unwinding (pointer widths, instruction
//!    alignment, return-address adjustment).
//!  - [`SharedString`]: A cheaply clonable, immutable string handle used to
//!    deduplicate function and module names across frames and caches.
//!
//! This crate is part of the `framewalk` workspace.

#![warn(missing_docs)]

mod shared_string;
mod types;

pub use crate::shared_string::*;
pub use crate::types::*;
