#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! Crate root: re-exports the three modules and their public entry points.

mod diagnostics;
mod platform;

pub mod bridge;
pub mod decoder;
pub mod pool;

pub use bridge::{bridge_create, bridge_destroy, Builder};
pub use decoder::{decode, decode_slice, DecodeOutcome, MAX_INSTRUCTION_LENGTH};
pub use diagnostics::DecodeDiagnostic;
pub use pool::CodePool;
