#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod alloc;
pub mod emit;
pub mod error;
pub mod ir;
mod rewrite;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use alloc::{AllocResult, Direction, SpmAllocator, SpmProperties, Transfer};
pub use emit::{ChunkWidth, CopyAddr, EmitPoint, Emitter};
pub use error::{Error, Result};
pub use ir::{BlockId, InstrAccess, InstrId, IrProgram, LoopId, ProcId, VarId, VarKind};
