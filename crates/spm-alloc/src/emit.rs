//! Emission interface: how the allocator hands rewritten addresses and copy
//! code back to the target backend.
//!
//! The allocator decides *what* to copy and *where* to place it; the target
//! backend owns instruction selection, scheduling and SSA form. Implementors
//! translate each [`Emitter`] call into target nodes (load/store/push/pop)
//! and splice them at the requested point.

use crate::error::Result;
use crate::ir::{BlockId, InstrId, VarId, VarKind};

/// Where emitted code is spliced into the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitPoint {
    /// At the top of the block, after any entry bookkeeping the target
    /// requires (for a procedure's entry block this skips the start node).
    BlockStart(BlockId),
    /// At the bottom of the block, before the terminator.
    BlockEnd(BlockId),
    /// Immediately before the given scheduled instruction.
    Before(InstrId),
    /// Immediately after the given scheduled instruction.
    After(InstrId),
}

/// Width of one copy chunk. Transfers are decomposed into chunks the target
/// can move through a single scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWidth {
    W8,
    W16,
    W32,
}

impl ChunkWidth {
    /// Width for the next chunk given the bytes still to copy: byte-sized
    /// while the remainder is odd, half-word while it is 2 mod 4, word
    /// otherwise.
    #[must_use]
    pub fn for_remaining(remaining: u32) -> Self {
        if remaining % 2 == 1 {
            Self::W8
        } else if remaining % 4 == 2 {
            Self::W16
        } else {
            Self::W32
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
        }
    }
}

/// One side of a copy chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyAddr {
    /// The object's home location in RAM (frame-relative for stack objects,
    /// absolute for globals), displaced by `offset` bytes.
    Ram {
        var: VarId,
        kind: VarKind,
        offset: u32,
    },
    /// An absolute scratchpad address (base address already applied).
    Spm { addr: u32 },
}

/// Target-backend callbacks for rewriting and code insertion.
pub trait Emitter {
    /// Whether the scratch register used for copies is live at `point`.
    /// When it is, the rewriter brackets the copy sequence with
    /// [`Self::push_scratch`] / [`Self::pop_scratch`] and asks for SSA
    /// repair afterwards.
    fn scratch_live(&self, point: EmitPoint) -> bool;

    /// Save the scratch register at `point`.
    fn push_scratch(&mut self, point: EmitPoint) -> Result<()>;

    /// Restore the scratch register at `point`.
    fn pop_scratch(&mut self, point: EmitPoint) -> Result<()>;

    /// Emit one load/store pair moving `width` bytes from `from` to `to`.
    fn emit_copy(
        &mut self,
        point: EmitPoint,
        from: CopyAddr,
        to: CopyAddr,
        width: ChunkWidth,
    ) -> Result<()>;

    /// Rewrite a memory-access instruction so it addresses the scratchpad at
    /// `spm_addr` (base address already applied; the instruction's own
    /// displacement is preserved by the implementor).
    fn retarget_access(&mut self, instr: InstrId, spm_addr: u32) -> Result<()>;

    /// Rebuild SSA form over the scratch register after a push/pop bracket
    /// at `point`.
    fn repair_ssa(&mut self, point: EmitPoint) -> Result<()>;
}
