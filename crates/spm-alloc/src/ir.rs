//! Opaque handles into the client compiler's IR and the query surface the
//! allocator needs from it.
//!
//! The allocator never owns IR nodes. Every graph entity is referred to by a
//! small copyable id minted by the client, and all structural questions
//! (control flow, scheduling, call relations, loop membership) are answered
//! through the [`IrProgram`] trait. This keeps the allocator's own data
//! structures acyclic even though the underlying graphs are not.

/// A procedure (function graph) in the program under compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcId(pub u32);

/// A basic block inside a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A scheduled instruction inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// A natural loop reported by the client's loop analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

/// An addressable object (stack slot or global data object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// Storage class of an addressable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    /// Lives in the enclosing procedure's stack frame and dies with it.
    Stack,
    /// Lives in static data and outlives every activation.
    Global,
}

/// Classification of one scheduled instruction, produced by the client's
/// access hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrAccess {
    /// The instruction transfers control to another procedure.
    Call(ProcId),
    /// The instruction reads or writes an addressable object.
    Var {
        var: VarId,
        kind: VarKind,
        /// Object size in bytes. Must be positive.
        size: u32,
        /// Whether the instruction writes the object.
        modified: bool,
    },
}

/// Query interface onto the client's whole-program IR.
///
/// All iteration methods must be deterministic: the allocator's visit order,
/// and therefore its output, is a function of the orders returned here.
pub trait IrProgram {
    /// All procedures of the program.
    fn procedures(&self) -> Vec<ProcId>;

    /// The program entry procedure.
    fn main_proc(&self) -> ProcId;

    /// Blocks of `proc`, in a stable order.
    fn blocks(&self, proc: ProcId) -> Vec<BlockId>;

    /// Instructions of `block` in schedule order.
    fn instructions(&self, block: BlockId) -> Vec<InstrId>;

    /// Control-flow predecessors of `block`. Indices into the returned
    /// vector are the `pred_idx` values accepted by [`Self::is_back_edge`].
    fn predecessors(&self, block: BlockId) -> Vec<BlockId>;

    /// Control-flow successors of `block`.
    fn successors(&self, block: BlockId) -> Vec<BlockId>;

    /// Whether the edge from predecessor `pred_idx` into `block` is a loop
    /// back edge.
    fn is_back_edge(&self, block: BlockId, pred_idx: usize) -> bool;

    /// Entry block of `proc`.
    fn start_block(&self, proc: ProcId) -> BlockId;

    /// Exit block of `proc`. Return blocks are its predecessors; the exit
    /// block itself carries no allocatable code.
    fn end_block(&self, proc: ProcId) -> BlockId;

    /// The procedure a block belongs to.
    fn containing_proc(&self, block: BlockId) -> ProcId;

    /// Innermost loop containing `block`, if any.
    fn loop_of(&self, block: BlockId) -> Option<LoopId>;

    /// Relative execution frequency of `block` within its procedure
    /// (procedure entry = 1.0).
    fn local_exec_freq(&self, block: BlockId) -> f64;

    /// Hook invoked once per procedure before frequencies are read, so the
    /// client can (re)run its frequency estimation.
    fn estimate_freqs(&self, _proc: ProcId) {}

    /// Procedures containing at least one call to `proc`.
    fn callers(&self, proc: ProcId) -> Vec<ProcId>;

    /// Classify a scheduled instruction. `None` means the instruction
    /// neither calls nor touches an allocatable object. This is the only
    /// access classifier the allocator consults.
    fn retrieve_access(&self, instr: InstrId) -> Option<InstrAccess>;
}
