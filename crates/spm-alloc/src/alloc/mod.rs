//! Whole-program scratchpad allocation.
//!
//! The entry point is [`SpmAllocator::analyze`]: it profiles every block,
//! propagates execution frequencies across the call graph, and walks the
//! interprocedural CFG to compute one scratchpad configuration per
//! (block, region). [`SpmAllocator::apply`] then rewrites the program
//! through the client's [`Emitter`](crate::emit::Emitter).

pub mod access;
pub mod freq;
pub mod join;
pub mod layout;
pub mod solve;
pub mod transfer;
pub mod walker;

use std::collections::BTreeMap;

use crate::emit::Emitter;
use crate::error::{Error, Result};
use crate::ir::{BlockId, IrProgram, LoopId};
use crate::rewrite;

pub use access::{BlockData, VarAccess, VarInfo, VarRegistry};
pub use join::LoopData;
pub use layout::{SpmCell, SpmLayout};
pub use solve::AllocResult;
pub use transfer::{Direction, Transfer};
pub use walker::{AllocRef, PredState, WalkItem};

/// Physical parameters of the scratchpad region. All tunable.
#[derive(Debug, Clone)]
pub struct SpmProperties {
    /// Base byte address of the scratchpad in the target address space.
    pub start_addr: u32,
    /// Capacity in bytes.
    pub size: u32,
    /// RAM latency minus scratchpad latency, in cycles per access.
    pub latency_diff: u32,
    /// RAM transfer throughput in bytes per cycle.
    pub throughput_ram: f64,
    /// Scratchpad transfer throughput in bytes per cycle.
    pub throughput_spm: f64,
}

const ONE_MB: u32 = 1024 * 1024;

impl Default for SpmProperties {
    fn default() -> Self {
        Self {
            start_addr: 512 * ONE_MB,
            size: ONE_MB,
            latency_diff: 20,
            throughput_ram: 1.0,
            throughput_spm: 1.0,
        }
    }
}

impl SpmProperties {
    fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidProperties("size must be positive".into()));
        }
        if self.throughput_ram <= 0.0 || self.throughput_spm <= 0.0 {
            return Err(Error::InvalidProperties(
                "throughputs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// The computed allocation for one compilation unit.
pub struct SpmAllocator<'p, P: IrProgram> {
    program: &'p P,
    props: SpmProperties,
    registry: VarRegistry,
    blocks: BTreeMap<BlockId, BlockData>,
    loops: BTreeMap<LoopId, LoopData>,
}

impl<'p, P: IrProgram> SpmAllocator<'p, P> {
    /// Run the full analysis: access collection, frequency propagation and
    /// the interprocedural configuration walk.
    pub fn analyze(program: &'p P, props: SpmProperties) -> Result<Self> {
        props.validate()?;

        for proc in program.procedures() {
            program.estimate_freqs(proc);
        }

        let mut registry = VarRegistry::default();
        let mut blocks = access::collect_program(program, &props, &mut registry);
        tracing::debug!(blocks = blocks.len(), "access profiles collected");

        freq::propagate(program, &mut blocks);

        let mut loops = BTreeMap::new();
        let mut env = walker::WalkEnv {
            program,
            props: &props,
            registry: &registry,
            blocks: &mut blocks,
            loops: &mut loops,
        };
        walker::run(&mut env);
        tracing::debug!(loops = loops.len(), "configuration walk finished");

        Ok(Self {
            program,
            props,
            registry,
            blocks,
            loops,
        })
    }

    /// Rewrite the program: retarget resident accesses and materialise the
    /// planned transfers through `emitter`.
    pub fn apply<E: Emitter>(&self, emitter: &mut E) -> Result<()> {
        rewrite::apply(
            self.program,
            &self.props,
            &self.registry,
            &self.blocks,
            &self.loops,
            emitter,
        )
    }

    #[must_use]
    pub fn properties(&self) -> &SpmProperties {
        &self.props
    }

    #[must_use]
    pub fn registry(&self) -> &VarRegistry {
        &self.registry
    }

    /// The configuration at the exit of `block`'s `region`, if computed.
    #[must_use]
    pub fn allocation(&self, block: BlockId, region: usize) -> Option<&AllocResult> {
        self.blocks
            .get(&block)?
            .allocations
            .get(region)?
            .as_ref()
    }

    #[must_use]
    pub fn block_data(&self, block: BlockId) -> Option<&BlockData> {
        self.blocks.get(&block)
    }

    #[must_use]
    pub fn loop_data(&self, lp: LoopId) -> Option<&LoopData> {
        self.loops.get(&lp)
    }
}
