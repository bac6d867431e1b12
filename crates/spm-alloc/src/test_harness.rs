//! Test harness for spm-alloc unit and integration tests.
//!
//! [`MockProgram`] is an in-memory IR with the builder calls tests need to
//! sketch control flow, calls and memory accesses; [`RecordingEmitter`]
//! captures every rewrite the allocator asks for, so tests can assert on
//! the emitted copy code without a real backend.
//!
//! # Example
//!
//! ```rust
//! use spm_alloc::test_harness::*;
//! use spm_alloc::{SpmAllocator, SpmProperties, VarId};
//!
//! let mut p = MockProgram::new();
//! let main = p.add_proc();
//! p.set_main(main);
//! let b = p.add_block(main, 1.0);
//! let e = p.add_block(main, 1.0);
//! p.edge(b, e);
//! p.set_end(main, e);
//! p.read(b, VarId(1), 4);
//!
//! let alloc = SpmAllocator::analyze(&p, SpmProperties::default()).unwrap();
//! assert!(alloc.allocation(b, 0).is_some());
//! ```

#![allow(clippy::must_use_candidate, clippy::missing_panics_doc)]

use std::collections::HashSet;

use crate::emit::{ChunkWidth, CopyAddr, EmitPoint, Emitter};
use crate::error::Result;
use crate::ir::{BlockId, InstrAccess, InstrId, IrProgram, LoopId, ProcId, VarId, VarKind};

#[derive(Debug, Default)]
struct ProcInfo {
    blocks: Vec<BlockId>,
    end: Option<BlockId>,
}

#[derive(Debug)]
struct BlockInfo {
    proc: ProcId,
    instrs: Vec<InstrId>,
    /// (predecessor, is back edge)
    preds: Vec<(BlockId, bool)>,
    succs: Vec<BlockId>,
    local_freq: f64,
    in_loop: Option<LoopId>,
}

/// A small in-memory program graph implementing [`IrProgram`].
#[derive(Debug, Default)]
pub struct MockProgram {
    procs: Vec<ProcInfo>,
    blocks: Vec<BlockInfo>,
    instrs: Vec<Option<InstrAccess>>,
    main: Option<ProcId>,
    next_loop: u32,
}

impl MockProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proc(&mut self) -> ProcId {
        self.procs.push(ProcInfo::default());
        ProcId(self.procs.len() as u32 - 1)
    }

    pub fn set_main(&mut self, proc: ProcId) {
        self.main = Some(proc);
    }

    /// Add a block to `proc`. The first block added becomes its entry.
    pub fn add_block(&mut self, proc: ProcId, local_freq: f64) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockInfo {
            proc,
            instrs: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            local_freq,
            in_loop: None,
        });
        self.procs[proc.0 as usize].blocks.push(id);
        id
    }

    pub fn set_end(&mut self, proc: ProcId, block: BlockId) {
        self.procs[proc.0 as usize].end = Some(block);
    }

    pub fn edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].succs.push(to);
        self.blocks[to.0 as usize].preds.push((from, false));
    }

    pub fn back_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].succs.push(to);
        self.blocks[to.0 as usize].preds.push((from, true));
    }

    pub fn new_loop(&mut self) -> LoopId {
        self.next_loop += 1;
        LoopId(self.next_loop - 1)
    }

    pub fn set_loop(&mut self, block: BlockId, lp: LoopId) {
        self.blocks[block.0 as usize].in_loop = Some(lp);
    }

    fn add_instr(&mut self, block: BlockId, access: Option<InstrAccess>) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(access);
        self.blocks[block.0 as usize].instrs.push(id);
        id
    }

    /// A scheduled instruction without memory significance.
    pub fn plain(&mut self, block: BlockId) -> InstrId {
        self.add_instr(block, None)
    }

    pub fn read(&mut self, block: BlockId, var: VarId, size: u32) -> InstrId {
        self.add_instr(
            block,
            Some(InstrAccess::Var {
                var,
                kind: VarKind::Global,
                size,
                modified: false,
            }),
        )
    }

    pub fn write(&mut self, block: BlockId, var: VarId, size: u32) -> InstrId {
        self.add_instr(
            block,
            Some(InstrAccess::Var {
                var,
                kind: VarKind::Global,
                size,
                modified: true,
            }),
        )
    }

    pub fn stack_read(&mut self, block: BlockId, var: VarId, size: u32) -> InstrId {
        self.add_instr(
            block,
            Some(InstrAccess::Var {
                var,
                kind: VarKind::Stack,
                size,
                modified: false,
            }),
        )
    }

    pub fn stack_write(&mut self, block: BlockId, var: VarId, size: u32) -> InstrId {
        self.add_instr(
            block,
            Some(InstrAccess::Var {
                var,
                kind: VarKind::Stack,
                size,
                modified: true,
            }),
        )
    }

    pub fn call(&mut self, block: BlockId, callee: ProcId) -> InstrId {
        self.add_instr(block, Some(InstrAccess::Call(callee)))
    }
}

impl IrProgram for MockProgram {
    fn procedures(&self) -> Vec<ProcId> {
        (0..self.procs.len() as u32).map(ProcId).collect()
    }

    fn main_proc(&self) -> ProcId {
        self.main.expect("main procedure set")
    }

    fn blocks(&self, proc: ProcId) -> Vec<BlockId> {
        self.procs[proc.0 as usize].blocks.clone()
    }

    fn instructions(&self, block: BlockId) -> Vec<InstrId> {
        self.blocks[block.0 as usize].instrs.clone()
    }

    fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks[block.0 as usize]
            .preds
            .iter()
            .map(|&(b, _)| b)
            .collect()
    }

    fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks[block.0 as usize].succs.clone()
    }

    fn is_back_edge(&self, block: BlockId, pred_idx: usize) -> bool {
        self.blocks[block.0 as usize].preds[pred_idx].1
    }

    fn start_block(&self, proc: ProcId) -> BlockId {
        self.procs[proc.0 as usize].blocks[0]
    }

    fn end_block(&self, proc: ProcId) -> BlockId {
        self.procs[proc.0 as usize]
            .end
            .expect("end block set for procedure")
    }

    fn containing_proc(&self, block: BlockId) -> ProcId {
        self.blocks[block.0 as usize].proc
    }

    fn loop_of(&self, block: BlockId) -> Option<LoopId> {
        self.blocks[block.0 as usize].in_loop
    }

    fn local_exec_freq(&self, block: BlockId) -> f64 {
        self.blocks[block.0 as usize].local_freq
    }

    fn callers(&self, proc: ProcId) -> Vec<ProcId> {
        let mut callers: Vec<ProcId> = Vec::new();
        for block in &self.blocks {
            for &instr in &block.instrs {
                if self.instrs[instr.0 as usize] == Some(InstrAccess::Call(proc))
                    && !callers.contains(&block.proc)
                {
                    callers.push(block.proc);
                }
            }
        }
        callers
    }

    fn retrieve_access(&self, instr: InstrId) -> Option<InstrAccess> {
        self.instrs[instr.0 as usize]
    }
}

/// One recorded emitter callback.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitEvent {
    Retarget {
        instr: InstrId,
        addr: u32,
    },
    Push(EmitPoint),
    Pop(EmitPoint),
    Copy {
        point: EmitPoint,
        from: CopyAddr,
        to: CopyAddr,
        width: ChunkWidth,
    },
    SsaRepair(EmitPoint),
}

/// Emitter that records everything it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    pub events: Vec<EmitEvent>,
    /// Points where the scratch register is considered live.
    pub live_points: HashSet<BlockId>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy events at one insertion point, in emission order.
    pub fn copies_at(&self, point: EmitPoint) -> Vec<(CopyAddr, CopyAddr, ChunkWidth)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                EmitEvent::Copy {
                    point: p,
                    from,
                    to,
                    width,
                } if *p == point => Some((*from, *to, *width)),
                _ => None,
            })
            .collect()
    }

    /// Variables fetched from RAM at one insertion point, in order.
    pub fn ram_reads_at(&self, point: EmitPoint) -> Vec<VarId> {
        let mut vars = Vec::new();
        for (from, _, _) in self.copies_at(point) {
            if let CopyAddr::Ram { var, offset: 0, .. } = from {
                vars.push(var);
            }
        }
        vars
    }

    /// Variables written back to RAM at one insertion point, in order.
    pub fn ram_writes_at(&self, point: EmitPoint) -> Vec<VarId> {
        let mut vars = Vec::new();
        for (_, to, _) in self.copies_at(point) {
            if let CopyAddr::Ram { var, offset: 0, .. } = to {
                vars.push(var);
            }
        }
        vars
    }

    pub fn retargeted(&self, instr: InstrId) -> Option<u32> {
        self.events.iter().find_map(|e| match e {
            EmitEvent::Retarget { instr: i, addr } if *i == instr => Some(*addr),
            _ => None,
        })
    }

    fn point_block(point: EmitPoint) -> Option<BlockId> {
        match point {
            EmitPoint::BlockStart(b) | EmitPoint::BlockEnd(b) => Some(b),
            EmitPoint::Before(_) | EmitPoint::After(_) => None,
        }
    }
}

impl Emitter for RecordingEmitter {
    fn scratch_live(&self, point: EmitPoint) -> bool {
        Self::point_block(point).is_some_and(|b| self.live_points.contains(&b))
    }

    fn push_scratch(&mut self, point: EmitPoint) -> Result<()> {
        self.events.push(EmitEvent::Push(point));
        Ok(())
    }

    fn pop_scratch(&mut self, point: EmitPoint) -> Result<()> {
        self.events.push(EmitEvent::Pop(point));
        Ok(())
    }

    fn emit_copy(
        &mut self,
        point: EmitPoint,
        from: CopyAddr,
        to: CopyAddr,
        width: ChunkWidth,
    ) -> Result<()> {
        self.events.push(EmitEvent::Copy {
            point,
            from,
            to,
            width,
        });
        Ok(())
    }

    fn retarget_access(&mut self, instr: InstrId, spm_addr: u32) -> Result<()> {
        self.events.push(EmitEvent::Retarget {
            instr,
            addr: spm_addr,
        });
        Ok(())
    }

    fn repair_ssa(&mut self, point: EmitPoint) -> Result<()> {
        self.events.push(EmitEvent::SsaRepair(point));
        Ok(())
    }
}
