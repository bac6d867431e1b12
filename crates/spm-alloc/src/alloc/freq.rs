//! Interprocedural execution-frequency propagation.
//!
//! Starting from every procedure without callers, block frequencies are
//! scaled by the frequency of the call context and pushed across call edges.
//! A callee graph is revisited only when a call site raises its entry
//! block's frequency, so the walk terminates on acyclic call graphs.
//! Call-graph cycles are detected with the walk stack: a recursive callee
//! has all its access regions cleared and is not descended into, so no
//! placement decisions are ever made inside recursion.

use std::collections::BTreeMap;

use crate::alloc::access::BlockData;
use crate::ir::{BlockId, IrProgram, ProcId};

pub fn propagate<P: IrProgram>(program: &P, blocks: &mut BTreeMap<BlockId, BlockData>) {
    for proc in program.procedures() {
        if program.callers(proc).is_empty() {
            let mut stack = Vec::new();
            walk_proc(program, blocks, proc, 1.0, &mut stack);
        }
    }
}

fn walk_proc<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    proc: ProcId,
    irg_freq: f64,
    stack: &mut Vec<ProcId>,
) {
    stack.push(proc);
    for block in program.blocks(proc) {
        let freq = irg_freq * program.local_exec_freq(block);
        let data = blocks.get_mut(&block).expect("block data collected");
        if freq > data.max_exec_freq {
            data.max_exec_freq = freq;
        }
        let callees = data.callees.clone();
        for callee in callees {
            if stack.contains(&callee) {
                tracing::debug!(?callee, "recursive call, clearing access regions");
                clear_regions(program, blocks, callee);
                continue;
            }
            let start = program.start_block(callee);
            let start_data = blocks.get_mut(&start).expect("block data collected");
            if freq > start_data.max_exec_freq {
                start_data.max_exec_freq = freq;
                walk_proc(program, blocks, callee, freq, stack);
            }
        }
    }
    stack.pop();
}

/// Inside recursion no placement happens: every non-call access list of the
/// procedure is dropped.
fn clear_regions<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    proc: ProcId,
) {
    for block in program.blocks(proc) {
        let data = blocks.get_mut(&block).expect("block data collected");
        for region in &mut data.regions {
            region.clear();
        }
    }
}
