//! Reconciliation of scratchpad configurations at control-flow merges.
//!
//! At a merge, one predecessor's exit configuration is chosen as the base;
//! every other predecessor receives compensation transfers that morph its
//! exit state into the base. Loops are closed once their back edge is
//! reached: every variable the loop touches is pinned to the address it
//! holds in the last in-loop configuration, so no copies run on the back
//! edge itself.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::alloc::access::{BlockData, VarRegistry};
use crate::alloc::transfer::{diff, Transfer};
use crate::alloc::walker::WalkItem;
use crate::ir::{BlockId, IrProgram, LoopId, ProcId, VarId};

/// Per-loop state gathered while the walker is inside the loop.
#[derive(Debug)]
pub struct LoopData {
    pub header: BlockId,
    pub proc: ProcId,
    /// Blocks allocated while the loop was open, header first.
    pub members: Vec<BlockId>,
    /// Variables read or written anywhere inside the loop.
    pub mem_accesses: HashSet<VarId>,
    /// Transfer sequence to run once, in the loop pre-header.
    pub transfers: Vec<Transfer>,
}

impl LoopData {
    #[must_use]
    pub fn new(header: BlockId, proc: ProcId) -> Self {
        Self {
            header,
            proc,
            members: Vec::new(),
            mem_accesses: HashSet::new(),
            transfers: Vec::new(),
        }
    }
}

/// Attach compensation to every predecessor of `block` except `base`,
/// morphing its exit configuration into the base's.
pub(crate) fn join_preds<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    registry: &VarRegistry,
    block: BlockId,
    base: BlockId,
) {
    let base_alloc = blocks[&base]
        .exit_alloc()
        .expect("join base has an exit configuration");

    let mut pending: Vec<(BlockId, Vec<Transfer>)> = Vec::new();
    for pred in program.predecessors(block) {
        if pred == base {
            continue;
        }
        let pred_alloc = blocks[&pred]
            .exit_alloc()
            .expect("joined predecessor has an exit configuration");
        let transfers = diff(base_alloc, pred_alloc, registry);
        if !transfers.is_empty() {
            pending.push((pred, transfers));
        }
    }

    for (pred, transfers) in pending {
        tracing::debug!(?pred, ?base, n = transfers.len(), "merge compensation");
        let data = blocks.get_mut(&pred).expect("block data collected");
        let exit = data
            .allocations
            .last_mut()
            .and_then(Option::as_mut)
            .expect("joined predecessor has an exit configuration");
        exit.compensation = transfers;
    }
}

/// Conditional join: the last visited predecessor is the base.
pub(crate) fn join_cond<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    registry: &VarRegistry,
    block: BlockId,
    last_block: BlockId,
) {
    join_preds(program, blocks, registry, block, last_block);
}

/// Return join at a procedure's exit block: the hottest return block is the
/// base and becomes the configuration the caller resumes with.
pub(crate) fn join_return<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    registry: &VarRegistry,
    end_block: BlockId,
) -> BlockId {
    let preds = program.predecessors(end_block);
    let mut base = preds[0];
    for &pred in &preds[1..] {
        if program.local_exec_freq(pred) > program.local_exec_freq(base) {
            base = pred;
        }
    }
    join_preds(program, blocks, registry, end_block, base);
    base
}

/// Close the innermost loop at its header: pin every loop-accessed resident
/// of the final in-loop configuration to a fixed address in *all* in-loop
/// configurations, and collect the pre-header transfer sequence.
pub(crate) fn close_loop<P: IrProgram>(
    program: &P,
    blocks: &mut BTreeMap<BlockId, BlockData>,
    loops: &mut BTreeMap<LoopId, LoopData>,
    registry: &VarRegistry,
    item: &WalkItem,
) {
    let header = item.block;
    let Some(&lp) = item.cur_loops.last() else {
        tracing::warn!(?header, "back edge without an open loop, skipping closure");
        return;
    };

    let preds = program.predecessors(header);
    let last_loop_block = preds
        .iter()
        .enumerate()
        .find(|&(i, _)| program.is_back_edge(header, i))
        .map(|(_, &b)| b)
        .expect("loop header has a back edge");

    let last_data = &blocks[&last_loop_block];
    let last_region = last_data.callee_cnt();
    // (var, addr, size) of everything the loop touches that survived to the
    // back edge, in address order.
    let loop_vars: Vec<(VarId, u32, u32)> = {
        let last_alloc = last_data
            .exit_alloc()
            .expect("back-edge source has an exit configuration");
        let l_data = &loops[&lp];
        last_alloc
            .layout
            .vars()
            .filter_map(|c| {
                let var = c.var.expect("occupied cell");
                l_data.mem_accesses.contains(&var).then_some((var, c.addr, c.size))
            })
            .collect()
    };
    if loop_vars.is_empty() {
        return;
    }
    tracing::debug!(?header, ?loop_vars, "closing loop");

    let mut to_evict: HashMap<VarId, Transfer> = HashMap::new();
    let members = loops[&lp].members.clone();
    for member in members {
        let data = blocks.get_mut(&member).expect("block data collected");
        let region_cnt = data.allocations.len();
        for region in 0..region_cnt {
            if member == last_loop_block && region == last_region {
                continue;
            }
            let Some(alloc) = data.allocations[region].as_mut() else {
                continue;
            };

            // The pre-header sequence supplies the loop variables; any
            // region-local traffic for them is dropped.
            for &(var, _, _) in &loop_vars {
                alloc.copy_in.remove(&var);
                alloc.swapout.remove(&var);
            }
            // A loop variable sitting at the wrong address vacates its cell.
            for &(var, addr, _) in &loop_vars {
                if alloc.layout.addr_of(var).is_some_and(|a| a != addr) {
                    alloc.layout.remove_var(var);
                    alloc.resident.remove(&var);
                }
            }
            // Clear each target range and pin the loop variable into it.
            for &(var, addr, size) in &loop_vars {
                if alloc.layout.addr_of(var) == Some(addr) {
                    continue;
                }
                for cell in alloc.layout.evict_range(addr, addr + size) {
                    let evicted = cell.var.expect("occupied cell");
                    alloc.resident.remove(&evicted);
                    alloc.copy_in.remove(&evicted);
                    alloc.swapout.remove(&evicted);
                    alloc.write_first.remove(&evicted);
                    if alloc.modified.remove(&evicted) {
                        to_evict.entry(evicted).or_insert_with(|| {
                            Transfer::copy_out(
                                evicted,
                                registry.kind_of(evicted),
                                cell.size,
                                cell.addr,
                            )
                        });
                    }
                }
                alloc.layout.place_at(addr, var, size);
                alloc.resident.insert(var);
            }
            alloc.free_space = alloc.layout.total_gap();
            alloc.check();
        }
    }

    let l_data = loops.get_mut(&lp).expect("loop data recorded");
    let mut outs: Vec<Transfer> = to_evict.into_values().collect();
    outs.sort_by_key(|t| t.spm_from);
    l_data.transfers = outs;
    for &(var, addr, size) in &loop_vars {
        l_data
            .transfers
            .push(Transfer::copy_in(var, registry.kind_of(var), size, addr));
    }
}
