//! Workqueue-driven traversal of the interprocedural control-flow graph.
//!
//! Work items carry the configuration reached so far and are expanded FIFO
//! from the main procedure's entry block. A block is only solved once all of
//! its forward predecessors are; items arriving early are simply dropped,
//! because the predecessor that finishes last re-enqueues the block. Calls
//! are descended into when the callee runs at the call site's frequency;
//! colder callees keep their existing configurations and the call site is
//! marked for compensation instead.

use std::collections::{BTreeMap, VecDeque};

use crate::alloc::access::{BlockData, VarRegistry};
use crate::alloc::join::{self, LoopData};
use crate::alloc::solve::{solve_region, SolveCtx};
use crate::alloc::SpmProperties;
use crate::ir::{BlockId, IrProgram, LoopId, VarKind};

/// Two frequencies count as equal within this tolerance; it decides whether
/// a call site descends into its callee.
pub(crate) const FREQ_EPSILON: f64 = 1e-2;

/// Progress of a block's predecessors when a work item is inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredState {
    Unknown,
    PredNotDone,
    PredsDone,
    UnfinishedLoop,
    FinishedLoop,
    CondJoin,
}

/// Location of one region's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRef {
    pub block: BlockId,
    pub region: usize,
}

/// One unit of walker work: a block to (re)visit together with the state in
/// which control arrives there.
#[derive(Debug, Clone)]
pub struct WalkItem {
    pub block: BlockId,
    pub last_block: Option<BlockId>,
    pub last_alloc: Option<AllocRef>,
    /// Snapshot of the calling item, restored at the callee's return.
    pub caller: Option<Box<WalkItem>>,
    /// Regions of `block` already handled; doubles as the next region index.
    pub finished_callees: usize,
    pub finished_preds: PredState,
    /// Frequency of the procedure activation this item belongs to.
    pub irg_exec_freq: f64,
    /// Identity of the call descent this item runs under. All items fanned
    /// out inside one activation share it, so the return join can fire
    /// exactly once per activation even when several return paths race.
    pub activation: u64,
    /// Open loops, innermost last.
    pub cur_loops: Vec<LoopId>,
}

#[derive(Debug, Default)]
struct WalkState {
    next_activation: u64,
    returned: std::collections::HashSet<u64>,
}

pub(crate) struct WalkEnv<'a, P: IrProgram> {
    pub program: &'a P,
    pub props: &'a SpmProperties,
    pub registry: &'a VarRegistry,
    pub blocks: &'a mut BTreeMap<BlockId, BlockData>,
    pub loops: &'a mut BTreeMap<LoopId, LoopData>,
}

pub(crate) fn run<P: IrProgram>(env: &mut WalkEnv<'_, P>) {
    let main = env.program.main_proc();
    let seed = WalkItem {
        block: env.program.start_block(main),
        last_block: None,
        last_alloc: None,
        caller: None,
        finished_callees: 0,
        finished_preds: PredState::PredsDone,
        irg_exec_freq: 1.0,
        activation: 0,
        cur_loops: Vec::new(),
    };
    let mut state = WalkState::default();
    let mut queue = VecDeque::new();
    queue.push_back(seed);
    while let Some(item) = queue.pop_front() {
        step(env, &mut state, item, &mut queue);
    }
}

/// A second call site running at the callee's frequency finds the callee
/// entry already allocated. The caller must still make progress: it resumes
/// with the callee's existing exit configuration, and the call site is
/// marked for entry compensation since no transfers were planned for it.
fn resume_if_duplicate_descent<P: IrProgram>(
    env: &mut WalkEnv<'_, P>,
    item: WalkItem,
    queue: &mut VecDeque<WalkItem>,
) {
    let descended = item
        .caller
        .as_ref()
        .is_some_and(|c| Some(c.block) == item.last_block);
    if !descended {
        return;
    }
    let proc = env.program.containing_proc(item.block);
    let end = env.program.end_block(proc);
    let preds = env.program.predecessors(end);
    let mut base = preds[0];
    for &pred in &preds[1..] {
        if env.program.local_exec_freq(pred) > env.program.local_exec_freq(base) {
            base = pred;
        }
    }
    if env.blocks[&base].exit_alloc().is_none() {
        // The first descent is still in flight; try again later.
        queue.push_back(item);
        return;
    }
    let mut caller = *item.caller.expect("checked above");
    let callee = env.blocks[&caller.block].callees[caller.finished_callees];
    env.blocks
        .get_mut(&caller.block)
        .expect("block data collected")
        .compensation_callees
        .insert(callee);
    caller.last_block = Some(base);
    caller.last_alloc = Some(AllocRef {
        block: base,
        region: env.blocks[&base].callee_cnt(),
    });
    caller.finished_callees += 1;
    caller.finished_preds = PredState::PredsDone;
    queue.push_back(caller);
}

/// Inspect the predecessors of a pending block.
fn classify_preds<P: IrProgram>(env: &WalkEnv<'_, P>, block: BlockId) -> PredState {
    let preds = env.program.predecessors(block);
    let mut missing_plain = false;
    let mut missing_back = false;
    let mut done_back = false;
    for (i, pred) in preds.iter().enumerate() {
        let done = env.blocks[pred].exit_alloc().is_some();
        let back = env.program.is_back_edge(block, i);
        match (done, back) {
            (true, true) => done_back = true,
            (false, true) => missing_back = true,
            (false, false) => missing_plain = true,
            (true, false) => {}
        }
    }
    if missing_plain {
        PredState::PredNotDone
    } else if missing_back {
        PredState::UnfinishedLoop
    } else if done_back {
        PredState::FinishedLoop
    } else if preds.len() > 1 {
        PredState::CondJoin
    } else {
        PredState::PredsDone
    }
}

fn step<P: IrProgram>(
    env: &mut WalkEnv<'_, P>,
    state: &mut WalkState,
    mut item: WalkItem,
    queue: &mut VecDeque<WalkItem>,
) {
    if item.finished_preds == PredState::Unknown {
        item.finished_preds = classify_preds(env, item.block);
    }
    if item.finished_preds == PredState::PredNotDone {
        tracing::trace!(block = ?item.block, "predecessors pending, deferring");
        return;
    }
    let block = item.block;

    // Merge blocks get pushed once per predecessor; only the final push,
    // and loop-closure revisits, do any work.
    if item.finished_callees == 0
        && env.blocks[&block].allocations.first().is_some_and(Option::is_some)
        && item.finished_preds != PredState::FinishedLoop
    {
        resume_if_duplicate_descent(env, item, queue);
        return;
    }

    if item.finished_preds == PredState::FinishedLoop {
        join::close_loop(env.program, env.blocks, env.loops, env.registry, &item);
        let innermost = *item.cur_loops.last().expect("loop closure inside a loop");
        let exit_region = env.blocks[&block].callee_cnt();
        let mut outer_loops = item.cur_loops.clone();
        outer_loops.pop();
        for succ in env.program.successors(block) {
            if env.program.loop_of(succ) == Some(innermost) {
                continue;
            }
            queue.push_back(WalkItem {
                block: succ,
                last_block: Some(block),
                last_alloc: Some(AllocRef {
                    block,
                    region: exit_region,
                }),
                caller: item.caller.clone(),
                finished_callees: 0,
                finished_preds: PredState::Unknown,
                irg_exec_freq: item.irg_exec_freq,
                activation: item.activation,
                cur_loops: outer_loops.clone(),
            });
        }
        return;
    }

    if item.finished_preds == PredState::UnfinishedLoop {
        let lp = env
            .program
            .loop_of(block)
            .expect("unfinished-loop entry lies in a loop");
        item.cur_loops.push(lp);
        let proc = env.program.containing_proc(block);
        env.loops.insert(lp, LoopData::new(block, proc));
    }

    let proc = env.program.containing_proc(block);
    if env.program.end_block(proc) == block {
        // End of the procedure: reconcile the return blocks and resume the
        // caller behind the finished call, once per activation.
        let Some(caller) = item.caller else {
            return;
        };
        if !state.returned.insert(item.activation) {
            return;
        }
        let base = join::join_return(env.program, env.blocks, env.registry, block);
        let mut caller = *caller;
        caller.last_block = Some(base);
        caller.last_alloc = Some(AllocRef {
            block: base,
            region: env.blocks[&base].callee_cnt(),
        });
        caller.finished_callees += 1;
        caller.finished_preds = PredState::PredsDone;
        queue.push_back(caller);
        return;
    }

    if item.finished_preds == PredState::CondJoin {
        let last = item.last_block.expect("joined item has a predecessor");
        join::join_cond(env.program, env.blocks, env.registry, block, last);
    }

    // Solve this region's configuration.
    let region = item.finished_callees;
    let exec_freq = env.blocks[&block].max_exec_freq;
    tracing::trace!(?block, region, exec_freq, irg_freq = item.irg_exec_freq, "solving region");
    let result = {
        let pred_alloc = item.last_alloc.map(|r| {
            env.blocks[&r.block].allocations[r.region]
                .as_ref()
                .expect("predecessor configuration computed")
        });
        let dead_set = item
            .last_block
            .and_then(|lb| env.blocks[&lb].dead_set.as_ref());
        let ctx = SolveCtx {
            props: env.props,
            registry: env.registry,
            exec_freq,
            accesses: &env.blocks[&block].regions[region],
        };
        solve_region(&ctx, pred_alloc, dead_set)
    };

    // Record what the region touches for every open loop.
    let accessed: Vec<_> = env.blocks[&block].regions[region]
        .iter()
        .map(|a| a.var)
        .collect();
    for &lp in &item.cur_loops {
        let l_data = env.loops.get_mut(&lp).expect("loop data recorded");
        if !l_data.members.contains(&block) {
            l_data.members.push(block);
        }
        for &var in &accessed {
            if env.registry.kind_of(var) != VarKind::Stack || l_data.proc == proc {
                l_data.mem_accesses.insert(var);
            }
        }
    }

    let data = env.blocks.get_mut(&block).expect("block data collected");
    data.allocations[region] = Some(result);

    // A pending call either descends into the callee or, across a frequency
    // boundary, stays put and marks the call site for compensation.
    let next_callee = env.blocks[&block].callees.get(region).copied();
    if let Some(callee) = next_callee {
        let callee_start = env.program.start_block(callee);
        let callee_freq = env.blocks[&callee_start].max_exec_freq;
        if (callee_freq - exec_freq).abs() < FREQ_EPSILON {
            let snapshot = item.clone();
            state.next_activation += 1;
            queue.push_back(WalkItem {
                block: callee_start,
                last_block: Some(block),
                last_alloc: Some(AllocRef { block, region }),
                caller: Some(Box::new(snapshot)),
                finished_callees: 0,
                finished_preds: PredState::Unknown,
                irg_exec_freq: exec_freq,
                activation: state.next_activation,
                cur_loops: item.cur_loops.clone(),
            });
        } else {
            tracing::debug!(
                ?block,
                ?callee,
                callee_freq,
                block_freq = exec_freq,
                "frequency boundary, compensating around call"
            );
            env.blocks
                .get_mut(&block)
                .expect("block data collected")
                .compensation_callees
                .insert(callee);
            item.finished_callees += 1;
            item.finished_preds = PredState::PredsDone;
            queue.push_back(item);
        }
        return;
    }

    // Block finished: expand the successors. While a loop is open only
    // in-loop successors are followed; the rest wait for loop closure.
    for succ in env.program.successors(block) {
        if item.finished_preds == PredState::UnfinishedLoop {
            let innermost = *item.cur_loops.last().expect("loop was just opened");
            if env.program.loop_of(succ) != Some(innermost) {
                continue;
            }
        }
        queue.push_back(WalkItem {
            block: succ,
            last_block: Some(block),
            last_alloc: Some(AllocRef { block, region }),
            caller: item.caller.clone(),
            finished_callees: 0,
            finished_preds: PredState::Unknown,
            irg_exec_freq: item.irg_exec_freq,
            activation: item.activation,
            cur_loops: item.cur_loops.clone(),
        });
    }
}
