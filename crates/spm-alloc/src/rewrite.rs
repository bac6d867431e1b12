//! Instruction-level application of the computed allocation.
//!
//! Two passes per allocated block: resident memory accesses are retargeted
//! to their scratchpad addresses, then the planned transfers are
//! materialised as chunked load/store sequences at region boundaries. Each
//! copy batch is bracketed by a scratch-register save/restore when the
//! register is live at the insertion point.

use std::collections::BTreeMap;

use crate::alloc::access::{BlockData, VarRegistry};
use crate::alloc::join::LoopData;
use crate::alloc::solve::AllocResult;
use crate::alloc::transfer::{diff, Direction, Transfer};
use crate::alloc::SpmProperties;
use crate::emit::{ChunkWidth, CopyAddr, EmitPoint, Emitter};
use crate::error::Result;
use crate::ir::{BlockId, InstrAccess, IrProgram, LoopId};

pub(crate) fn apply<P: IrProgram, E: Emitter>(
    program: &P,
    props: &SpmProperties,
    registry: &VarRegistry,
    blocks: &BTreeMap<BlockId, BlockData>,
    loops: &BTreeMap<LoopId, LoopData>,
    emitter: &mut E,
) -> Result<()> {
    for (&block, data) in blocks {
        if data.allocations.first().is_none_or(Option::is_none) {
            continue;
        }
        // Retargeting must run first; transfer code added afterwards would
        // otherwise be rewritten as well.
        retarget_block(program, props, block, data, emitter)?;
        insert_block_transfers(program, props, registry, blocks, block, data, emitter)?;
    }

    for l_data in loops.values() {
        if l_data.transfers.is_empty() {
            continue;
        }
        let pre_header = pre_header_of(program, l_data.header);
        tracing::debug!(header = ?l_data.header, ?pre_header, n = l_data.transfers.len(), "loop entry transfers");
        emit_batch(
            emitter,
            props,
            EmitPoint::BlockEnd(pre_header),
            &l_data.transfers,
        )?;
    }
    Ok(())
}

/// Rewrite every scheduled access whose variable is resident in the
/// surrounding region's configuration.
fn retarget_block<P: IrProgram, E: Emitter>(
    program: &P,
    props: &SpmProperties,
    block: BlockId,
    data: &BlockData,
    emitter: &mut E,
) -> Result<()> {
    let mut region = 0usize;
    for instr in program.instructions(block) {
        match program.retrieve_access(instr) {
            Some(InstrAccess::Call(_)) => region += 1,
            Some(InstrAccess::Var { var, .. }) => {
                let Some(alloc) = data.allocations[region].as_ref() else {
                    continue;
                };
                if alloc.resident.contains(&var) {
                    let addr = alloc
                        .layout
                        .addr_of(var)
                        .expect("resident variable has a cell");
                    emitter.retarget_access(instr, props.start_addr + addr)?;
                }
            }
            None => {}
        }
    }
    Ok(())
}

fn insert_block_transfers<P: IrProgram, E: Emitter>(
    program: &P,
    props: &SpmProperties,
    registry: &VarRegistry,
    blocks: &BTreeMap<BlockId, BlockData>,
    block: BlockId,
    data: &BlockData,
    emitter: &mut E,
) -> Result<()> {
    // Merge compensation runs at the very end of the block.
    if let Some(exit) = data.exit_alloc() {
        emit_batch(emitter, props, EmitPoint::BlockEnd(block), &exit.compensation)?;
    }

    // Around each call: entry compensation before it when the callee was not
    // descended into, the next region's traffic after it.
    let mut region = 0usize;
    for instr in program.instructions(block) {
        let Some(InstrAccess::Call(callee)) = program.retrieve_access(instr) else {
            continue;
        };
        if data.compensation_callees.contains(&callee) {
            let callee_start = program.start_block(callee);
            let entry_alloc = blocks
                .get(&callee_start)
                .and_then(|d| d.allocations.first())
                .and_then(Option::as_ref);
            if let (Some(entry), Some(here)) = (entry_alloc, data.allocations[region].as_ref())
            {
                let transfers = diff(entry, here, registry);
                emit_batch(emitter, props, EmitPoint::Before(instr), &transfers)?;
            }
        }
        region += 1;
        if let Some(alloc) = data.allocations[region].as_ref() {
            let batch = allocation_batch(alloc);
            emit_batch(emitter, props, EmitPoint::After(instr), &batch)?;
        }
    }

    // Region 0 traffic establishes the block's entry configuration.
    if let Some(alloc) = data.allocations[0].as_ref() {
        let batch = allocation_batch(alloc);
        emit_batch(emitter, props, EmitPoint::BlockStart(block), &batch)?;
    }
    Ok(())
}

/// The materialised traffic of one configuration: evictions first in
/// address order, then fills, skipping fills whose first access overwrites
/// the variable anyway.
fn allocation_batch(alloc: &AllocResult) -> Vec<Transfer> {
    let mut outs: Vec<Transfer> = alloc.swapout.values().flatten().cloned().collect();
    outs.sort_by_key(|t| t.spm_from);
    let mut ins: Vec<Transfer> = alloc
        .copy_in
        .values()
        .filter(|t| !alloc.write_first.contains(&t.var))
        .cloned()
        .collect();
    ins.sort_by_key(|t| t.spm_to);
    outs.extend(ins);
    outs
}

fn emit_batch<E: Emitter>(
    emitter: &mut E,
    props: &SpmProperties,
    point: EmitPoint,
    transfers: &[Transfer],
) -> Result<()> {
    if transfers.is_empty() {
        return Ok(());
    }
    let bracket = emitter.scratch_live(point);
    if bracket {
        emitter.push_scratch(point)?;
    }
    for transfer in transfers {
        emit_transfer(emitter, props, point, transfer)?;
    }
    if bracket {
        emitter.pop_scratch(point)?;
        emitter.repair_ssa(point)?;
    }
    Ok(())
}

/// Decompose one transfer into load/store chunks the target can move
/// through a single register.
fn emit_transfer<E: Emitter>(
    emitter: &mut E,
    props: &SpmProperties,
    point: EmitPoint,
    transfer: &Transfer,
) -> Result<()> {
    let mut offset = 0u32;
    let mut remaining = transfer.size;
    while remaining > 0 {
        let width = ChunkWidth::for_remaining(remaining);
        let (from, to) = match transfer.direction {
            Direction::In => (
                CopyAddr::Ram {
                    var: transfer.var,
                    kind: transfer.kind,
                    offset,
                },
                CopyAddr::Spm {
                    addr: props.start_addr + transfer.spm_to + offset,
                },
            ),
            Direction::Out => (
                CopyAddr::Spm {
                    addr: props.start_addr + transfer.spm_from + offset,
                },
                CopyAddr::Ram {
                    var: transfer.var,
                    kind: transfer.kind,
                    offset,
                },
            ),
            Direction::Mov => (
                CopyAddr::Spm {
                    addr: props.start_addr + transfer.spm_from + offset,
                },
                CopyAddr::Spm {
                    addr: props.start_addr + transfer.spm_to + offset,
                },
            ),
        };
        emitter.emit_copy(point, from, to, width)?;
        offset += width.bytes();
        remaining -= width.bytes();
    }
    Ok(())
}

fn pre_header_of<P: IrProgram>(program: &P, header: BlockId) -> BlockId {
    let preds = program.predecessors(header);
    preds
        .iter()
        .enumerate()
        .find(|&(i, _)| !program.is_back_edge(header, i))
        .map(|(_, &b)| b)
        .expect("loop header has a forward predecessor")
}
