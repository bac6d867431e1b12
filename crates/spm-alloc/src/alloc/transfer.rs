//! Copy transfers between RAM and the scratchpad, and the configuration
//! diff that synthesises them.

use crate::alloc::access::VarRegistry;
use crate::alloc::solve::AllocResult;
use crate::ir::{VarId, VarKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// RAM to scratchpad.
    In,
    /// Scratchpad to RAM.
    Out,
    /// Scratchpad to scratchpad.
    Mov,
}

/// One planned copy of a whole variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: Direction,
    pub var: VarId,
    pub kind: VarKind,
    pub size: u32,
    /// Scratchpad source offset (valid for `Out` and `Mov`).
    pub spm_from: u32,
    /// Scratchpad destination offset (valid for `In` and `Mov`).
    pub spm_to: u32,
}

impl Transfer {
    #[must_use]
    pub fn copy_in(var: VarId, kind: VarKind, size: u32, to: u32) -> Self {
        Self {
            direction: Direction::In,
            var,
            kind,
            size,
            spm_from: 0,
            spm_to: to,
        }
    }

    #[must_use]
    pub fn copy_out(var: VarId, kind: VarKind, size: u32, from: u32) -> Self {
        Self {
            direction: Direction::Out,
            var,
            kind,
            size,
            spm_from: from,
            spm_to: 0,
        }
    }

    #[must_use]
    pub fn relocate(var: VarId, kind: VarKind, size: u32, from: u32, to: u32) -> Self {
        Self {
            direction: Direction::Mov,
            var,
            kind,
            size,
            spm_from: from,
            spm_to: to,
        }
    }
}

/// Synthesise the ordered transfer sequence that turns a scratchpad in
/// configuration `source` into configuration `target`.
///
/// Both layouts are walked in address order. Before any target cell is
/// written, every source cell its bytes overlap is retired first: a dirty
/// variable that is not resident in `target` is flushed to RAM, a clean one
/// is simply dropped. A variable resident in both but at different addresses
/// moves within the scratchpad; one absent from `source` is fetched from
/// RAM. Source cells beyond the last target cell are flushed at the end.
pub fn diff(target: &AllocResult, source: &AllocResult, registry: &VarRegistry) -> Vec<Transfer> {
    let mut transfers = Vec::new();
    let src: Vec<_> = source.layout.vars().collect();
    let mut si = 0;

    let flush = |transfers: &mut Vec<Transfer>, cell: &crate::alloc::layout::SpmCell| {
        let var = cell.var.expect("occupied cell");
        if !target.resident.contains(&var) && source.modified.contains(&var) {
            transfers.push(Transfer::copy_out(
                var,
                registry.kind_of(var),
                cell.size,
                cell.addr,
            ));
        }
    };

    for cell in target.layout.vars() {
        let var = cell.var.expect("occupied cell");
        let end = cell.addr + cell.size;
        let mut matched = false;
        while si < src.len() && src[si].addr < end {
            if src[si].addr == cell.addr && src[si].var == cell.var {
                matched = true;
            } else {
                flush(&mut transfers, src[si]);
            }
            si += 1;
        }
        if matched {
            continue;
        }
        if source.resident.contains(&var) {
            let from = source
                .layout
                .addr_of(var)
                .expect("resident variable has a cell");
            transfers.push(Transfer::relocate(
                var,
                registry.kind_of(var),
                cell.size,
                from,
                cell.addr,
            ));
        } else {
            transfers.push(Transfer::copy_in(
                var,
                registry.kind_of(var),
                cell.size,
                cell.addr,
            ));
        }
    }

    while si < src.len() {
        flush(&mut transfers, src[si]);
        si += 1;
    }

    transfers
}
