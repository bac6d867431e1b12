//! Per-region scratchpad configuration solving.
//!
//! A region's configuration is derived from the configuration at the end of
//! its predecessor: surviving contents are carried over, dead stack frames
//! collapse into free space, and the region's accesses are then offered
//! residency in order of decreasing access density. Placement is best-fit
//! into an existing gap when the payoff is positive, or a forced eviction of
//! the cheapest window when the variable does not fit otherwise.

use std::collections::{HashMap, HashSet};

use crate::alloc::access::{VarAccess, VarRegistry};
use crate::alloc::layout::SpmLayout;
use crate::alloc::transfer::Transfer;
use crate::alloc::SpmProperties;
use crate::ir::VarId;

/// The planned scratchpad contents at the exit of one region.
#[derive(Debug, Clone)]
pub struct AllocResult {
    /// Linear occupancy, sentinel first.
    pub layout: SpmLayout,
    /// Variables resident at region exit.
    pub resident: HashSet<VarId>,
    /// Residents whose scratchpad copy is newer than RAM.
    pub modified: HashSet<VarId>,
    /// Variables whose first access in the region is a write.
    pub write_first: HashSet<VarId>,
    /// Copies from RAM to materialise before the region.
    pub copy_in: HashMap<VarId, Transfer>,
    /// Evictions decided during the region. `None` marks a clean eviction
    /// that needs no write-back.
    pub swapout: HashMap<VarId, Option<Transfer>>,
    /// Free bytes left in the scratchpad.
    pub free_space: u32,
    /// Reconciliation transfers appended by join handling, to execute at the
    /// very end of the block.
    pub compensation: Vec<Transfer>,
}

impl AllocResult {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            layout: SpmLayout::new(capacity),
            resident: HashSet::new(),
            modified: HashSet::new(),
            write_first: HashSet::new(),
            copy_in: HashMap::new(),
            swapout: HashMap::new(),
            free_space: capacity,
            compensation: Vec::new(),
        }
    }

    /// Consistency of the configuration as a whole.
    pub fn check(&self) {
        self.layout.check();
        debug_assert_eq!(self.free_space, self.layout.total_gap());
        let in_layout: HashSet<VarId> =
            self.layout.vars().filter_map(|c| c.var).collect();
        debug_assert_eq!(in_layout, self.resident);
        debug_assert!(self.modified.is_subset(&self.resident));
        debug_assert!(self
            .write_first
            .iter()
            .all(|v| self.resident.contains(v) || self.copy_in.contains_key(v)));
    }
}

pub(crate) struct SolveCtx<'a> {
    pub props: &'a SpmProperties,
    pub registry: &'a VarRegistry,
    /// Execution frequency of the enclosing block.
    pub exec_freq: f64,
    /// Region accesses, sorted descending by access density.
    pub accesses: &'a [VarAccess],
}

/// Derive the region's exit configuration from the predecessor's.
pub(crate) fn solve_region(
    ctx: &SolveCtx<'_>,
    pred: Option<&AllocResult>,
    dead_set: Option<&HashSet<VarId>>,
) -> AllocResult {
    let mut result = AllocResult::new(ctx.props.size);
    let mut retain: HashSet<VarId> = HashSet::new();

    if let Some(pred) = pred {
        result.modified.clone_from(&pred.modified);
        for cell in pred.layout.vars() {
            let var = cell.var.expect("occupied cell");
            if dead_set.is_some_and(|d| d.contains(&var)) {
                continue;
            }
            result.layout.place_at(cell.addr, var, cell.size);
            result.resident.insert(var);
        }
        result.modified.retain(|v| result.resident.contains(v));
        result.free_space = result.layout.total_gap();
    }

    for access in ctx.accesses {
        let size = ctx.registry.size_of(access.var);
        if result.resident.contains(&access.var) {
            if !result.swapout.contains_key(&access.var) {
                retain.insert(access.var);
                if access.modified {
                    result.modified.insert(access.var);
                }
            }
        } else if size <= result.free_space {
            // A fitting variable enters only when the payoff is positive.
            if spm_benefit(ctx, &result, access, &[]) > 0.0
                && !best_fit_insert(ctx, &mut result, access)
            {
                force_insert(ctx, &mut result, &retain, access);
            }
        } else {
            force_insert(ctx, &mut result, &retain, access);
        }
    }

    finalize(&mut result);
    result.check();
    result
}

/// Payoff of making `access`'s variable resident, in abstract cycles.
/// Evicted cells contribute their write-back cost and the accesses they
/// lose in this region.
fn spm_benefit(
    ctx: &SolveCtx<'_>,
    result: &AllocResult,
    access: &VarAccess,
    evicted: &[VarId],
) -> f64 {
    let latency_diff = f64::from(ctx.props.latency_diff);
    let size = f64::from(ctx.registry.size_of(access.var));
    let latency_gain = ctx.exec_freq * f64::from(access.access_count) * latency_diff;

    let mut migration_cost = ctx.props.throughput_spm * size;
    let mut evicted_accesses = 0u32;
    for &var in evicted {
        if result.modified.contains(&var) {
            migration_cost +=
                ctx.props.throughput_ram * f64::from(ctx.registry.size_of(var));
        }
        if let Some(a) = ctx.accesses.iter().find(|a| a.var == var) {
            evicted_accesses += a.access_count;
        }
    }
    let latency_loss = ctx.exec_freq * latency_diff * f64::from(evicted_accesses);

    latency_gain - migration_cost - latency_loss
}

/// Insert into the tightest gap that fits. Fails when no gap is big enough.
fn best_fit_insert(ctx: &SolveCtx<'_>, result: &mut AllocResult, access: &VarAccess) -> bool {
    let size = ctx.registry.size_of(access.var);
    let Some(idx) = result.layout.best_fit(size) else {
        return false;
    };
    let addr = result.layout.insert_after(idx, access.var, size);
    record_insertion(ctx, result, access, addr);
    result.free_space -= size;
    true
}

/// Evict the cheapest contiguous window of non-retained cells and place the
/// variable there. Windows are scored by residual gap, first-encountered
/// winning ties. Without any eligible window the variable stays in RAM.
fn force_insert(
    ctx: &SolveCtx<'_>,
    result: &mut AllocResult,
    retain: &HashSet<VarId>,
    access: &VarAccess,
) {
    let size = ctx.registry.size_of(access.var);
    let eligible = |cell: &crate::alloc::layout::SpmCell| {
        cell.var
            .is_some_and(|v| !retain.contains(&v) && !result.copy_in.contains_key(&v))
    };

    let cells = result.layout.cells();
    let mut best: Option<(usize, usize, u32)> = None;
    for start in 1..cells.len() {
        if !eligible(&cells[start]) {
            continue;
        }
        let mut covered = cells[start - 1].gap + cells[start].size + cells[start].gap;
        let mut end = start;
        while covered < size {
            let next = end + 1;
            if next >= cells.len() || !eligible(&cells[next]) {
                break;
            }
            covered += cells[next].size + cells[next].gap;
            end = next;
        }
        if covered < size {
            continue;
        }
        let residue = covered - size;
        if best.is_none_or(|(_, _, r)| residue < r) {
            best = Some((start, end, residue));
        }
    }

    let Some((start, end, residue)) = best else {
        tracing::trace!(var = ?access.var, size, "no eviction window, variable stays in RAM");
        return;
    };

    let window: Vec<VarId> = cells[start..=end]
        .iter()
        .map(|c| c.var.expect("occupied cell"))
        .collect();
    tracing::trace!(
        var = ?access.var,
        ?window,
        residue,
        benefit = spm_benefit(ctx, result, access, &window),
        "forced insertion"
    );

    for _ in start..=end {
        let cell = result.layout.remove(start);
        let var = cell.var.expect("occupied cell");
        result.swapout.insert(
            var,
            Some(Transfer::copy_out(
                var,
                ctx.registry.kind_of(var),
                cell.size,
                cell.addr,
            )),
        );
    }
    let addr = result.layout.insert_after(start - 1, access.var, size);
    debug_assert_eq!(result.layout.cells()[start].gap, residue);
    record_insertion(ctx, result, access, addr);
    result.free_space = result.layout.total_gap();
}

fn record_insertion(
    ctx: &SolveCtx<'_>,
    result: &mut AllocResult,
    access: &VarAccess,
    addr: u32,
) {
    let size = ctx.registry.size_of(access.var);
    result.copy_in.insert(
        access.var,
        Transfer::copy_in(access.var, ctx.registry.kind_of(access.var), size, addr),
    );
    if access.modified {
        result.modified.insert(access.var);
    }
    if access.write_first {
        result.write_first.insert(access.var);
    }
}

/// Promote planned copies to residents, retire evictions, and drop the
/// write-back of anything evicted clean.
fn finalize(result: &mut AllocResult) {
    for var in result.copy_in.keys() {
        result.resident.insert(*var);
    }
    let evicted: Vec<VarId> = result.swapout.keys().copied().collect();
    for var in evicted {
        result.resident.remove(&var);
        let dirty = result.modified.remove(&var);
        if !dirty {
            if let Some(t) = result.swapout.get_mut(&var) {
                *t = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::VarKind;

    fn ctx_props() -> SpmProperties {
        SpmProperties {
            start_addr: 0,
            size: 16,
            latency_diff: 20,
            throughput_ram: 1.0,
            throughput_spm: 1.0,
        }
    }

    fn access(var: u32, count: u32, modified: bool) -> VarAccess {
        VarAccess {
            var: VarId(var),
            access_count: count,
            modified,
            write_first: modified,
            freq_per_byte: 0.0,
        }
    }

    #[test]
    fn benefit_counts_dirty_eviction_writeback() {
        let props = ctx_props();
        let mut registry = VarRegistry::default();
        registry.record(VarId(1), VarKind::Global, 8);
        registry.record(VarId(2), VarKind::Global, 8);

        let mut result = AllocResult::new(16);
        result.layout.place_at(0, VarId(2), 8);
        result.resident.insert(VarId(2));
        result.modified.insert(VarId(2));
        result.free_space = result.layout.total_gap();

        let accesses = vec![access(1, 3, false), access(2, 2, false)];
        let ctx = SolveCtx {
            props: &props,
            registry: &registry,
            exec_freq: 1.0,
            accesses: &accesses,
        };
        // gain = 3*20 = 60; migration = 8 (in) + 8 (dirty out); loss = 2*20.
        let benefit = spm_benefit(&ctx, &result, &accesses[0], &[VarId(2)]);
        assert!((benefit - (60.0 - 16.0 - 40.0)).abs() < 1e-9);
    }

    #[test]
    fn forced_insert_prefers_smallest_residue_window() {
        let props = ctx_props();
        let mut registry = VarRegistry::default();
        registry.record(VarId(1), VarKind::Global, 4);
        registry.record(VarId(2), VarKind::Global, 8);
        registry.record(VarId(3), VarKind::Global, 8);

        let mut result = AllocResult::new(16);
        result.layout.place_at(0, VarId(1), 4);
        result.layout.place_at(8, VarId(2), 8);
        result.resident.insert(VarId(1));
        result.resident.insert(VarId(2));
        result.free_space = result.layout.total_gap();

        let accesses = vec![access(3, 5, false)];
        let ctx = SolveCtx {
            props: &props,
            registry: &registry,
            exec_freq: 1.0,
            accesses: &accesses,
        };
        // The window starting at v1 covers its 4 bytes plus the 4-byte gap
        // (residue 0); the window at v2 would leave residue 4. v1 loses.
        force_insert(&ctx, &mut result, &HashSet::new(), &accesses[0]);
        assert!(result.swapout.contains_key(&VarId(1)));
        assert!(!result.swapout.contains_key(&VarId(2)));
        assert_eq!(result.copy_in[&VarId(3)].spm_to, 0);
    }
}
