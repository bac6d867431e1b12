//! Per-block access profiles.
//!
//! One walk over every scheduled instruction produces, per block: the ordered
//! list of outgoing calls and, between consecutive calls, the coalesced
//! variable accesses of that region. Accesses to the same variable inside one
//! region fold into a single record; a call boundary starts a fresh region,
//! so the same variable seen on both sides yields two records.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::alloc::solve::AllocResult;
use crate::alloc::SpmProperties;
use crate::ir::{BlockId, InstrAccess, IrProgram, ProcId, VarId, VarKind};

/// Canonical record for an allocatable object. Created on first sighting and
/// immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct VarInfo {
    pub id: VarId,
    pub size: u32,
    pub kind: VarKind,
}

/// Owns every [`VarInfo`] for the duration of a compilation unit.
#[derive(Debug, Default)]
pub struct VarRegistry {
    infos: HashMap<VarId, VarInfo>,
}

impl VarRegistry {
    pub fn record(&mut self, id: VarId, kind: VarKind, size: u32) {
        self.infos.entry(id).or_insert(VarInfo { id, size, kind });
    }

    /// Look up a registered variable. Unregistered ids indicate a broken
    /// invariant upstream.
    #[must_use]
    pub fn get(&self, id: VarId) -> &VarInfo {
        self.infos
            .get(&id)
            .expect("variable accessed but never registered")
    }

    #[must_use]
    pub fn size_of(&self, id: VarId) -> u32 {
        self.get(id).size
    }

    #[must_use]
    pub fn kind_of(&self, id: VarId) -> VarKind {
        self.get(id).kind
    }
}

/// Coalesced accesses to one variable within one region.
#[derive(Debug, Clone)]
pub struct VarAccess {
    pub var: VarId,
    pub access_count: u32,
    /// Some access in the region writes the variable.
    pub modified: bool,
    /// The first access in the region is a write, so bringing the variable
    /// in needs no copy from RAM.
    pub write_first: bool,
    /// `access_count / size`, the sort key within a region.
    pub freq_per_byte: f64,
}

/// Everything the allocator knows about one block.
#[derive(Debug)]
pub struct BlockData {
    /// Outgoing calls in schedule order.
    pub callees: Vec<ProcId>,
    /// `callees.len() + 1` access regions: `regions[i]` covers the code
    /// between call `i-1` and call `i` (the block edges for the outermost
    /// two). Sorted descending by access density once collection finishes.
    pub regions: Vec<Vec<VarAccess>>,
    /// Highest execution frequency over all interprocedural contexts.
    pub max_exec_freq: f64,
    /// One scratchpad configuration per region, filled by the walker.
    pub allocations: Vec<Option<AllocResult>>,
    /// Callees whose entry configuration must be established by
    /// compensation code at the call site.
    pub compensation_callees: HashSet<ProcId>,
    /// Stack variables whose last use is in this block. Present only on
    /// predecessors of the procedure's exit block.
    pub dead_set: Option<HashSet<VarId>>,
}

impl BlockData {
    fn new() -> Self {
        Self {
            callees: Vec::new(),
            regions: vec![Vec::new()],
            max_exec_freq: 0.0,
            allocations: Vec::new(),
            compensation_callees: HashSet::new(),
            dead_set: None,
        }
    }

    #[must_use]
    pub fn callee_cnt(&self) -> usize {
        self.callees.len()
    }

    /// The configuration at the very end of the block, once computed.
    #[must_use]
    pub fn exit_alloc(&self) -> Option<&AllocResult> {
        self.allocations.last().and_then(Option::as_ref)
    }
}

/// Walk every procedure and build the per-block profiles.
pub fn collect_program<P: IrProgram>(
    program: &P,
    props: &SpmProperties,
    registry: &mut VarRegistry,
) -> BTreeMap<BlockId, BlockData> {
    let mut blocks = BTreeMap::new();
    for proc in program.procedures() {
        collect_proc(program, props, registry, proc, &mut blocks);
    }
    for data in blocks.values_mut() {
        finish_block(data, registry);
    }
    blocks
}

fn collect_proc<P: IrProgram>(
    program: &P,
    props: &SpmProperties,
    registry: &mut VarRegistry,
    proc: ProcId,
    blocks: &mut BTreeMap<BlockId, BlockData>,
) {
    let mut stack_vars: HashSet<VarId> = HashSet::new();

    for block in program.blocks(proc) {
        let mut data = BlockData::new();
        for instr in program.instructions(block) {
            match program.retrieve_access(instr) {
                Some(InstrAccess::Call(callee)) => {
                    data.callees.push(callee);
                    data.regions.push(Vec::new());
                }
                Some(InstrAccess::Var {
                    var,
                    kind,
                    size,
                    modified,
                }) => {
                    if size > props.size {
                        tracing::debug!(
                            ?var,
                            size,
                            capacity = props.size,
                            "variable exceeds scratchpad capacity, ignoring"
                        );
                        continue;
                    }
                    registry.record(var, kind, size);
                    if kind == VarKind::Stack {
                        stack_vars.insert(var);
                    }
                    let region = data
                        .regions
                        .last_mut()
                        .expect("block always has an open region");
                    if let Some(existing) = region.iter_mut().find(|a| a.var == var) {
                        existing.access_count += 1;
                        existing.modified |= modified;
                    } else {
                        region.push(VarAccess {
                            var,
                            access_count: 1,
                            modified,
                            write_first: modified,
                            freq_per_byte: 0.0,
                        });
                    }
                }
                None => {}
            }
        }
        blocks.insert(block, data);
    }

    // The stack frame dies at return: every return block (predecessor of the
    // exit block) carries the procedure's stack variables as its dead set.
    let end = program.end_block(proc);
    for pred in program.predecessors(end) {
        if let Some(data) = blocks.get_mut(&pred) {
            data.dead_set = Some(stack_vars.clone());
        }
    }
}

fn finish_block(data: &mut BlockData, registry: &VarRegistry) {
    for region in &mut data.regions {
        for access in region.iter_mut() {
            access.freq_per_byte =
                f64::from(access.access_count) / f64::from(registry.size_of(access.var));
        }
        // Stable sort: equal densities keep schedule order.
        region.sort_by(|a, b| {
            b.freq_per_byte
                .partial_cmp(&a.freq_per_byte)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    data.allocations = (0..data.regions.len()).map(|_| None).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::MockProgram;

    #[test]
    fn accesses_coalesce_within_a_region_only() {
        let mut p = MockProgram::new();
        let main = p.add_proc();
        p.set_main(main);
        let callee = p.add_proc();
        let cb = p.add_block(callee, 1.0);
        let ce = p.add_block(callee, 1.0);
        p.edge(cb, ce);
        p.set_end(callee, ce);

        let b = p.add_block(main, 1.0);
        let e = p.add_block(main, 1.0);
        p.edge(b, e);
        p.set_end(main, e);

        let v = VarId(7);
        p.read(b, v, 4);
        p.write(b, v, 4);
        p.call(b, callee);
        p.read(b, v, 4);

        let props = SpmProperties::default();
        let mut registry = VarRegistry::default();
        let blocks = collect_program(&p, &props, &mut registry);

        let data = &blocks[&b];
        assert_eq!(data.callee_cnt(), 1);
        assert_eq!(data.regions.len(), 2);
        assert_eq!(data.regions[0].len(), 1);
        assert_eq!(data.regions[0][0].access_count, 2);
        assert!(data.regions[0][0].modified);
        assert!(!data.regions[0][0].write_first);
        assert_eq!(data.regions[1].len(), 1);
        assert_eq!(data.regions[1][0].access_count, 1);
        assert!(!data.regions[1][0].modified);
    }

    #[test]
    fn regions_sort_by_access_density() {
        let mut p = MockProgram::new();
        let main = p.add_proc();
        p.set_main(main);
        let b = p.add_block(main, 1.0);
        let e = p.add_block(main, 1.0);
        p.edge(b, e);
        p.set_end(main, e);

        let slow = VarId(1);
        let dense = VarId(2);
        p.read(b, slow, 16);
        p.read(b, dense, 4);
        p.read(b, dense, 4);

        let props = SpmProperties::default();
        let mut registry = VarRegistry::default();
        let blocks = collect_program(&p, &props, &mut registry);

        let region = &blocks[&b].regions[0];
        assert_eq!(region[0].var, dense);
        assert_eq!(region[1].var, slow);
    }

    #[test]
    fn oversized_variables_are_dropped() {
        let mut p = MockProgram::new();
        let main = p.add_proc();
        p.set_main(main);
        let b = p.add_block(main, 1.0);
        let e = p.add_block(main, 1.0);
        p.edge(b, e);
        p.set_end(main, e);

        p.read(b, VarId(1), 4096);

        let props = SpmProperties {
            size: 64,
            ..SpmProperties::default()
        };
        let mut registry = VarRegistry::default();
        let blocks = collect_program(&p, &props, &mut registry);
        assert!(blocks[&b].regions[0].is_empty());
    }
}
