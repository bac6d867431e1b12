//! Compensation at conditional merges: the non-base predecessor is morphed
//! into the base's configuration at the end of its block.

use spm_alloc::alloc::Direction;
use spm_alloc::test_harness::*;
use spm_alloc::{EmitPoint, SpmAllocator, SpmProperties, VarId};

fn props() -> SpmProperties {
    SpmProperties {
        start_addr: 0,
        size: 8,
        latency_diff: 20,
        throughput_ram: 1.0,
        throughput_spm: 1.0,
    }
}

/// Diamond with unequal path lengths, so one predecessor finishes last and
/// becomes the join base. The other predecessor's exit `[A][B]` must turn
/// into the base's `[A][C]`: write back the dirty B, fetch C into its slot.
#[test]
fn cond_join_attaches_compensation_to_non_base_pred() {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let s = p.add_block(main, 1.0);
    let p1 = p.add_block(main, 1.0);
    let c2 = p.add_block(main, 1.0);
    let p2 = p.add_block(main, 1.0);
    let j = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(s, p1);
    p.edge(s, c2);
    p.edge(c2, p2);
    p.edge(p1, j);
    p.edge(p2, j);
    p.edge(j, e);
    p.set_end(main, e);

    let a = VarId(1);
    let b = VarId(2);
    let c = VarId(3);

    p.read(p1, a, 4);
    p.read(p1, a, 4);
    p.write(p1, b, 4);

    p.read(p2, a, 4);
    p.read(p2, a, 4);
    p.read(p2, c, 4);

    let alloc = SpmAllocator::analyze(&p, props()).unwrap();

    let exit1 = alloc.allocation(p1, 0).unwrap();
    assert_eq!(exit1.layout.addr_of(a), Some(0));
    assert_eq!(exit1.layout.addr_of(b), Some(4));
    let exit2 = alloc.allocation(p2, 0).unwrap();
    assert_eq!(exit2.layout.addr_of(c), Some(4));

    // P2 finished last, so it is the base and carries no compensation.
    assert!(exit2.compensation.is_empty());
    assert_eq!(exit1.compensation.len(), 2);
    assert_eq!(exit1.compensation[0].direction, Direction::Out);
    assert_eq!(exit1.compensation[0].var, b);
    assert_eq!(exit1.compensation[1].direction, Direction::In);
    assert_eq!(exit1.compensation[1].var, c);
    assert_eq!(exit1.compensation[1].spm_to, 4);

    // The join block continues from the base configuration.
    let joined = alloc.allocation(j, 0).unwrap();
    assert!(joined.resident.contains(&a));
    assert!(joined.resident.contains(&c));
    assert!(!joined.resident.contains(&b));

    // Compensation is materialised at the end of the non-base block.
    let mut emitter = RecordingEmitter::new();
    alloc.apply(&mut emitter).unwrap();
    let end1 = EmitPoint::BlockEnd(p1);
    assert_eq!(emitter.ram_writes_at(end1), vec![b]);
    assert_eq!(emitter.ram_reads_at(end1), vec![c]);
    assert!(emitter.copies_at(EmitPoint::BlockEnd(p2)).is_empty());
}

/// Identical predecessor configurations need no compensation at all.
#[test]
fn identical_exits_join_without_traffic() {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let s = p.add_block(main, 1.0);
    let p1 = p.add_block(main, 1.0);
    let p2 = p.add_block(main, 1.0);
    let j = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(s, p1);
    p.edge(s, p2);
    p.edge(p1, j);
    p.edge(p2, j);
    p.edge(j, e);
    p.set_end(main, e);

    let a = VarId(1);
    p.read(s, a, 4);
    p.read(s, a, 4);

    let alloc = SpmAllocator::analyze(&p, props()).unwrap();
    assert!(alloc.allocation(p1, 0).unwrap().compensation.is_empty());
    assert!(alloc.allocation(p2, 0).unwrap().compensation.is_empty());
}
