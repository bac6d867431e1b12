//! Forced eviction when a hot variable arrives and the scratchpad is full.

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

/// A full scratchpad `[X:4][Y:4]` meets a variable with 100 accesses: the
/// first window (X) is evicted, X is written back because it is dirty, and
/// the newcomer takes X's slot.
#[test]
fn hot_variable_forces_out_the_first_window() {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let pb = p.add_block(main, 1.0);
    let j = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(pb, j);
    p.edge(j, e);
    p.set_end(main, e);

    let x = VarId(1);
    let y = VarId(2);
    let z = VarId(3);

    // Predecessor fills the scratchpad: X (dirty) at 0, Y at 4.
    p.write(pb, x, 4);
    p.write(pb, x, 4);
    p.read(pb, y, 4);
    p.read(pb, y, 4);

    // The next block hammers Z and touches X and Y once each.
    for _ in 0..100 {
        p.read(j, z, 4);
    }
    p.read(j, x, 4);
    p.read(j, y, 4);

    let alloc = SpmAllocator::analyze(&p, props()).unwrap();

    let pred = alloc.allocation(pb, 0).unwrap();
    assert_eq!(pred.layout.addr_of(x), Some(0));
    assert_eq!(pred.layout.addr_of(y), Some(4));
    assert!(pred.modified.contains(&x));

    let result = alloc.allocation(j, 0).unwrap();
    assert_eq!(result.layout.addr_of(z), Some(0));
    assert_eq!(result.layout.addr_of(y), Some(4));
    assert!(!result.resident.contains(&x));
    // X left dirty, so its eviction carries a write-back.
    assert!(result.swapout[&x].is_some());

    let mut emitter = RecordingEmitter::new();
    alloc.apply(&mut emitter).unwrap();
    let entry = EmitPoint::BlockStart(j);
    assert_eq!(emitter.ram_writes_at(entry), vec![x]);
    assert_eq!(emitter.ram_reads_at(entry), vec![z]);
}

/// A clean eviction needs no write-back: the swapout entry stays but its
/// transfer is dropped.
#[test]
fn clean_eviction_has_no_writeback() {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let pb = p.add_block(main, 1.0);
    let j = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(pb, j);
    p.edge(j, e);
    p.set_end(main, e);

    let x = VarId(1);
    let z = VarId(2);

    p.read(pb, x, 8);
    p.read(pb, x, 8);
    for _ in 0..50 {
        p.read(j, z, 8);
    }

    let alloc = SpmAllocator::analyze(&p, props()).unwrap();
    let result = alloc.allocation(j, 0).unwrap();
    assert!(result.swapout.contains_key(&x));
    assert!(result.swapout[&x].is_none());

    let mut emitter = RecordingEmitter::new();
    alloc.apply(&mut emitter).unwrap();
    assert!(emitter
        .ram_writes_at(EmitPoint::BlockStart(j))
        .is_empty());
}
