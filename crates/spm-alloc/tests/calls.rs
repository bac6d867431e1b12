//! Interprocedural behaviour: descending into hot callees, compensating
//! around cold call sites, and reclaiming dead stack frames after returns.

use spm_alloc::test_harness::*;
use spm_alloc::{EmitPoint, SpmAllocator, SpmProperties, VarId};

fn props() -> SpmProperties {
    SpmProperties {
        start_addr: 0,
        size: 16,
        latency_diff: 20,
        throughput_ram: 1.0,
        throughput_spm: 1.0,
    }
}

struct Fixture {
    program: MockProgram,
    m1: spm_alloc::BlockId,
    m2: spm_alloc::BlockId,
    fb: spm_alloc::BlockId,
    f: spm_alloc::ProcId,
    call2: spm_alloc::InstrId,
    a: VarId,
    s: VarId,
    g: VarId,
    d: VarId,
}

/// Main calls F twice: from hot M1 (frequency 10, matching F's entry) and
/// from cold M2 (frequency 1). F touches a stack slot S and a global G.
fn build() -> Fixture {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let f = p.add_proc();

    let fb = p.add_block(f, 1.0);
    let fe = p.add_block(f, 1.0);
    p.edge(fb, fe);
    p.set_end(f, fe);

    let m1 = p.add_block(main, 10.0);
    let m2 = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(m1, m2);
    p.edge(m2, e);
    p.set_end(main, e);

    let a = VarId(1);
    let s = VarId(2);
    let g = VarId(3);
    let d = VarId(4);

    p.read(m1, a, 4);
    p.read(m1, a, 4);
    p.read(m1, a, 4);
    p.call(m1, f);

    p.stack_write(fb, s, 4);
    p.stack_write(fb, s, 4);
    p.read(fb, g, 4);

    for _ in 0..5 {
        p.write(m2, d, 4);
    }
    let call2 = p.call(m2, f);

    Fixture {
        program: p,
        m1,
        m2,
        fb,
        f,
        call2,
        a,
        s,
        g,
        d,
    }
}

#[test]
fn hot_call_descends_and_callee_inherits_the_caller_configuration() {
    let fx = build();
    let alloc = SpmAllocator::analyze(&fx.program, props()).unwrap();

    let callee_entry = alloc.allocation(fx.fb, 0).unwrap();
    assert!(callee_entry.resident.contains(&fx.a));
    assert_eq!(callee_entry.layout.addr_of(fx.s), Some(4));
    assert_eq!(callee_entry.layout.addr_of(fx.g), Some(8));

    // The hot call site needs no compensation code.
    assert!(!alloc
        .block_data(fx.m1)
        .unwrap()
        .compensation_callees
        .contains(&fx.f));
}

#[test]
fn dead_stack_slots_are_reclaimed_after_the_return() {
    let fx = build();
    let alloc = SpmAllocator::analyze(&fx.program, props()).unwrap();

    // The return block's dead set drops F's frame from the caller's view.
    let resumed = alloc.allocation(fx.m1, 1).unwrap();
    assert!(!resumed.resident.contains(&fx.s));
    assert!(resumed.resident.contains(&fx.a));
    assert!(resumed.resident.contains(&fx.g));
    assert_eq!(resumed.free_space, 8);

    // Downstream blocks never see the dead slot either.
    let after = alloc.allocation(fx.m2, 0).unwrap();
    assert!(!after.resident.contains(&fx.s));
}

/// Two call sites at the callee's own frequency: the first descends, the
/// second reuses the callee's configurations, resumes behind the call and
/// gets entry compensation instead of a second descent.
#[test]
fn second_equal_frequency_call_site_reuses_the_callee() {
    let mut p = MockProgram::new();
    let main = p.add_proc();
    p.set_main(main);
    let f = p.add_proc();

    let fb = p.add_block(f, 1.0);
    let fe = p.add_block(f, 1.0);
    p.edge(fb, fe);
    p.set_end(f, fe);

    let m1 = p.add_block(main, 1.0);
    let m2 = p.add_block(main, 1.0);
    let e = p.add_block(main, 1.0);
    p.edge(m1, m2);
    p.edge(m2, e);
    p.set_end(main, e);

    let g = VarId(1);
    p.read(fb, g, 4);
    p.read(fb, g, 4);
    p.call(m1, f);
    p.call(m2, f);

    let alloc = SpmAllocator::analyze(&p, props()).unwrap();

    // The callee was solved once; both callers carry a full allocation set.
    assert!(alloc.allocation(fb, 0).is_some());
    assert!(alloc.allocation(m1, 1).is_some());
    assert!(alloc.allocation(m2, 1).is_some());
    assert!(alloc
        .block_data(m2)
        .unwrap()
        .compensation_callees
        .contains(&f));
    // The resumed caller sees the callee's exit configuration.
    assert!(alloc.allocation(m2, 1).unwrap().resident.contains(&g));
}

#[test]
fn cold_call_site_is_compensated_not_descended() {
    let fx = build();
    let alloc = SpmAllocator::analyze(&fx.program, props()).unwrap();

    assert!(alloc
        .block_data(fx.m2)
        .unwrap()
        .compensation_callees
        .contains(&fx.f));

    // The callee keeps the configuration computed from the hot site: its
    // entry was solved exactly once, against M1's exit.
    let callee_entry = alloc.allocation(fx.fb, 0).unwrap();
    assert!(callee_entry.resident.contains(&fx.a));

    // The caller's configuration around the cold call is unchanged by it.
    let before_call = alloc.allocation(fx.m2, 0).unwrap();
    let after_call = alloc.allocation(fx.m2, 1).unwrap();
    assert!(after_call.resident.contains(&fx.a));
    assert!(!after_call.resident.contains(&fx.d) || before_call.resident.contains(&fx.d));

    // Entry compensation runs right before the call instruction: the dirty
    // local traffic D is flushed and the callee's expected S fetched.
    let mut emitter = RecordingEmitter::new();
    alloc.apply(&mut emitter).unwrap();
    let before = EmitPoint::Before(fx.call2);
    assert_eq!(emitter.ram_writes_at(before), vec![fx.d]);
    assert_eq!(emitter.ram_reads_at(before), vec![fx.s]);
}
