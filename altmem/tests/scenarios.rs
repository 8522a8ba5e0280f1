use altmem::*;
use altmem::algo::{altmem, slicing::SliceOptions, Options, PickerConfig};
use altmem::algo::comparator::BaseOrder;

fn options(capacity: ByteSteps, max_overlap: Time) -> Options {
    Options {
        picker:     PickerConfig::InstructionCount { min_overlap: 2, max_overlap },
        base_order: BaseOrder::Size,
        verify:     true,
        ..Options::with_capacity(capacity)
    }
}

/// Alternate memory epochs of `id` alive at `t`.
fn alive_at(plan: &Plan, id: ValueId, t: Time) -> usize {
    plan.chain(id)
        .iter()
        .filter(|a| a.chunk().is_some() && a.interval().contains(t))
        .count()
}

#[test]
fn resource_timeline_shifts_into_slack() {
    let mut r = AsynchronousCopyResource::new(vec![2.0, 3.0, 1.0, 6.0, 7.0, 1.0, 7.0, 2.0, 2.0, 4.0]);
    let copy = |id, start, end, resource| AsynchronousCopy {
        start,
        end,
        resource,
        space: MemorySpace::Alternate,
        id,
    };
    assert!(r.add_copy(&copy(0, -1, 3, 5.0)).is_ok());
    assert!(r.add_copy(&copy(1, 1, 4, 4.0)).is_ok());
    assert!(r.add_copy(&copy(2, 5, 9, 10.0)).is_ok());
    assert!(!r.has_enough_resource(4, 9, 3.0));
    assert!(r.has_enough_resource(4, 8, 2.0));
}

#[test]
fn ordering_forbids_nesting_only() {
    let mut o = AsynchronousCopyOrdering::new();
    for (id, (start, end)) in [(3, 11), (1, 8), (5, 14), (7, 14)].into_iter().enumerate() {
        o.add_copy(&AsynchronousCopy {
            start,
            end,
            resource:   1.0,
            space:      MemorySpace::Alternate,
            id:         id as CopyId,
        });
    }
    assert!(o.violates_ordering(2, 16));
    assert!(!o.violates_ordering(5, 13));
}

#[test]
fn conflicting_required_values_abort() {
    let vals = vec![
        Value::new(0, "lhs", 96, 0, &[6]).with_requirement(Requirement::Alternate),
        Value::new(1, "rhs", 96, 1, &[7]).with_requirement(Requirement::Alternate),
    ];
    let program = Program::init(Schedule::straight_line(8), vals, &[]).unwrap();
    let oracle = TableOracle::uniform(8, 1.0, 64.0);
    match altmem(&program, &oracle, &options(128, 8)) {
        Err(MsaError::Unsatisfiable { value, name, size, .. }) => {
            assert_eq!(size, 96);
            assert_eq!(name, program.value(value).name);
        },
        other   => panic!("Expected an unsatisfiable value, got {other:?}"),
    }
}

#[test]
fn far_apart_uses_never_exceed_two_copies() {
    // Room for exactly two copies of `v`. The walls keep it from staying
    // put, so every far use needs its own prefetch, and `x` competes for
    // the second slot at the same moments.
    let vals = vec![
        Value::new(0, "wall_a", 64, 12, &[35]),
        Value::new(1, "wall_b", 64, 42, &[65]),
        Value::new(2, "v", 32, 0, &[10, 40, 70]),
        Value::new(3, "x", 32, 0, &[39, 71]),
    ];
    let program = Program::init(Schedule::straight_line(80), vals, &[]).unwrap();
    let oracle = TableOracle::uniform(80, 1.0, 64.0);
    let plan = altmem(&program, &oracle, &options(64, 8)).unwrap();
    assert_eq!(verify_plan(&program, &plan, 64, &[1.0; 80]), vec![]);

    let prefetches = plan.chain(2)
        .iter()
        .filter(|a| a.source() == Some(MemorySpace::Default))
        .count();
    assert!(prefetches >= 2, "{:?}", plan.chain(2));
    assert!(plan.stats.num_prefetches >= prefetches);

    let chunks = plan.alternate_chunks();
    for t in 0..80 {
        let live: Vec<&(ValueId, Interval, Chunk)> = chunks.iter()
            .filter(|(_, iv, _)| iv.contains(t))
            .collect();
        let copies_of_v = live.iter().filter(|(id, _, _)| *id == 2).count();
        assert!(copies_of_v <= 2, "{copies_of_v} copies of v at {t}");
        assert_eq!(alive_at(&plan, 2, t), copies_of_v);
        let used: ByteSteps = live.iter().map(|(_, _, c)| c.size).sum();
        assert!(used <= 64, "{used} bytes in use at {t}");
    }
}

#[test]
fn slices_stay_inside_one_loop_body() {
    let mut s = Schedule::new();
    let entry = s.add_computation("entry", ComputationKind::Entry, None);
    let cheap = s.add_computation("cheap_body", ComputationKind::WhileBody, Some(entry));
    let pricey = s.add_computation("pricey_body", ComputationKind::WhileBody, Some(entry));
    s.push_n(entry, 2);
    s.push_n(cheap, 8);
    s.push_n(pricey, 8);
    s.push_n(entry, 2);
    let vals = vec![
        Value::new(0, "wall", 128, 0, &[7]),
        Value::new(1, "w", 64, 0, &[16]),
    ];
    let program = Program::init(s, vals, &[]).unwrap();
    let mut oracle = TableOracle::uniform(20, 1.0, 64.0);
    for t in 2..10 {
        oracle.set_elapsed(t, 0.5);
    }
    for t in 10..18 {
        oracle.set_elapsed(t, 2.0);
    }
    let opts = Options {
        slicing: Some(SliceOptions { max_slices: 2, min_bytes: 16, granularity: 8 }),
        ..options(128, 12)
    };
    let plan = altmem(&program, &oracle, &opts).unwrap();

    let mut sliced = 0;
    for a in plan.chain(1) {
        if let Allocation::SlicedCopy { slices, chunk, .. } = a {
            sliced += 1;
            assert_eq!(slices.iter().map(|s| s.sub_chunk.size).sum::<ByteSteps>(), chunk.size);
            for s in slices {
                assert_eq!(program.computation_of(s.copy_start), program.computation_of(s.copy_done));
            }
        }
    }
    assert_eq!(sliced, 1);
    assert_eq!(plan.stats.num_sliced_prefetches, 1);
    assert!(plan.markers.iter().any(|m| m.kind == MarkerKind::Concat));
}

#[test]
fn zero_cost_use_still_pays_for_its_copy() {
    let vals = vec![
        Value::new(0, "wall", 64, 0, &[11]),
        Value::new(1, "collective", 48, 0, &[15]),
    ];
    let program = Program::init(Schedule::straight_line(20), vals, &[]).unwrap();
    let mut oracle = TableOracle::uniform(20, 1.0, 64.0);
    oracle.set_elapsed(15, 0.0);
    let plan = altmem(&program, &oracle, &options(64, 8)).unwrap();
    match plan.chain(1).last() {
        Some(Allocation::Copy { copy_start, copy_done, resource_cost, .. }) => {
            assert_eq!(*copy_done, 15);
            assert!(*copy_start >= 11);
            assert!(*resource_cost > 0.0);
        },
        other   => panic!("Expected a prefetch, got {other:?}"),
    }
}
