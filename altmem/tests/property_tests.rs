// Property-based tests for the allocation pass.
//
// Generated programs are small straight-line schedules with a handful
// of values; copies and blocks are generated directly for the
// lower-level models.

use altmem::*;
use altmem::algo::{altmem, slicing::{EvenSliceProposer, SliceOptions, SliceProposer}, Options, PickerConfig};
use altmem::repack::{AllocationBlock, BestFitRepacker, Repacker};
use proptest::prelude::*;

const LEN: usize = 40;
const CAPACITY: ByteSteps = 128;

// ── Generators ──────────────────────────────────────────────────────────────

/// `(definition, size, use offsets)` per value.
fn arb_values() -> impl Strategy<Value = Vec<(Time, ByteSteps, Vec<Time>)>> {
    prop::collection::vec(
        (
            0..(LEN as Time - 10),
            prop::sample::select(vec![8, 16, 32, 48, 64]),
            prop::collection::vec(1..10_i64, 1..4),
        ),
        1..8,
    )
}

fn build(raw: &[(Time, ByteSteps, Vec<Time>)]) -> Program {
    let vals = raw.iter()
        .enumerate()
        .map(|(id, (def, size, gaps))| {
            let mut t = *def;
            let uses: Vec<Time> = gaps.iter()
                .map(|g| {
                    t = (t + g).min(LEN as Time - 1);
                    t
                })
                .collect();
            Value::new(id as ValueId, &format!("v{id}"), *size, *def, &uses)
        })
        .collect();
    Program::init(Schedule::straight_line(LEN), vals, &[]).unwrap()
}

fn options(by_count: bool, sliced: bool) -> Options {
    Options {
        picker:     if by_count {
            PickerConfig::InstructionCount { min_overlap: 2, max_overlap: 10 }
        } else {
            PickerConfig::default()
        },
        slicing:    sliced.then_some(SliceOptions { max_slices: 2, min_bytes: 16, granularity: 8 }),
        verify:     false,
        ..Options::with_capacity(CAPACITY)
    }
}

fn arb_copies() -> impl Strategy<Value = Vec<(Time, Time, f64)>> {
    prop::collection::vec(
        (-1..20_i64, 2..8_i64, 0.1..3.0_f64).prop_map(|(s, len, amount)| (s, s + len, amount)),
        1..10,
    )
}

fn copy(id: usize, (start, end, resource): (Time, Time, f64)) -> AsynchronousCopy {
    AsynchronousCopy {
        start,
        end,
        resource,
        space:  MemorySpace::Alternate,
        id:     id as CopyId,
    }
}

// ── Whole-pass invariants ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn plans_respect_every_rule(raw in arb_values(), by_count in any::<bool>(), sliced in any::<bool>()) {
        let program = build(&raw);
        let oracle = TableOracle::uniform(LEN, 1.0, 32.0);
        let plan = altmem(&program, &oracle, &options(by_count, sliced));
        prop_assert!(plan.is_ok(), "{:?}", plan);
        let plan = plan.unwrap();

        let violations = verify_plan(&program, &plan, CAPACITY, &[1.0; LEN]);
        prop_assert!(violations.is_empty(), "{:?}", violations);
        for v in program.values() {
            let chain = plan.chain(v.id);
            prop_assert_eq!(chain.first().map(|a| a.interval().start), Some(v.definition));
            prop_assert_eq!(chain.last().map(|a| a.interval().end), Some(v.live_range().end));
        }
    }

    #[test]
    fn identical_inputs_give_identical_plans(raw in arb_values(), by_count in any::<bool>()) {
        let oracle = TableOracle::uniform(LEN, 1.0, 32.0);
        let (a, b) = (build(&raw), build(&raw));
        let first = altmem(&a, &oracle, &options(by_count, true));
        let second = altmem(&b, &oracle, &options(by_count, true));
        prop_assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }

    #[test]
    fn required_default_values_get_no_chunk(raw in arb_values(), pick in any::<prop::sample::Index>()) {
        let base = build(&raw);
        let chosen = pick.index(base.values().len()) as ValueId;
        let vals: Vec<Value> = base.values()
            .iter()
            .cloned()
            .map(|v| if v.id == chosen {
                v.with_requirement(Requirement::Default(DefaultReason::Parameter))
            } else { v })
            .collect();
        let program = Program::init(Schedule::straight_line(LEN), vals, &[]).unwrap();
        let oracle = TableOracle::uniform(LEN, 1.0, 32.0);
        let plan = altmem(&program, &oracle, &options(true, false)).unwrap();
        prop_assert!(plan.chain(chosen).iter().all(|a| a.chunk().is_none()));
    }
}

// ── Resource and ordering models ────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn remove_undoes_add(copies in arb_copies(), extra in (-1..20_i64, 2..8_i64, 0.1..3.0_f64)) {
        let mut r = AsynchronousCopyResource::new(vec![2.0; 30]);
        for (id, c) in copies.iter().enumerate() {
            let _ = r.add_copy(&copy(id, *c));
        }
        let before = r.clone();
        let c = copy(copies.len(), (extra.0, extra.0 + extra.1, extra.2));
        if r.add_copy(&c).is_ok() {
            prop_assert!(r.remove_copy(&c));
        }
        prop_assert_eq!(r, before);
    }

    #[test]
    fn resource_never_goes_negative(copies in arb_copies()) {
        let mut r = AsynchronousCopyResource::new(vec![1.5; 30]);
        for (id, c) in copies.iter().enumerate() {
            let fits = r.has_enough_resource(c.0, c.1, c.2);
            prop_assert_eq!(fits, r.add_copy(&copy(id, *c)).is_ok());
            for left in r.remaining_resources() {
                prop_assert!(left >= -1e-9);
            }
        }
    }

    #[test]
    fn admitted_copies_never_overtake(copies in arb_copies()) {
        let mut o = AsynchronousCopyOrdering::new();
        let mut admitted = vec![];
        for (id, c) in copies.iter().enumerate() {
            if !o.violates_ordering(c.0, c.1) {
                o.add_copy(&copy(id, *c));
                admitted.push(*c);
            }
        }
        for a in &admitted {
            for b in &admitted {
                prop_assert!(!(a.0 < b.0 && a.1 > b.1), "{:?} overtakes {:?}", b, a);
            }
        }
    }
}

// ── Slicing and repacking ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn slices_rebuild_the_chunk(size in 16..4096_usize, k in 2..6_usize, offset in 0..1024_usize) {
        let opts = SliceOptions { max_slices: k, min_bytes: 16, granularity: 8 };
        if let Ok(proposals) = EvenSliceProposer.propose_slices(size, &opts) {
            prop_assert_eq!(proposals.iter().map(|p| p.byte_size).sum::<ByteSteps>(), size);
            let mut next = offset;
            for p in &proposals {
                let sub = Chunk::new(next, p.byte_size);
                next = sub.next_avail_offset();
            }
            prop_assert_eq!(next, Chunk::new(offset, size).next_avail_offset());
        }
    }

    #[test]
    fn repack_keeps_groups_together(
        raw in prop::collection::vec((0..30_i64, 1..10_i64, prop::sample::select(vec![8_usize, 16, 32]), 0..4_u32), 1..12),
        seed in any::<u64>(),
    ) {
        // Members of a group share their size; intervals may overlap.
        let mut blocks: Vec<AllocationBlock> = raw.iter()
            .enumerate()
            .map(|(id, (start, len, size, group))| AllocationBlock {
                id,
                interval:           Interval::new(*start, start + len),
                size:               if *group > 0 { 8 * *group as ByteSteps } else { *size },
                offset:             1024,
                colocation_group:   (*group > 0).then_some(*group),
            })
            .collect();
        let mut r = BestFitRepacker::new(4096, 8, 3, seed);
        let changed = r.repack(&mut blocks);
        prop_assert_eq!(changed, Ok(true));
        for a in &blocks {
            prop_assert_eq!(a.offset % 8, 0);
            for b in &blocks {
                if a.colocation_group.is_some() && a.colocation_group == b.colocation_group {
                    prop_assert_eq!(a.offset, b.offset);
                } else if a.id != b.id && a.interval.overlaps_with(&b.interval) {
                    prop_assert!(!a.chunk().overlaps_with(&b.chunk()));
                }
            }
        }
    }
}
