use crate::helpe::*;

/// A rule broken by a finished [Plan].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Violation {
    #[error("{used} bytes of alternate memory in use at {time}, capacity is {capacity}")]
    OverCapacity {
        time:       Time,
        used:       ByteSteps,
        capacity:   ByteSteps,
    },
    #[error("values #{first} and #{second} hold the same alternate memory at the same time")]
    ChunkOverlap {
        first:  ValueId,
        second: ValueId,
    },
    #[error("copy {inner:?} overtakes copy {outer:?} into {space:?} memory")]
    Overtaking {
        space:  MemorySpace,
        outer:  (Time, Time),
        inner:  (Time, Time),
    },
    #[error("copy #{copy} into {space:?} memory does not get enough bandwidth")]
    Bandwidth {
        space:  MemorySpace,
        copy:   CopyId,
    },
    #[error("value #{value} must stay in default memory but got a chunk")]
    RequiredDefault {
        value:  ValueId,
    },
    #[error("value #{value} has a broken allocation chain: {reason}")]
    BrokenChain {
        value:  ValueId,
        reason: String,
    },
    #[error("slices of value #{value} do not tile their chunk")]
    BadSlices {
        value:  ValueId,
    },
    #[error("colocated values of group {group} sit at different offsets")]
    Colocation {
        group:  GroupId,
    },
}

/// Checks a finished plan against every rule the pass promises to
/// keep. `resources` is the per-step copy bandwidth the plan was made
/// with. An empty result means the plan is valid.
pub fn verify_plan(
    program:    &Program,
    plan:       &Plan,
    capacity:   ByteSteps,
    resources:  &[f64],
) -> Vec<Violation> {
    let chunks = plan.alternate_chunks();
    let copies = all_copies(plan);

    let mut res = check_chains(program, plan);
    res.extend(check_capacity(program, &chunks, capacity));
    res.extend(check_overlap(program, &chunks));
    res.extend(check_colocation(program, &chunks));
    for space in [MemorySpace::Alternate, MemorySpace::Default] {
        res.extend(check_ordering(&copies, space));
        res.extend(check_bandwidth(&copies, space, resources));
    }

    res
}

/// Every asynchronous copy of the plan; slices count individually.
fn all_copies(plan: &Plan) -> Vec<AsynchronousCopy> {
    let mut res = vec![];
    for a in plan.allocations.values().flatten() {
        match a {
            Allocation::Copy { id, source, copy_start, copy_done, resource_cost, .. } => {
                res.push(AsynchronousCopy {
                    start:      *copy_start,
                    end:        *copy_done,
                    resource:   *resource_cost,
                    space:      source.other(),
                    id:         *id,
                });
            },
            Allocation::SlicedCopy { source, slices, .. }   => {
                for s in slices {
                    res.push(AsynchronousCopy {
                        start:      s.copy_start,
                        end:        s.copy_done,
                        resource:   s.resource_cost,
                        space:      source.other(),
                        id:         s.id,
                    });
                }
            },
            Allocation::Resident { .. } => {},
        }
    }

    res
}

//---START CHAIN CHECKS
fn check_chains(program: &Program, plan: &Plan) -> Vec<Violation> {
    program.values()
        .par_iter()
        .flat_map_iter(|v| {
            let chain = plan.chain(v.id);
            let mut res = vec![];
            if let Some(reason) = chain_problem(v, chain) {
                res.push(Violation::BrokenChain {
                    value: v.id,
                    reason,
                });
            }
            if v.requires_default() && chain.iter().any(|a| a.chunk().is_some()) {
                res.push(Violation::RequiredDefault { value: v.id });
            }
            if chain.iter().any(|a| !slices_tile(a)) {
                res.push(Violation::BadSlices { value: v.id });
            }
            res
        })
        .collect()
}

fn chain_problem(v: &Value, chain: &[Allocation]) -> Option<String> {
    let live = v.live_range();
    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        return Some(String::from("empty chain"));
    };
    if first.is_copy() {
        return Some(String::from("starts with a copy"));
    }
    if first.interval().start != live.start || last.interval().end != live.end {
        return Some(format!("does not cover {live}"));
    }

    let mut seen_default = false;
    for (idx, a) in chain.iter().enumerate() {
        let iv = a.interval();
        if iv.is_empty() {
            return Some(format!("empty epoch {iv}"));
        }
        match (a.space(), a.chunk()) {
            (MemorySpace::Alternate, None)      => { return Some(format!("no chunk over {iv}")); },
            (MemorySpace::Default, Some(_))     => { return Some(format!("chunk in default memory over {iv}")); },
            _   => {},
        }
        if a.uses().iter().any(|u| !iv.contains(u.time)) {
            return Some(format!("use outside of {iv}"));
        }
        if let Some(prev) = idx.checked_sub(1).map(|p| &chain[p]) {
            if prev.interval().end != iv.start {
                return Some(format!("gap or overlap at {}", iv.start));
            }
            match a.source() {
                Some(src) if src != prev.space()    => {
                    return Some(format!("copy out of the wrong space at {}", iv.start));
                },
                None if a.space() != prev.space()   => {
                    // Leaving alternate memory for free requires a
                    // copy to be already waiting in default memory.
                    if a.space() == MemorySpace::Alternate || !seen_default {
                        return Some(format!("space changes without a copy at {}", iv.start));
                    }
                },
                _   => {},
            }
        }
        if let Some(problem) = copy_problem(v, a) {
            return Some(problem);
        }
        seen_default |= a.space() == MemorySpace::Default;
    }

    let mut served: Vec<Use> = chain.iter()
        .flat_map(|a| a.uses().iter().copied())
        .collect();
    served.sort_unstable();
    let expected: Vec<Use> = v.uses.iter().copied().sorted_unstable().collect();
    if served != expected {
        return Some(String::from("uses are lost or duplicated"));
    }

    None
}

/// Copies start after the definition and land before anybody needs
/// the destination.
fn copy_problem(v: &Value, a: &Allocation) -> Option<String> {
    let iv = a.interval();
    let needed_by = a.uses()
        .first()
        .map_or(iv.end, |u| u.time);
    let windows: Vec<(Time, Time)> = match a {
        Allocation::Copy { copy_start, copy_done, .. }  => vec![(*copy_start, *copy_done)],
        Allocation::SlicedCopy { slices, .. }           => {
            if slices.is_empty() {
                return Some(format!("sliced copy without slices over {iv}"));
            }
            slices.iter()
                .map(|s| (s.copy_start, s.copy_done))
                .collect()
        },
        Allocation::Resident { .. }                     => vec![],
    };

    windows.into_iter()
        .find(|(s, d)| s >= d || *s < v.definition || *d > needed_by)
        .map(|(s, d)| format!("copy ({s}, {d}) does not fit epoch {iv}"))
}

/// Sub-chunks sorted by offset must be laid back to back and cover
/// the whole chunk.
fn slices_tile(a: &Allocation) -> bool {
    let Allocation::SlicedCopy { slices, chunk, .. } = a else {
        return true;
    };
    let mut next = chunk.offset;
    for c in slices.iter().map(|s| s.sub_chunk).sorted_unstable() {
        if c.offset != next {
            return false;
        }
        next = c.next_avail_offset();
    }

    next == chunk.next_avail_offset()
}
//---END CHAIN CHECKS

//---START SPACE CHECKS
fn check_capacity(
    program:    &Program,
    chunks:     &[(ValueId, Interval, Chunk)],
    capacity:   ByteSteps,
) -> Vec<Violation> {
    let mut res: Vec<Violation> = chunks.iter()
        .filter(|(_, _, c)| c.next_avail_offset() > capacity)
        .map(|(_, iv, c)| Violation::OverCapacity {
            time:   iv.start,
            used:   c.next_avail_offset(),
            capacity,
        })
        .collect();
    // Colocated values overlapping in time share their bytes.
    let per_step: Vec<Violation> = (0..program.end_time())
        .into_par_iter()
        .filter_map(|t| {
            let used: ByteSteps = chunks.iter()
                .filter(|(_, iv, _)| iv.contains(t))
                .map(|(v, _, c)| (program.value(*v).group, *c))
                .unique()
                .map(|(_, c)| c.size)
                .sum();
            (used > capacity).then_some(Violation::OverCapacity {
                time: t,
                used,
                capacity,
            })
        })
        .collect();
    res.extend(per_step);

    res
}

fn check_overlap(program: &Program, chunks: &[(ValueId, Interval, Chunk)]) -> Vec<Violation> {
    (0..chunks.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            let (a, ia, ca) = chunks[i];
            let group = program.value(a).group;
            chunks[i + 1..]
                .iter()
                .filter(move |(b, ib, cb)| {
                    program.value(*b).group != group && ia.overlaps_with(ib) && ca.overlaps_with(cb)
                })
                .map(move |(b, _, _)| Violation::ChunkOverlap {
                    first:  a,
                    second: *b,
                })
        })
        .collect()
}

fn check_colocation(program: &Program, chunks: &[(ValueId, Interval, Chunk)]) -> Vec<Violation> {
    let mut offsets: BTreeMap<GroupId, BTreeSet<ByteSteps>> = BTreeMap::new();
    for (v, _, c) in chunks {
        let group = program.value(*v).group;
        if program.groups()[&group].len() > 1 {
            offsets.entry(group)
                .or_default()
                .insert(c.offset);
        }
    }

    offsets.into_iter()
        .filter(|(_, o)| o.len() > 1)
        .map(|(group, _)| Violation::Colocation { group })
        .collect()
}
//---END SPACE CHECKS

//---START COPY CHECKS
fn check_ordering(copies: &[AsynchronousCopy], space: MemorySpace) -> Vec<Violation> {
    let into: Vec<&AsynchronousCopy> = copies.iter()
        .filter(|c| c.space == space)
        .collect();
    into.iter()
        .flat_map(|outer| {
            into.iter()
                .filter(move |inner| outer.start < inner.start && outer.end > inner.end)
                .map(move |inner| Violation::Overtaking {
                    space,
                    outer:  (outer.start, outer.end),
                    inner:  (inner.start, inner.end),
                })
        })
        .collect()
}

fn check_bandwidth(copies: &[AsynchronousCopy], space: MemorySpace, resources: &[f64]) -> Vec<Violation> {
    let mut timeline = AsynchronousCopyResource::new(resources.to_vec());
    copies.iter()
        .filter(|c| c.space == space)
        .sorted_by_key(|c| (c.start, c.end, c.id))
        .filter_map(|c| {
            timeline.add_copy(c)
                .err()
                .map(|e| Violation::Bandwidth {
                    space,
                    copy:   e.id,
                })
        })
        .collect()
}

/// Most copies into `space` in flight at any single step.
fn max_outstanding(copies: &[AsynchronousCopy], space: MemorySpace) -> usize {
    let mut events: Vec<(Time, i64)> = vec![];
    for c in copies.iter().filter(|c| c.space == space && c.end > c.start + 1) {
        events.push((c.start + 1, 1));
        events.push((c.end, -1));
    }
    events.sort_unstable();

    let (mut running, mut max) = (0_i64, 0_i64);
    for (_, delta) in events {
        running += delta;
        max = max.max(running);
    }

    max as usize
}
//---END COPY CHECKS

/// Counts what the plan ended up doing. Repack counters are left for
/// the caller to fill in.
pub fn collect_stats(plan: &Plan) -> AllocationStats {
    let mut res = AllocationStats::default();
    for chain in plan.allocations.values() {
        if chain.iter().all(|a| a.chunk().is_none()) {
            res.num_default_only += 1;
        }
        if let [Allocation::Resident { space: MemorySpace::Alternate, .. }] = chain.as_slice() {
            res.num_pinned += 1;
        }
        for a in chain {
            match a {
                Allocation::Copy { source: MemorySpace::Default, .. }   => { res.num_prefetches += 1; },
                Allocation::Copy { source: MemorySpace::Alternate, .. } => { res.num_evictions += 1; },
                Allocation::SlicedCopy { .. }   => {
                    res.num_prefetches += 1;
                    res.num_sliced_prefetches += 1;
                },
                Allocation::Resident { .. }     => {},
            }
        }
    }
    let copies = all_copies(plan);
    res.max_outstanding_prefetches = max_outstanding(&copies, MemorySpace::Alternate);
    res.max_outstanding_evictions = max_outstanding(&copies, MemorySpace::Default);

    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        let vals = vec![
            Value::new(0, "a", 32, 0, &[4]),
            Value::new(1, "b", 32, 1, &[6]),
        ];
        Program::init(Schedule::straight_line(8), vals, &[]).unwrap()
    }

    fn resident(space: MemorySpace, start: Time, end: Time, chunk: Option<Chunk>, uses: &[Time]) -> Allocation {
        Allocation::Resident {
            space,
            interval:   Interval::new(start, end),
            chunk,
            uses:       uses.iter().map(|&time| Use { time, operand: 0 }).collect(),
        }
    }

    fn prefetch(id: CopyId, start: Time, done: Time, end: Time, chunk: Chunk, uses: &[Time]) -> Allocation {
        Allocation::Copy {
            id,
            source:         MemorySpace::Default,
            interval:       Interval::new(start + 1, end),
            copy_start:     start,
            copy_done:      done,
            resource_cost:  1.0,
            chunk:          Some(chunk),
            uses:           uses.iter().map(|&time| Use { time, operand: 0 }).collect(),
        }
    }

    #[test]
    fn valid_plan_passes() {
        let p = program();
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![resident(MemorySpace::Alternate, 0, 5, Some(Chunk::new(0, 32)), &[4])]);
        plan.allocations.insert(1, vec![
            resident(MemorySpace::Default, 1, 3, None, &[]),
            prefetch(0, 2, 6, 7, Chunk::new(32, 32), &[6]),
        ]);
        assert_eq!(verify_plan(&p, &plan, 64, &[1.0; 8]), vec![]);
        let stats = collect_stats(&plan);
        assert_eq!(stats.num_pinned, 1);
        assert_eq!(stats.num_prefetches, 1);
        assert_eq!(stats.max_outstanding_prefetches, 1);
        assert_eq!(stats.max_outstanding_evictions, 0);
    }

    #[test]
    fn overlap_and_capacity_are_caught() {
        let p = program();
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![resident(MemorySpace::Alternate, 0, 5, Some(Chunk::new(0, 32)), &[4])]);
        plan.allocations.insert(1, vec![resident(MemorySpace::Alternate, 1, 7, Some(Chunk::new(16, 32)), &[6])]);
        let v = verify_plan(&p, &plan, 40, &[1.0; 8]);
        assert!(v.contains(&Violation::ChunkOverlap { first: 0, second: 1 }));
        assert!(v.iter().any(|x| matches!(x, Violation::OverCapacity { time: 1, used: 64, .. })));
    }

    #[test]
    fn gaps_in_chains_are_caught() {
        let p = program();
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![resident(MemorySpace::Default, 0, 5, None, &[4])]);
        plan.allocations.insert(1, vec![
            resident(MemorySpace::Default, 1, 2, None, &[]),
            prefetch(0, 2, 6, 7, Chunk::new(0, 32), &[6]),
        ]);
        let v = verify_plan(&p, &plan, 64, &[1.0; 8]);
        assert!(matches!(v.as_slice(), [Violation::BrokenChain { value: 1, .. }]), "{v:?}");
    }

    #[test]
    fn overtaking_and_bandwidth_are_caught() {
        let vals = vec![
            Value::new(0, "a", 8, 0, &[7]),
            Value::new(1, "b", 8, 0, &[6]),
        ];
        let p = Program::init(Schedule::straight_line(8), vals, &[]).unwrap();
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![
            resident(MemorySpace::Default, 0, 2, None, &[]),
            prefetch(0, 1, 7, 8, Chunk::new(0, 8), &[7]),
        ]);
        plan.allocations.insert(1, vec![
            resident(MemorySpace::Default, 0, 3, None, &[]),
            prefetch(1, 2, 6, 7, Chunk::new(8, 8), &[6]),
        ]);
        let v = verify_plan(&p, &plan, 64, &[0.25; 8]);
        assert!(v.contains(&Violation::Overtaking {
            space:  MemorySpace::Alternate,
            outer:  (1, 7),
            inner:  (2, 6),
        }));
        // The outer copy queues first and eats every step the inner one could use.
        assert!(v.contains(&Violation::Bandwidth { space: MemorySpace::Alternate, copy: 1 }));
    }

    #[test]
    fn required_default_and_slices() {
        let vals = vec![
            Value::new(0, "p", 16, 0, &[5])
                .with_requirement(Requirement::Default(DefaultReason::Parameter)),
        ];
        let p = Program::init(Schedule::straight_line(8), vals, &[]).unwrap();
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![
            resident(MemorySpace::Default, 0, 2, None, &[]),
            Allocation::SlicedCopy {
                source:     MemorySpace::Default,
                interval:   Interval::new(2, 6),
                slices:     vec![
                    SliceDetail { id: 0, copy_start: 1, copy_done: 5, resource_cost: 0.5, sub_chunk: Chunk::new(0, 8) },
                    SliceDetail { id: 1, copy_start: 3, copy_done: 5, resource_cost: 0.5, sub_chunk: Chunk::new(12, 4) },
                ],
                chunk:      Chunk::new(0, 16),
                uses:       vec![Use { time: 5, operand: 0 }],
            },
        ]);
        let v = verify_plan(&p, &plan, 64, &[1.0; 8]);
        assert!(v.contains(&Violation::RequiredDefault { value: 0 }));
        assert!(v.contains(&Violation::BadSlices { value: 0 }));
    }

    #[test]
    fn outstanding_counts_are_per_direction() {
        let mut plan = Plan::default();
        plan.allocations.insert(0, vec![
            resident(MemorySpace::Alternate, 0, 3, Some(Chunk::new(0, 8)), &[]),
            Allocation::Copy {
                id: 0, source: MemorySpace::Alternate, interval: Interval::new(3, 10),
                copy_start: 0, copy_done: 3, resource_cost: 1.0, chunk: None, uses: vec![],
            },
        ]);
        plan.allocations.insert(1, vec![
            resident(MemorySpace::Default, 0, 2, None, &[]),
            prefetch(1, 1, 6, 7, Chunk::new(8, 8), &[6]),
        ]);
        plan.allocations.insert(2, vec![
            resident(MemorySpace::Default, 0, 3, None, &[]),
            prefetch(2, 2, 7, 8, Chunk::new(16, 8), &[7]),
        ]);
        let stats = collect_stats(&plan);
        assert_eq!(stats.max_outstanding_prefetches, 2);
        assert_eq!(stats.max_outstanding_evictions, 1);
        assert_eq!(stats.num_evictions, 1);
    }
}
