use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::helpe::*;

/// The repacking view of one alternate memory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBlock {
    pub id:                 usize,
    pub interval:           Interval,
    pub size:               ByteSteps,
    pub offset:             ByteSteps,
    /// Blocks sharing a group must end up at one offset.
    pub colocation_group:   Option<GroupId>,
}

impl AllocationBlock {
    #[inline(always)]
    pub fn chunk(&self) -> Chunk {
        Chunk::new(self.offset, self.size)
    }
}

/// Re-offsets alternate memory reservations after the fact. Intervals
/// and sizes are fixed; only offsets may change.
pub trait Repacker {
    /// Returns `Ok(true)` if offsets were changed. On `Ok(false)` or
    /// an error, `blocks` must be left as they were.
    fn repack(&mut self, blocks: &mut [AllocationBlock]) -> Result<bool, RepackError>;
}

/// Blocks that must move together.
#[derive(Debug, Clone)]
struct Unit {
    members:    Vec<usize>,
    size:       ByteSteps,
    lifetime:   Time,
}

/// Re-places every block from scratch with first-fit. The first try
/// sorts by size, then lifetime; every extra life shuffles the order
/// with a seeded generator and the lowest makespan wins.
#[derive(Debug, Clone)]
pub struct BestFitRepacker {
    capacity:   ByteSteps,
    alignment:  ByteSteps,
    lives:      u32,
    rng:        StdRng,
}

impl BestFitRepacker {
    pub fn new(capacity: ByteSteps, alignment: ByteSteps, lives: u32, seed: u64) -> Self {
        Self {
            capacity,
            alignment:  alignment.max(1),
            lives:      lives.max(1),
            rng:        StdRng::seed_from_u64(seed),
        }
    }

    fn units(blocks: &[AllocationBlock]) -> Result<Vec<Unit>, RepackError> {
        let mut grouped: IndexMap<(bool, usize), Vec<usize>> = IndexMap::new();
        for (idx, b) in blocks.iter().enumerate() {
            let key = match b.colocation_group {
                Some(g) => (true, g as usize),
                None    => (false, idx),
            };
            grouped.entry(key)
                .or_default()
                .push(idx);
        }

        grouped.into_iter()
            .map(|((_, key), members)| {
                let size = blocks[members[0]].size;
                if members.iter().any(|m| blocks[*m].size != size) {
                    return Err(RepackError::BadGroup { group: key as GroupId });
                }
                let lifetime = members.iter()
                    .map(|m| blocks[*m].interval)
                    .reduce(|a, b| a.hull(&b))
                    .map(|iv| iv.len())
                    .unwrap_or(0);
                Ok(Unit {
                    members,
                    size,
                    lifetime,
                })
            })
            .collect()
    }

    /// Places units in the given order. Returns per-block offsets and
    /// the resulting makespan.
    fn do_first_fit(&self, blocks: &[AllocationBlock], units: &[&Unit]) -> (Vec<ByteSteps>, ByteSteps) {
        let mut offsets = vec![0; blocks.len()];
        let mut squeezed: Vec<(Interval, Chunk)> = vec![];
        let mut max_address = 0;
        for unit in units {
            let min_gap_size = unit.size;
            let mut offset_runner = 0;
            let mut best_offset: Option<ByteSteps> = None;
            // Traverse already-squeezed blocks that overlap with any
            // member of the unit in ascending offset.
            let mut live = squeezed.iter()
                .filter(|(iv, _)| {
                    unit.members
                        .iter()
                        .any(|m| blocks[*m].interval.overlaps_with(iv))
                })
                .map(|(_, c)| *c)
                .sorted_unstable()
                .peekable();
            while let Some(next) = live.peek() {
                if next.offset > offset_runner {
                    let test_off = align_up(offset_runner, self.alignment);
                    if next.offset > test_off && next.offset - test_off >= min_gap_size {
                        best_offset = Some(test_off);
                        break;
                    }
                    offset_runner = test_off.max(next.next_avail_offset());
                } else {
                    offset_runner = offset_runner.max(next.next_avail_offset());
                }
                live.next();
            }
            let offset = best_offset.unwrap_or(align_up(offset_runner, self.alignment));
            for m in &unit.members {
                offsets[*m] = offset;
                squeezed.push((blocks[*m].interval, Chunk::new(offset, unit.size)));
            }
            max_address = max_address.max(offset + unit.size);
        }

        (offsets, max_address)
    }
}

impl Repacker for BestFitRepacker {
    fn repack(&mut self, blocks: &mut [AllocationBlock]) -> Result<bool, RepackError> {
        let units = Self::units(blocks)?;
        let mut ordered: Vec<&Unit> = units.iter()
            .sorted_by(|a, b| {
                b.size
                    .cmp(&a.size)
                    .then(b.lifetime.cmp(&a.lifetime))
                    .then(a.members[0].cmp(&b.members[0]))
            })
            .collect();

        let (mut best, mut best_makespan) = self.do_first_fit(blocks, &ordered);
        for _ in 1..self.lives {
            ordered.shuffle(&mut self.rng);
            let (offsets, makespan) = self.do_first_fit(blocks, &ordered);
            if makespan < best_makespan {
                best = offsets;
                best_makespan = makespan;
            }
        }

        if best_makespan > self.capacity {
            return Err(RepackError::OutOfCapacity {
                makespan: best_makespan,
                capacity: self.capacity,
            });
        }
        if blocks.iter().zip(best.iter()).all(|(b, o)| b.offset == *o) {
            return Ok(false);
        }
        for (b, o) in blocks.iter_mut().zip(best) {
            b.offset = o;
        }

        Ok(true)
    }
}
