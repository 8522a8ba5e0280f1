pub mod comparator;
pub mod picker;
pub mod slicing;

use self::{
    comparator::{BaseOrder, BufferIntervalComparator, PriorityOverride},
    picker::{CostBasedPicker, InstructionCountPicker, PrefetchIntervalPicker},
    slicing::{plan_slices, EvenSliceProposer, SliceOptions, SlicePlan, SliceProposer},
};
use crate::{
    helpe::*,
    analyze::{collect_stats, verify_plan},
    repack::{AllocationBlock, BestFitRepacker, Repacker},
};

/// Which prefetch window search to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PickerConfig {
    /// Windows overlap between `min_overlap` (exclusive) and
    /// `max_overlap` instructions.
    InstructionCount {
        min_overlap:    Time,
        max_overlap:    Time,
    },
    /// Windows overlap between `min_ratio` and `max_ratio` times the
    /// copy's own duration, `preferred_ratio` being the sweet spot.
    CostBased {
        min_ratio:          f64,
        preferred_ratio:    f64,
        max_ratio:          f64,
    },
}

impl Default for PickerConfig {
    fn default() -> Self {
        PickerConfig::CostBased {
            min_ratio:          1.0,
            preferred_ratio:    1.5,
            max_ratio:          10.0,
        }
    }
}

/// Every knob of the pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Size of the alternate memory, in bytes.
    pub capacity:                   ByteSteps,
    pub alignment:                  ByteSteps,
    pub picker:                     PickerConfig,
    pub base_order:                 BaseOrder,
    pub overrides:                  Vec<PriorityOverride>,
    /// `None` disables sliced prefetching.
    pub slicing:                    Option<SliceOptions>,
    pub enable_eviction:            bool,
    pub max_prefetches_per_value:   Option<usize>,
    /// Bound on repack rounds. Zero disables repacking.
    pub max_repacks:                u32,
    pub repack_seed:                u64,
    pub repack_lives:               u32,
    /// Check the finished plan before handing it out.
    pub verify:                     bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity:                   0,
            alignment:                  1,
            picker:                     PickerConfig::default(),
            base_order:                 BaseOrder::default(),
            overrides:                  vec![],
            slicing:                    None,
            enable_eviction:            true,
            max_prefetches_per_value:   None,
            max_repacks:                1,
            repack_seed:                0,
            repack_lives:               1,
            verify:                     cfg!(debug_assertions),
        }
    }
}

impl Options {
    pub fn with_capacity(capacity: ByteSteps) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

/// Decides where every value of `program` lives, using the stock
/// slice proposer and repacker.
///
/// Returns the allocation plan, or the single diagnostic naming a
/// placement constraint that cannot be met.
pub fn altmem(
    program:    &Program,
    oracle:     &dyn CostOracle,
    options:    &Options,
) -> Result<Plan, MsaError> {
    let mut repacker = BestFitRepacker::new(
        options.capacity,
        options.alignment,
        options.repack_lives,
        options.repack_seed,
    );

    allocate(program, oracle, options, &EvenSliceProposer, &mut repacker)
}

/// Same as [altmem], with caller-provided collaborators.
///
/// Groups are visited in comparator order. Each one is pinned to
/// alternate memory if possible; otherwise a lone value is kept alive
/// in alternate memory for a prefix of its uses and evicted, or left in
/// default memory and prefetched ahead of its uses; the rest stays in
/// default memory. Repack rounds follow, after each of which the groups
/// that got nothing are given another chance.
pub fn allocate(
    program:    &Program,
    oracle:     &dyn CostOracle,
    options:    &Options,
    proposer:   &dyn SliceProposer,
    repacker:   &mut dyn Repacker,
) -> Result<Plan, MsaError> {
    // Measure total allocation time.
    let total_start = Instant::now();

    let cost = CostAnalysis::new(oracle, program);
    let picker: Box<dyn PrefetchIntervalPicker + '_> = match options.picker {
        PickerConfig::InstructionCount { min_overlap, max_overlap }  => {
            Box::new(InstructionCountPicker::new(min_overlap, max_overlap))
        },
        PickerConfig::CostBased { min_ratio, preferred_ratio, max_ratio }   => {
            Box::new(CostBasedPicker::new(&cost, options.capacity, min_ratio, preferred_ratio, max_ratio))
        },
    };
    let order = BufferIntervalComparator::new(&cost, options.base_order, &options.overrides)
        .sort(program.buffer_intervals());

    let mut allocator = Allocator::new(program, &cost, options, proposer, picker);
    for bi in &order {
        allocator.place(bi)?;
    }
    allocator.repack_rounds(repacker)?;
    let plan = allocator.finish();

    if options.verify {
        let violations = verify_plan(program, &plan, options.capacity, &cost.initial_resources());
        for v in &violations {
            warn!("{v}");
        }
        if let Some(first) = violations.first() {
            return Err(MsaError::InvalidPlan {
                violations: violations.len(),
                first:      first.to_string(),
            });
        }
    }

    let s = &plan.stats;
    info!(
        "{} values placed in {} μs: {} pinned, {} prefetches ({} sliced), {} evictions, {} in default memory only",
        program.values().len(),
        total_start.elapsed().as_micros(),
        s.num_pinned,
        s.num_prefetches,
        s.num_sliced_prefetches,
        s.num_evictions,
        s.num_default_only,
    );

    Ok(plan)
}

/// The copy that empties alternate memory, waiting to become the
/// next default memory epoch.
#[derive(Debug, Clone, Copy)]
struct Eviction {
    id:         CopyId,
    copy_start: Time,
    copy_done:  Time,
    amount:     f64,
}

/// A prefetch that was found to fit, not yet reserved.
#[derive(Debug, Clone)]
enum Prefetch {
    Whole {
        start:  Time,
        done:   Time,
        amount: f64,
        chunk:  Chunk,
    },
    Sliced {
        plan:   SlicePlan,
        chunk:  Chunk,
    },
}

impl Prefetch {
    /// When the destination chunk gets occupied, minus one.
    #[inline(always)]
    fn copy_start(&self) -> Time {
        match self {
            Prefetch::Whole { start, .. }   => *start,
            Prefetch::Sliced { plan, .. }   => plan.starts[0],
        }
    }

    #[inline(always)]
    fn chunk(&self) -> Chunk {
        match self {
            Prefetch::Whole { chunk, .. }
            | Prefetch::Sliced { chunk, .. }    => *chunk,
        }
    }
}

/// One value's chain under construction, plus the chunk records
/// backing its alternate epochs.
#[derive(Debug, Default)]
struct Draft {
    chain:  Vec<Allocation>,
    chunks: Vec<(ChunkId, usize)>,
}

impl Draft {
    fn push(&mut self, a: Allocation) {
        self.chain.push(a);
    }

    fn push_backed(&mut self, a: Allocation, chunk: ChunkId) {
        self.chunks.push((chunk, self.chain.len()));
        self.chain.push(a);
    }
}

#[inline(always)]
fn uses_within(uses: &[Use], interval: Interval) -> Vec<Use> {
    uses.iter()
        .filter(|u| interval.contains(u.time))
        .copied()
        .collect()
}

struct Allocator<'a> {
    program:            &'a Program,
    cost:               &'a CostAnalysis<'a>,
    options:            &'a Options,
    proposer:           &'a dyn SliceProposer,
    picker:             Box<dyn PrefetchIntervalPicker + 'a>,
    ledger:             Ledger,
    chains:             IndexMap<ValueId, Vec<Allocation>>,
    /// Committed chunk -> the epochs it backs.
    owners:             BTreeMap<ChunkId, Vec<(ValueId, usize)>>,
    /// Groups left without alternate memory that could use some,
    /// in processing order.
    rejected:           Vec<GroupId>,
    num_repacks:        usize,
    num_repack_retries: usize,
}

impl<'a> Allocator<'a> {
    fn new(
        program:    &'a Program,
        cost:       &'a CostAnalysis<'a>,
        options:    &'a Options,
        proposer:   &'a dyn SliceProposer,
        picker:     Box<dyn PrefetchIntervalPicker + 'a>,
    ) -> Self {
        Self {
            program,
            cost,
            options,
            proposer,
            picker,
            ledger:             Ledger::new(options.capacity, options.alignment, cost.initial_resources()),
            chains:             IndexMap::new(),
            owners:             BTreeMap::new(),
            rejected:           vec![],
            num_repacks:        0,
            num_repack_retries: 0,
        }
    }

    fn place(&mut self, bi: &BufferInterval) -> Result<(), MsaError> {
        if let Requirement::Default(reason) = bi.requirement {
            debug!("Group {} stays in default memory ({:?})", bi.group, reason);
            self.commit_default(bi);
            return Ok(());
        }
        if self.try_pin(bi) {
            debug!("Group {} pinned over {}", bi.group, bi.span);
            return Ok(());
        }
        if bi.requirement == Requirement::Alternate {
            let v = self.program.value(bi.leader());
            let reason = if bi.size > self.options.capacity {
                format!("{} bytes exceed the alternate memory capacity of {}", bi.size, self.options.capacity)
            } else {
                format!("no {}-byte chunk of alternate memory is free over {}", bi.size, bi.span)
            };
            return Err(MsaError::Unsatisfiable {
                value:  v.id,
                name:   v.name.clone(),
                size:   bi.size,
                reason,
            });
        }
        // A loop-carried chain that cannot stay put would be evicted
        // and refilled on every iteration.
        if !bi.is_colocated() && self.try_split(bi.leader()) {
            return Ok(());
        }

        debug!("Group {} falls back to default memory", bi.group);
        self.commit_default(bi);
        self.rejected.push(bi.group);

        Ok(())
    }

    //---START COMMIT HELPERS
    fn commit_default(&mut self, bi: &BufferInterval) {
        for id in &bi.members {
            let v = self.program.value(*id);
            self.chains.insert(*id, vec![Allocation::Resident {
                space:      MemorySpace::Default,
                interval:   v.live_range(),
                chunk:      None,
                uses:       v.uses.clone(),
            }]);
        }
    }

    fn commit(&mut self, trial: Trial, drafts: Vec<(ValueId, Draft)>) -> bool {
        if let Err(e) = self.ledger.commit(trial) {
            warn!("{e}");
            return false;
        }
        for (id, draft) in drafts {
            for (chunk, idx) in draft.chunks {
                self.owners
                    .entry(chunk)
                    .or_default()
                    .push((id, idx));
            }
            self.chains.insert(id, draft.chain);
        }

        true
    }

    fn abandon(&mut self, trial: Trial) {
        if let Err(e) = self.ledger.rollback(trial) {
            warn!("{e}");
        }
    }
    //---END COMMIT HELPERS

    /// Alternate memory for the whole group, for its whole life.
    fn try_pin(&mut self, bi: &BufferInterval) -> bool {
        let Some(chunk) = self.ledger.chunks().find_chunk(&bi.span, bi.size) else {
            return false;
        };
        let trial = self.ledger.begin_trial();
        let record = self.ledger.reserve_chunk(&trial, bi.leader(), bi.span, chunk);
        let drafts = bi.members
            .iter()
            .map(|id| {
                let v = self.program.value(*id);
                let mut draft = Draft::default();
                draft.push_backed(Allocation::Resident {
                    space:      MemorySpace::Alternate,
                    interval:   v.live_range(),
                    chunk:      Some(chunk),
                    uses:       v.uses.clone(),
                }, record);
                (*id, draft)
            })
            .collect();

        self.commit(trial, drafts)
    }

    /// Some alternate memory for part of a lone value's life.
    fn try_split(&mut self, id: ValueId) -> bool {
        let program = self.program;
        let v = program.value(id);
        if v.uses.is_empty() {
            return false;
        }
        if self.options.enable_eviction {
            // Longest prefix first.
            for j in (1..v.uses.len()).rev() {
                if self.try_evict(v, j) {
                    debug!("Value {} evicted after {} use(s)", v.id, j);
                    return true;
                }
            }
        }

        let trial = self.ledger.begin_trial();
        let mut draft = Draft::default();
        match self.serve_uses(&trial, v, v.definition, &v.uses, None, &mut draft) {
            Ok(n) if n > 0  => {
                debug!("Value {} prefetched {} time(s)", v.id, n);
                self.commit(trial, vec![(v.id, draft)])
            },
            Ok(_)   => {
                self.abandon(trial);
                false
            },
            Err(e)  => {
                debug!("Value {} prefetch rejected: {e}", v.id);
                self.abandon(trial);
                false
            },
        }
    }

    /// Keeps `v` in alternate memory from its definition over its first
    /// `j` uses, evicting it meanwhile. The rest are served from the
    /// evicted copy.
    fn try_evict(&mut self, v: &Value, j: usize) -> bool {
        let d = v.definition;
        let next_use = v.uses[j].time;
        let copy_done = self.picker
            .preferred_eviction_end_time(v.size, d, next_use)
            .max(d + 2)
            .min(next_use);
        let alt_end = copy_done.max(v.uses[j - 1].time + 1);
        if copy_done < d + 2 || alt_end > next_use {
            return false;
        }
        let alt = Interval::new(d, alt_end);
        let amount = self.cost.copy_elapsed(v.size);
        let Some(chunk) = self.ledger.chunks().find_chunk(&alt, v.size) else {
            return false;
        };
        if !self.ledger.can_copy(MemorySpace::Default, d, copy_done, amount) {
            return false;
        }

        let trial = self.ledger.begin_trial();
        let record = self.ledger.reserve_chunk(&trial, v.id, alt, chunk);
        let id = match self.ledger.add_copy(&trial, MemorySpace::Default, d, copy_done, amount) {
            Ok(id)  => id,
            Err(e)  => {
                debug!("Value {} eviction rejected: {e}", v.id);
                self.abandon(trial);
                return false;
            },
        };
        let mut draft = Draft::default();
        draft.push_backed(Allocation::Resident {
            space:      MemorySpace::Alternate,
            interval:   alt,
            chunk:      Some(chunk),
            uses:       v.uses[..j].to_vec(),
        }, record);
        let eviction = Eviction {
            id,
            copy_start: d,
            copy_done,
            amount,
        };

        match self.serve_uses(&trial, v, alt_end, &v.uses[j..], Some(eviction), &mut draft) {
            Ok(_)   => self.commit(trial, vec![(v.id, draft)]),
            Err(e)  => {
                debug!("Value {} prefetch rejected: {e}", v.id);
                self.abandon(trial);
                false
            },
        }
    }

    /// The next default memory epoch: the eviction's destination if
    /// one is pending, plain residency otherwise.
    fn default_epoch(opening: &mut Option<Eviction>, interval: Interval, uses: Vec<Use>) -> Allocation {
        match opening.take() {
            Some(e) => Allocation::Copy {
                id:             e.id,
                source:         MemorySpace::Alternate,
                interval,
                copy_start:     e.copy_start,
                copy_done:      e.copy_done,
                resource_cost:  e.amount,
                chunk:          None,
                uses,
            },
            None    => Allocation::Resident {
                space:  MemorySpace::Default,
                interval,
                chunk:  None,
                uses,
            },
        }
    }

    /// Serves `uses` of `v`, which sits in default memory from `from`
    /// on, prefetching ahead of them where possible. Extends `draft` up
    /// to the end of the value's life and returns the number of
    /// prefetches issued.
    fn serve_uses(
        &mut self,
        trial:      &Trial,
        v:          &Value,
        from:       Time,
        uses:       &[Use],
        mut opening: Option<Eviction>,
        draft:      &mut Draft,
    ) -> Result<usize, ResourceError> {
        let live_end = v.live_range().end;
        let mut resident_from = from;
        // Copies must start after every use served from default memory.
        let mut cursor = from;
        let mut prefetches = 0;
        let mut i = 0;
        while i < uses.len() {
            if self.options.max_prefetches_per_value.is_some_and(|m| prefetches >= m) {
                break;
            }
            let Some(found) = self.find_prefetch(v.size, cursor, &uses[i]) else {
                cursor = cursor.max(uses[i].time);
                i += 1;
                continue;
            };
            let start = found.copy_start();
            let chunk = found.chunk();
            // Keep the chunk over later uses while its offset stays free.
            let mut last = i;
            while last + 1 < uses.len() &&
                self.ledger.chunks().is_free(&Interval::new(start + 1, uses[last + 1].time + 1), &chunk) {
                last += 1;
            }

            let before = Interval::new(resident_from, start + 1);
            draft.push(Self::default_epoch(&mut opening, before, uses_within(uses, before)));
            let interval = Interval::new(start + 1, uses[last].time + 1);
            let record = self.ledger.reserve_chunk(trial, v.id, interval, chunk);
            let prefetch = self.issue(trial, found, interval, uses[i..=last].to_vec())?;
            draft.push_backed(prefetch, record);

            prefetches += 1;
            resident_from = interval.end;
            cursor = resident_from;
            i = last + 1;
        }
        if resident_from < live_end {
            let rest = Interval::new(resident_from, live_end);
            draft.push(Self::default_epoch(&mut opening, rest, uses_within(uses, rest)));
        }

        Ok(prefetches)
    }

    /// Walks the picker's candidates for a copy serving `use_`, no
    /// earlier than `cursor`. Sliced copies are preferred.
    fn find_prefetch(&mut self, size: ByteSteps, cursor: Time, use_: &Use) -> Option<Prefetch> {
        if use_.time - cursor < 2 {
            return None;
        }
        let (cost, options) = (self.cost, self.options);
        let amount = cost.copy_elapsed(size);
        self.picker.begin(use_, size, cursor, use_.time);
        while !self.picker.done() {
            let t = self.picker.next();
            if let Some(slicing) = &options.slicing {
                if let Some(plan) = plan_slices(cost, self.proposer, slicing, size, t, use_.time) {
                    let interval = Interval::new(plan.starts[0] + 1, use_.time + 1);
                    if self.ledger.can_copy_all(MemorySpace::Alternate, &plan.requests()) {
                        if let Some(chunk) = self.ledger.chunks().find_chunk(&interval, size) {
                            return Some(Prefetch::Sliced { plan, chunk });
                        }
                    }
                }
            }
            if self.ledger.can_copy(MemorySpace::Alternate, t, use_.time, amount) {
                let interval = Interval::new(t + 1, use_.time + 1);
                if let Some(chunk) = self.ledger.chunks().find_chunk(&interval, size) {
                    return Some(Prefetch::Whole {
                        start:  t,
                        done:   use_.time,
                        amount,
                        chunk,
                    });
                }
            }
        }

        None
    }

    /// Reserves the bandwidth of a prefetch that was found to fit.
    fn issue(
        &mut self,
        trial:      &Trial,
        found:      Prefetch,
        interval:   Interval,
        uses:       Vec<Use>,
    ) -> Result<Allocation, ResourceError> {
        match found {
            Prefetch::Whole { start, done, amount, chunk }  => {
                let id = self.ledger.add_copy(trial, MemorySpace::Alternate, start, done, amount)?;
                Ok(Allocation::Copy {
                    id,
                    source:         MemorySpace::Default,
                    interval,
                    copy_start:     start,
                    copy_done:      done,
                    resource_cost:  amount,
                    chunk:          Some(chunk),
                    uses,
                })
            },
            Prefetch::Sliced { plan, chunk }    => {
                let mut slices = Vec::with_capacity(plan.starts.len());
                for ((start, cost), sub_chunk) in plan.starts.iter()
                    .zip(plan.costs.iter())
                    .zip(plan.sub_chunks(chunk)) {
                    let id = self.ledger.add_copy(trial, MemorySpace::Alternate, *start, plan.end, *cost)?;
                    slices.push(SliceDetail {
                        id,
                        copy_start:     *start,
                        copy_done:      plan.end,
                        resource_cost:  *cost,
                        sub_chunk,
                    });
                }
                Ok(Allocation::SlicedCopy {
                    source: MemorySpace::Default,
                    interval,
                    slices,
                    chunk,
                    uses,
                })
            },
        }
    }

    //---START REPACKING GLUE
    /// The repacking view of every committed chunk, along with the
    /// chunk each block came from.
    fn blocks(&self) -> (Vec<AllocationBlock>, Vec<ChunkId>) {
        let mut blocks = vec![];
        let mut backing = vec![];
        for (id, epochs) in &self.owners {
            let Some(record) = self.ledger.chunks().get(*id) else { continue; };
            let colocated = epochs.len() > 1;
            for (value, idx) in epochs {
                let interval = self.chains
                    .get(value)
                    .and_then(|c| c.get(*idx))
                    .map(|a| a.interval())
                    .unwrap_or(record.interval);
                blocks.push(AllocationBlock {
                    id:                 blocks.len(),
                    interval,
                    size:               record.chunk.size,
                    offset:             record.chunk.offset,
                    colocation_group:   colocated.then_some(self.program.value(*value).group),
                });
                backing.push(*id);
            }
        }

        (blocks, backing)
    }

    fn apply(&mut self, blocks: &[AllocationBlock], backing: &[ChunkId]) {
        for (b, id) in blocks.iter().zip(backing.iter()) {
            self.ledger.chunks_mut().set_offset(*id, b.offset);
            if let Some(epochs) = self.owners.get(id) {
                for (value, idx) in epochs {
                    if let Some(a) = self.chains.get_mut(value).and_then(|c| c.get_mut(*idx)) {
                        a.set_offset(b.offset);
                    }
                }
            }
        }
    }

    /// Repacks, then gives rejected groups another chance. Groups
    /// required to stay in default memory are never retried.
    fn repack_rounds(&mut self, repacker: &mut dyn Repacker) -> Result<(), MsaError> {
        for round in 0..self.options.max_repacks {
            if self.rejected.is_empty() {
                break;
            }
            let (mut blocks, backing) = self.blocks();
            match repacker.repack(&mut blocks) {
                Ok(true)    => {},
                Ok(false)   => {
                    debug!("Repack round {round} changed nothing");
                    continue;
                },
                Err(e)      => {
                    warn!("Repack round {round} failed: {e}");
                    continue;
                },
            }
            self.num_repacks += 1;
            self.apply(&blocks, &backing);

            let retry = std::mem::take(&mut self.rejected);
            let before = retry.len();
            for group in retry {
                self.num_repack_retries += 1;
                let bi = self.program.buffer_interval(group)?;
                self.place(&bi)?;
            }
            info!(
                "Repack round {round}: {} of {before} rejected groups placed",
                before - self.rejected.len()
            );
        }

        Ok(())
    }
    //---END REPACKING GLUE

    fn finish(self) -> Plan {
        let mut allocations = self.chains;
        allocations.sort_keys();
        let mut plan = Plan {
            allocations,
            markers:    vec![],
            stats:      AllocationStats::default(),
        };
        plan.rebuild_markers();
        plan.stats = AllocationStats {
            num_repacks:        self.num_repacks,
            num_repack_retries: self.num_repack_retries,
            ..collect_stats(&plan)
        };

        plan
    }
}
