use crate::helpe::*;

/// Arena index of a committed chunk.
pub type ChunkId = u64;

/// A chunk of alternate memory, reserved for some interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRecord {
    pub owner:      ValueId,
    pub interval:   Interval,
    pub chunk:      Chunk,
}

impl ChunkRecord {
    #[inline(always)]
    pub fn collides_with(&self, interval: &Interval, chunk: &Chunk) -> bool {
        self.interval.overlaps_with(interval) && self.chunk.overlaps_with(chunk)
    }
}

/// Who holds which `(time, offset)` region of alternate memory.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMap {
    capacity:   ByteSteps,
    alignment:  ByteSteps,
    records:    BTreeMap<ChunkId, ChunkRecord>,
    next_id:    ChunkId,
}

impl ChunkMap {
    pub fn new(capacity: ByteSteps, alignment: ByteSteps) -> Self {
        Self {
            capacity,
            alignment:  alignment.max(1),
            records:    BTreeMap::new(),
            next_id:    0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> ByteSteps {
        self.capacity
    }

    /// Returns `true` if `chunk` fits in memory and nobody holds any
    /// part of it during `interval`.
    pub fn is_free(&self, interval: &Interval, chunk: &Chunk) -> bool {
        chunk.next_avail_offset() <= self.capacity &&
        !self.records
            .values()
            .any(|r| r.collides_with(interval, chunk))
    }

    /// Finds room for `size` bytes over `interval`.
    ///
    /// Offsets vacated by chunks dying exactly when `interval` begins are
    /// tried first: reusing them keeps the value where its predecessor
    /// was. Otherwise the lowest fitting gap wins (first-fit).
    pub fn find_chunk(&self, interval: &Interval, size: ByteSteps) -> Option<Chunk> {
        if size > self.capacity {
            return None;
        }
        let vacated = self.records
            .values()
            .filter(|r| r.interval.end == interval.start)
            .map(|r| r.chunk.offset)
            .filter(|o| o % self.alignment == 0)
            .sorted_unstable()
            .dedup();
        for offset in vacated {
            let cand = Chunk::new(offset, size);
            if self.is_free(interval, &cand) {
                return Some(cand);
            }
        }

        // Traverse chunks that overlap with the interval in ascending
        // offset, looking for the first gap that fits.
        let mut offset_runner = 0;
        let mut live = self.records
            .values()
            .filter(|r| r.interval.overlaps_with(interval))
            .map(|r| r.chunk)
            .sorted_unstable()
            .peekable();
        while let Some(next) = live.peek() {
            if next.offset > offset_runner {
                let test_off = align_up(offset_runner, self.alignment);
                if next.offset > test_off && next.offset - test_off >= size {
                    break;
                }
                offset_runner = test_off.max(next.next_avail_offset());
            } else {
                offset_runner = offset_runner.max(next.next_avail_offset());
            }
            live.next();
        }
        let test_off = align_up(offset_runner, self.alignment);
        let cand = Chunk::new(test_off, size);

        if cand.next_avail_offset() <= self.capacity { Some(cand) }
        else { None }
    }

    fn insert(&mut self, record: ChunkRecord) -> ChunkId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, record);
        id
    }

    fn remove(&mut self, id: ChunkId) -> Option<ChunkRecord> {
        self.records.remove(&id)
    }

    #[inline(always)]
    pub fn records(&self) -> impl Iterator<Item = (&ChunkId, &ChunkRecord)> {
        self.records.iter()
    }

    #[inline(always)]
    pub fn get(&self, id: ChunkId) -> Option<&ChunkRecord> {
        self.records.get(&id)
    }

    /// Moves a committed chunk. Only the repacking glue should do this,
    /// outside of any trial.
    pub fn set_offset(&mut self, id: ChunkId, offset: ByteSteps) {
        if let Some(r) = self.records.get_mut(&id) {
            r.chunk.offset = offset;
        }
    }

    /// Highest occupied offset, plus one.
    pub fn makespan(&self) -> ByteSteps {
        self.records
            .values()
            .map(|r| r.chunk.next_avail_offset())
            .max()
            .unwrap_or(0)
    }
}

/// Bandwidth and ordering of the copies into one memory space.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyTracker {
    pub resource:   AsynchronousCopyResource,
    pub ordering:   AsynchronousCopyOrdering,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mutation {
    Chunk(ChunkId, ChunkRecord),
    Copy(AsynchronousCopy),
}

/// Proof that a trial is open. Must be handed back to
/// [`Ledger::commit`] or [`Ledger::rollback`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Trial {
    id:     usize,
    mark:   usize,
}

/// All shared state the allocator mutates while searching: chunks, and
/// one [CopyTracker] per destination space. Mutations happen only under
/// an open [Trial] and are journaled, so that a rollback undoes exactly
/// what the trial did, in reverse.
#[derive(Debug, Clone)]
pub struct Ledger {
    chunks:         ChunkMap,
    trackers:       IndexMap<MemorySpace, CopyTracker>,
    journal:        Vec<Mutation>,
    open:           Vec<usize>,
    next_trial:     usize,
    next_copy_id:   CopyId,
}

impl Ledger {
    pub fn new(capacity: ByteSteps, alignment: ByteSteps, resources: Vec<f64>) -> Self {
        let mut trackers = IndexMap::new();
        for space in [MemorySpace::Alternate, MemorySpace::Default] {
            trackers.insert(space, CopyTracker {
                resource:   AsynchronousCopyResource::new(resources.clone()),
                ordering:   AsynchronousCopyOrdering::new(),
            });
        }

        Self {
            chunks:         ChunkMap::new(capacity, alignment),
            trackers,
            journal:        vec![],
            open:           vec![],
            next_trial:     0,
            next_copy_id:   0,
        }
    }

    //---START TRIALS
    pub fn begin_trial(&mut self) -> Trial {
        let id = self.next_trial;
        self.next_trial += 1;
        self.open.push(id);
        Trial {
            id,
            mark:   self.journal.len(),
        }
    }

    /// Closes `trial`. A trial that is still open but not innermost is
    /// undone together with everything opened after it, so that a
    /// misplaced token never leaves reservations behind.
    fn close(&mut self, trial: &Trial) -> Result<(), TrialError> {
        let innermost = self.open.last().copied();
        match self.open.iter().rposition(|&id| id == trial.id) {
            Some(pos) if pos + 1 == self.open.len() => {
                self.open.pop();
                Ok(())
            },
            Some(pos)   => {
                self.open.truncate(pos);
                self.undo_to(trial.mark);
                Err(TrialError {
                    given:  trial.id,
                    open:   innermost,
                })
            },
            None    => Err(TrialError {
                given:  trial.id,
                open:   innermost,
            }),
        }
    }

    fn undo_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            match self.journal.pop() {
                Some(Mutation::Chunk(id, _))    => { self.chunks.remove(id); },
                Some(Mutation::Copy(c))         => {
                    if let Some(t) = self.trackers.get_mut(&c.space) {
                        t.ordering.remove_copy(&c);
                        t.resource.remove_copy(&c);
                    }
                },
                None    => break,
            }
        }
        if self.open.is_empty() {
            self.journal.clear();
        }
    }

    /// Keeps everything the trial did. Inside an outer trial, the
    /// mutations stay journaled so that the outer one can still undo them.
    pub fn commit(&mut self, trial: Trial) -> Result<(), TrialError> {
        self.close(&trial)?;
        if self.open.is_empty() {
            self.journal.clear();
        }

        Ok(())
    }

    /// Undoes everything the trial did.
    pub fn rollback(&mut self, trial: Trial) -> Result<(), TrialError> {
        self.close(&trial)?;
        self.undo_to(trial.mark);

        Ok(())
    }

    #[inline(always)]
    pub fn in_trial(&self) -> bool {
        !self.open.is_empty()
    }
    //---END TRIALS

    pub fn reserve_chunk(
        &mut self,
        _trial:     &Trial,
        owner:      ValueId,
        interval:   Interval,
        chunk:      Chunk,
    ) -> ChunkId {
        debug_assert!(self.chunks.is_free(&interval, &chunk), "Colliding chunk reserved");
        let record = ChunkRecord {
            owner,
            interval,
            chunk,
        };
        let id = self.chunks.insert(record);
        self.journal.push(Mutation::Chunk(id, record));
        id
    }

    /// Can a copy into `space` over `(start, end)` be issued without
    /// overtaking anybody or starving the bandwidth?
    pub fn can_copy(&self, space: MemorySpace, start: Time, end: Time, amount: f64) -> bool {
        self.can_copy_all(space, &[(start, end, amount)])
    }

    /// Same as [`Ledger::can_copy`], for several copies that must all
    /// be issued together.
    pub fn can_copy_all(&self, space: MemorySpace, requests: &[(Time, Time, f64)]) -> bool {
        let Some(t) = self.trackers.get(&space) else { return false; };
        requests.iter().all(|(s, e, _)| s < e && !t.ordering.violates_ordering(*s, *e)) &&
        t.resource.has_enough_resource_multi_check(requests)
    }

    pub fn add_copy(
        &mut self,
        _trial:     &Trial,
        space:      MemorySpace,
        start:      Time,
        end:        Time,
        amount:     f64,
    ) -> Result<CopyId, ResourceError> {
        let copy = AsynchronousCopy {
            start,
            end,
            resource:   amount,
            space,
            id:         self.next_copy_id,
        };
        let tracker = self.trackers
            .get_mut(&space)
            .ok_or(ResourceError { id: copy.id, start, end, amount })?;
        tracker.resource.add_copy(&copy)?;
        tracker.ordering.add_copy(&copy);
        self.next_copy_id += 1;
        self.journal.push(Mutation::Copy(copy));

        Ok(copy.id)
    }

    #[inline(always)]
    pub fn chunks(&self) -> &ChunkMap {
        &self.chunks
    }

    #[inline(always)]
    pub fn chunks_mut(&mut self) -> &mut ChunkMap {
        &mut self.chunks
    }

    #[inline(always)]
    pub fn tracker(&self, space: MemorySpace) -> Option<&CopyTracker> {
        self.trackers.get(&space)
    }
}
