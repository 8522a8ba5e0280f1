use crate::helpe::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemorySpace {
    /// The large, slow tier.
    Default,
    /// The small, fast tier being optimized for.
    Alternate,
}

impl MemorySpace {
    #[inline(always)]
    pub fn other(self) -> Self {
        match self {
            MemorySpace::Default    => MemorySpace::Alternate,
            MemorySpace::Alternate  => MemorySpace::Default,
        }
    }
}

/// A fixed region of alternate memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk {
    pub offset: ByteSteps,
    pub size:   ByteSteps,
}

impl Chunk {
    #[inline(always)]
    pub fn new(offset: ByteSteps, size: ByteSteps) -> Self {
        Self { offset, size }
    }

    /// First offset past the chunk.
    #[inline(always)]
    pub fn next_avail_offset(&self) -> ByteSteps {
        self.offset + self.size
    }

    #[inline(always)]
    pub fn overlaps_with(&self, other: &Self) -> bool {
        self.offset < other.next_avail_offset() && other.offset < self.next_avail_offset()
    }
}

/// One piece of a sliced copy.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDetail {
    pub id:             CopyId,
    /// Exclusive start of the copy.
    pub copy_start:     Time,
    /// Time at which the slice must have landed.
    pub copy_done:      Time,
    pub resource_cost:  f64,
    /// Where this slice lands, inside the parent chunk.
    pub sub_chunk:      Chunk,
}

/// One epoch of a [Value]'s residency. A value owns an ordered chain of
/// these, covering its whole live range without gaps or overlap.
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    /// Sitting in `space` for the whole interval. Only alternate
    /// residencies carry a chunk.
    Resident {
        space:      MemorySpace,
        interval:   Interval,
        chunk:      Option<Chunk>,
        uses:       Vec<Use>,
    },
    /// Copied from `source` into the other space. A prefetch's interval
    /// opens right after `copy_start`, when its chunk is reserved. An
    /// eviction's opens once the alternate chunk is let go, which is
    /// no earlier than `copy_done`.
    Copy {
        id:             CopyId,
        source:         MemorySpace,
        interval:       Interval,
        copy_start:     Time,
        copy_done:      Time,
        resource_cost:  f64,
        chunk:          Option<Chunk>,
        uses:           Vec<Use>,
    },
    /// A prefetch split into several independently scheduled copies,
    /// concatenated into `chunk` once all have landed.
    SlicedCopy {
        source:     MemorySpace,
        interval:   Interval,
        slices:     Vec<SliceDetail>,
        chunk:      Chunk,
        uses:       Vec<Use>,
    },
}

impl Allocation {
    /// The space the value lives in during this epoch.
    #[inline(always)]
    pub fn space(&self) -> MemorySpace {
        match self {
            Allocation::Resident { space, .. }      => *space,
            Allocation::Copy { source, .. }         => source.other(),
            Allocation::SlicedCopy { source, .. }   => source.other(),
        }
    }

    #[inline(always)]
    pub fn interval(&self) -> Interval {
        match self {
            Allocation::Resident { interval, .. }
            | Allocation::Copy { interval, .. }
            | Allocation::SlicedCopy { interval, .. }   => *interval,
        }
    }

    #[inline(always)]
    pub fn chunk(&self) -> Option<Chunk> {
        match self {
            Allocation::Resident { chunk, .. }      => *chunk,
            Allocation::Copy { chunk, .. }          => *chunk,
            Allocation::SlicedCopy { chunk, .. }    => Some(*chunk),
        }
    }

    #[inline(always)]
    pub fn uses(&self) -> &[Use] {
        match self {
            Allocation::Resident { uses, .. }
            | Allocation::Copy { uses, .. }
            | Allocation::SlicedCopy { uses, .. }   => uses,
        }
    }

    /// The space data is read from when the epoch begins.
    #[inline(always)]
    pub fn source(&self) -> Option<MemorySpace> {
        match self {
            Allocation::Resident { .. }             => None,
            Allocation::Copy { source, .. }
            | Allocation::SlicedCopy { source, .. } => Some(*source),
        }
    }

    #[inline(always)]
    pub fn is_copy(&self) -> bool {
        !matches!(self, Allocation::Resident { .. })
    }

    /// Rewrites the alternate offset, keeping slices in step.
    pub fn set_offset(&mut self, offset: ByteSteps) {
        match self {
            Allocation::Resident { chunk: Some(c), .. }
            | Allocation::Copy { chunk: Some(c), .. }  => { c.offset = offset; },
            Allocation::SlicedCopy { chunk, slices, .. } => {
                for s in slices.iter_mut() {
                    s.sub_chunk.offset = s.sub_chunk.offset - chunk.offset + offset;
                }
                chunk.offset = offset;
            },
            _   => {},
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerKind {
    /// Ordered first so that data landing at `t` precedes new copies
    /// starting at `t`.
    CopyDone,
    SliceDone,
    Concat,
    CopyStart,
    SliceStart,
}

/// A point in the schedule where the code generator must emit a copy
/// related operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleMarker {
    pub time:   Time,
    pub kind:   MarkerKind,
    pub copy:   CopyId,
    pub value:  ValueId,
    /// Destination space of the copy.
    pub space:  MemorySpace,
}

/// Allocation-quality counters. Degradations are silent, and these
/// are the only way to observe them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub num_pinned:                 usize,
    pub num_prefetches:             usize,
    pub num_sliced_prefetches:      usize,
    pub num_evictions:              usize,
    pub num_default_only:           usize,
    pub num_repacks:                usize,
    pub num_repack_retries:         usize,
    pub max_outstanding_prefetches: usize,
    pub max_outstanding_evictions:  usize,
}

/// The pass's sole output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// Value ID -> allocation chain, in value ID order.
    pub allocations:    IndexMap<ValueId, Vec<Allocation>>,
    /// Sorted by `(time, kind, copy)`.
    pub markers:        Vec<ScheduleMarker>,
    pub stats:          AllocationStats,
}

impl Plan {
    #[inline(always)]
    pub fn chain(&self, id: ValueId) -> &[Allocation] {
        self.allocations
            .get(&id)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Every alternate memory residency in the plan, with its owner.
    pub fn alternate_chunks(&self) -> Vec<(ValueId, Interval, Chunk)> {
        self.allocations
            .iter()
            .flat_map(|(id, chain)| {
                chain.iter()
                    .filter_map(move |a| a.chunk().map(|c| (*id, a.interval(), c)))
            })
            .collect()
    }

    /// Recomputes markers from the allocation chains.
    pub fn rebuild_markers(&mut self) {
        let mut markers = vec![];
        for (value, chain) in &self.allocations {
            for a in chain {
                match a {
                    Allocation::Copy { id, source, copy_start, copy_done, .. } => {
                        let space = source.other();
                        markers.push(ScheduleMarker { time: *copy_start, kind: MarkerKind::CopyStart, copy: *id, value: *value, space });
                        markers.push(ScheduleMarker { time: *copy_done, kind: MarkerKind::CopyDone, copy: *id, value: *value, space });
                    },
                    Allocation::SlicedCopy { source, slices, .. } => {
                        let space = source.other();
                        for s in slices {
                            markers.push(ScheduleMarker { time: s.copy_start, kind: MarkerKind::SliceStart, copy: s.id, value: *value, space });
                            markers.push(ScheduleMarker { time: s.copy_done, kind: MarkerKind::SliceDone, copy: s.id, value: *value, space });
                        }
                        if let Some(last) = slices.iter().map(|s| (s.copy_done, s.id)).max() {
                            markers.push(ScheduleMarker { time: last.0, kind: MarkerKind::Concat, copy: last.1, value: *value, space });
                        }
                    },
                    Allocation::Resident { .. } => {},
                }
            }
        }
        markers.sort_unstable();
        self.markers = markers;
    }
}
