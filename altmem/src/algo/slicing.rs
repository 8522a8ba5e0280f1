use crate::helpe::*;

/// Knobs for sliced prefetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceOptions {
    /// How many slices to ask the proposer for.
    pub max_slices:     usize,
    /// Values smaller than this are never sliced.
    pub min_bytes:      ByteSteps,
    /// Slice sizes are multiples of this (the last one excepted).
    pub granularity:    ByteSteps,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            max_slices:     2,
            min_bytes:      1024,
            granularity:    64,
        }
    }
}

/// One piece suggested by a [SliceProposer].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceProposal {
    pub byte_size:  ByteSteps,
}

/// Decides how a value may be cut into pieces that can be copied
/// independently. Whatever it proposes must add up to the whole.
pub trait SliceProposer {
    fn propose_slices(
        &self,
        size:       ByteSteps,
        options:    &SliceOptions,
    ) -> Result<Vec<SliceProposal>, ProposalError>;
}

/// Cuts values into `max_slices` pieces of (almost) equal,
/// granularity-aligned size.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenSliceProposer;

impl SliceProposer for EvenSliceProposer {
    fn propose_slices(
        &self,
        size:       ByteSteps,
        options:    &SliceOptions,
    ) -> Result<Vec<SliceProposal>, ProposalError> {
        let k = options.max_slices;
        let unsliceable = ProposalError::Unsliceable { size, slices: k };
        if k < 2 {
            return Err(unsliceable);
        }
        let piece = align_up(size.div_ceil(k), options.granularity.max(1));
        if piece >= size {
            return Err(unsliceable);
        }

        let mut res = vec![];
        let mut left = size;
        while left > 0 {
            let byte_size = piece.min(left);
            res.push(SliceProposal { byte_size });
            left -= byte_size;
        }

        Ok(res)
    }
}

/// Where and how big each slice of one prefetch is.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicePlan {
    /// Exclusive start times, non-decreasing.
    pub starts:     Vec<Time>,
    pub sizes:      Vec<ByteSteps>,
    pub costs:      Vec<f64>,
    /// All slices must have landed by then.
    pub end:        Time,
}

impl SlicePlan {
    /// The reservations to validate together.
    pub fn requests(&self) -> Vec<(Time, Time, f64)> {
        self.starts.iter()
            .zip(self.costs.iter())
            .map(|(s, c)| (*s, self.end, *c))
            .collect()
    }

    /// Sub-chunks of `chunk`, laid out in slice order.
    pub fn sub_chunks(&self, chunk: Chunk) -> Vec<Chunk> {
        let mut offset = chunk.offset;
        self.sizes.iter()
            .map(|s| {
                let c = Chunk::new(offset, *s);
                offset += s;
                c
            })
            .collect()
    }
}

/// Plans a sliced prefetch of `size` bytes that may start after `start`
/// and must be done by `end`. `None` means that slicing is not worth it or
/// not possible, and the caller should fall back to an unsliced copy.
///
/// The first slice starts as early as allowed. Every later slice starts at
/// its natural boundary: walking backwards from `end`, the point where the
/// remaining compute equals the share of the slices still to come. No
/// slice starts in a different computation than the one `end` sits in.
pub fn plan_slices(
    cost:       &CostAnalysis,
    proposer:   &dyn SliceProposer,
    options:    &SliceOptions,
    size:       ByteSteps,
    start:      Time,
    end:        Time,
) -> Option<SlicePlan> {
    if size < options.min_bytes || options.max_slices < 2 {
        return None;
    }
    let proposals = match proposer.propose_slices(size, options) {
        Ok(p)   => p,
        Err(e)  => {
            debug!("Slicing unavailable: {e}");
            return None;
        },
    };
    let total: ByteSteps = proposals.iter().map(|p| p.byte_size).sum();
    if total != size || proposals.len() < 2 || proposals.iter().any(|p| p.byte_size == 0) {
        warn!("{}", ProposalError::SizeMismatch { expected: size, got: total });
        return None;
    }

    // Never cross a change of enclosing computation.
    let program = cost.program();
    let home = program.computation_of(end);
    let mut run_start = end;
    while run_start - 1 >= start.max(0) && program.computation_of(run_start - 1) == home {
        run_start -= 1;
    }
    let first = start.max(run_start);
    if first >= end - 1 {
        return None;
    }

    let k = proposals.len();
    let window = cost.interval_elapsed(first, end);
    let worth = window / k as f64;
    let mut starts = vec![first];
    for i in 1..k {
        let remaining = (k - i) as f64 * worth;
        let prev = starts[i - 1];
        // Closest start to `end` still leaving `remaining` to overlap.
        let mut t = (prev..end)
            .rev()
            .find(|t| cost.interval_elapsed(*t, end) >= remaining)
            .unwrap_or(prev);
        // Copies are issued after real work, not after free instructions.
        while t > prev && cost.elapsed(t) == 0.0 {
            t -= 1;
        }
        starts.push(t);
    }

    Some(SlicePlan {
        starts,
        sizes:  proposals.iter().map(|p| p.byte_size).collect(),
        costs:  proposals.iter().map(|p| cost.copy_elapsed(p.byte_size)).collect(),
        end,
    })
}
