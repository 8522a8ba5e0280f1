use crate::helpe::*;

/// Enumerates candidate start times for one prefetch. Restartable: every
/// [`begin`](PrefetchIntervalPicker::begin) starts a fresh, finite sequence.
pub trait PrefetchIntervalPicker {
    /// Sets up the search for a copy of `size` bytes serving `use_`.
    /// Candidate (exclusive) start times lie in `[start, end)`; the copy
    /// must be done by `end`.
    fn begin(&mut self, use_: &Use, size: ByteSteps, start: Time, end: Time);
    /// The next candidate (exclusive) copy start time.
    fn next(&mut self) -> Time;
    /// Exhausted: no further narrowing is possible for this use.
    fn done(&self) -> bool;
    /// When should an eviction of `size` bytes starting at `start` be
    /// done by, at the latest `latest_end`?
    fn preferred_eviction_end_time(&self, size: ByteSteps, start: Time, latest_end: Time) -> Time;
}

/// Bounds prefetch windows by plain instruction counts.
#[derive(Debug, Clone)]
pub struct InstructionCountPicker {
    min_overlap:    Time,
    max_overlap:    Time,
    end:            Time,
    current:        Time,
}

impl InstructionCountPicker {
    pub fn new(min_overlap: Time, max_overlap: Time) -> Self {
        Self {
            min_overlap,
            max_overlap,
            end:        0,
            current:    0,
        }
    }
}

impl PrefetchIntervalPicker for InstructionCountPicker {
    fn begin(&mut self, _use: &Use, _size: ByteSteps, start: Time, end: Time) {
        self.end = end;
        self.current = start.max(end - self.max_overlap);
    }

    fn next(&mut self) -> Time {
        debug_assert!(!self.done(), "Exhausted picker asked for more");
        self.current += 1;
        self.current - 1
    }

    fn done(&self) -> bool {
        self.end - self.current <= self.min_overlap
    }

    fn preferred_eviction_end_time(&self, _size: ByteSteps, start: Time, latest_end: Time) -> Time {
        (start + self.min_overlap).min(latest_end)
    }
}

/// Bounds prefetch windows by how much compute they overlap, relative
/// to the time the copy itself takes.
///
/// The search starts at the window whose overlap is closest to
/// `preferred_ratio` times the copy time, then alternates between later
/// and earlier starts. Windows overlap at least `min_ratio` times the
/// copy time and at most `max_ratio` times it, the latter scaled up for
/// values much smaller than the memory. Starts sitting inside a loop
/// nested deeper than the use are skipped; a use inside a loop body may
/// still be fetched from before the loop.
pub struct CostBasedPicker<'a> {
    cost:               &'a CostAnalysis<'a>,
    capacity:           ByteSteps,
    min_ratio:          f64,
    preferred_ratio:    f64,
    max_ratio:          f64,
    //---START SEARCH STATE
    end:                Time,
    earliest:           Time,
    latest:             Time,
    increasing:         Time,
    decreasing:         Time,
    using_increasing:   bool,
    //---END SEARCH STATE
}

impl<'a> CostBasedPicker<'a> {
    pub fn new(
        cost:               &'a CostAnalysis<'a>,
        capacity:           ByteSteps,
        min_ratio:          f64,
        preferred_ratio:    f64,
        max_ratio:          f64,
    ) -> Self {
        Self {
            cost,
            capacity,
            min_ratio,
            preferred_ratio,
            max_ratio,
            end:                0,
            earliest:           0,
            latest:             -1,
            increasing:         0,
            decreasing:         -1,
            using_increasing:   false,
        }
    }

    #[inline(always)]
    fn not_deeper(&self, t: Time) -> bool {
        let program = self.cost.program();
        program.nest_depth(t) <= program.nest_depth(self.end)
    }

    #[inline(always)]
    fn overlap(&self, t: Time) -> f64 {
        self.cost.interval_elapsed(t, self.end)
    }

    /// Longest compute overlap tolerated for a copy of `size` bytes.
    #[inline(always)]
    fn max_overlap(&self, size: ByteSteps, copy: f64) -> f64 {
        let scale = (self.capacity as f64 / size.max(1) as f64).max(1.0);
        self.max_ratio * copy * scale
    }

    /// Returns the window start bounds, `(earliest, latest)`.
    /// `earliest > latest` if there is nothing to try.
    pub fn window_bounds(&mut self, size: ByteSteps, start: Time, end: Time) -> (Time, Time) {
        self.end = end;
        let copy = self.cost.copy_elapsed(size);
        let min_overlap = self.min_ratio * copy;
        let max_overlap = self.max_overlap(size, copy);

        let latest = (start..end)
            .rev()
            .find(|t| self.not_deeper(*t) && self.overlap(*t) >= min_overlap)
            .unwrap_or(start - 1);
        let earliest = (start..=latest)
            .find(|t| self.not_deeper(*t) && self.overlap(*t) <= max_overlap)
            .unwrap_or(latest + 1);

        (earliest, latest)
    }
}

impl PrefetchIntervalPicker for CostBasedPicker<'_> {
    fn begin(&mut self, _use: &Use, size: ByteSteps, start: Time, end: Time) {
        let (earliest, latest) = self.window_bounds(size, start, end);
        self.earliest = earliest;
        self.latest = latest;
        if earliest > latest {
            self.increasing = latest + 1;
            self.decreasing = earliest - 1;
            return;
        }

        // Between the earliest and latest start, find the one closest
        // to the preferred overlap. Ties go to the later start.
        let target = self.preferred_ratio * self.cost.copy_elapsed(size);
        let mut preferred = latest;
        let mut best = f64::MAX;
        for t in (earliest..=latest).rev().filter(|t| self.not_deeper(*t)) {
            let miss = (self.overlap(t) - target).abs();
            if miss < best {
                best = miss;
                preferred = t;
            }
        }

        self.decreasing = preferred;
        self.increasing = preferred + 1;
        while self.increasing <= self.latest && !self.not_deeper(self.increasing) {
            self.increasing += 1;
        }
        self.using_increasing = false;
    }

    fn next(&mut self) -> Time {
        debug_assert!(!self.done(), "Exhausted picker asked for more");
        let take_decreasing = if self.using_increasing {
            self.increasing > self.latest
        } else {
            self.decreasing >= self.earliest
        };

        if take_decreasing {
            let res = self.decreasing;
            self.decreasing -= 1;
            while self.decreasing >= self.earliest && !self.not_deeper(self.decreasing) {
                self.decreasing -= 1;
            }
            if self.increasing <= self.latest {
                self.using_increasing = true;
            }
            res
        } else {
            let res = self.increasing;
            self.increasing += 1;
            while self.increasing <= self.latest && !self.not_deeper(self.increasing) {
                self.increasing += 1;
            }
            if self.decreasing >= self.earliest {
                self.using_increasing = false;
            }
            res
        }
    }

    fn done(&self) -> bool {
        self.increasing > self.latest && self.decreasing < self.earliest
    }

    fn preferred_eviction_end_time(&self, size: ByteSteps, start: Time, latest_end: Time) -> Time {
        let copy = self.cost.copy_elapsed(size);
        ((start + 1)..=latest_end)
            .find(|t| self.cost.interval_elapsed(start, *t) >= copy)
            .unwrap_or(latest_end)
    }
}
