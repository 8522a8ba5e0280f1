use crate::helpe::*;

/// Leftover demand below this is considered satisfied. Greedy
/// consumption of float amounts may leave crumbs behind.
const RESOURCE_EPSILON: f64 = 1e-9;

/// The minimal unit tracked by the resource and ordering models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsynchronousCopy {
    /// The copy may use steps strictly after this one...
    pub start:      Time,
    /// ...and strictly before this one.
    pub end:        Time,
    pub resource:   f64,
    /// Destination space.
    pub space:      MemorySpace,
    pub id:         CopyId,
}

impl AsynchronousCopy {
    /// The position of the copy in the issue queue.
    #[inline(always)]
    fn queue_key(&self) -> (Time, Time, CopyId) {
        (self.start, self.end, self.id)
    }
}

/// The Resource Timeline: how much copy bandwidth is available at each
/// logical time step.
///
/// Committed copies form a queue ordered by start time. Replaying that
/// queue, each copy greedily consumes bandwidth from the earliest step of
/// its window that still has some. A new copy entering the queue ahead of
/// others may push their consumption later within their own windows; the
/// reservation fits only if every copy is still fully served.
///
/// The state is a pure function of the committed set, which is what
/// makes [`remove_copy`](AsynchronousCopyResource::remove_copy) an exact
/// inverse of [`add_copy`](AsynchronousCopyResource::add_copy).
#[derive(Debug, Clone, PartialEq)]
pub struct AsynchronousCopyResource {
    initial:    Vec<f64>,
    consumed:   Vec<f64>,
    copies:     BTreeMap<(Time, Time, CopyId), AsynchronousCopy>,
}

impl AsynchronousCopyResource {
    pub fn new(initial: Vec<f64>) -> Self {
        let consumed = vec![0.0; initial.len()];
        Self {
            initial,
            consumed,
            copies: BTreeMap::new(),
        }
    }

    /// Replays the committed queue plus `extra`, returning the per-step
    /// consumption if everybody gets served.
    fn replay(&self, extra: &[AsynchronousCopy]) -> Option<Vec<f64>> {
        let mut queue: Vec<&AsynchronousCopy> = self.copies
            .values()
            .chain(extra.iter())
            .collect();
        queue.sort_by_key(|c| c.queue_key());

        let n = self.initial.len() as Time;
        let mut used = vec![0.0; self.initial.len()];
        for c in queue {
            let mut need = c.resource;
            let first = (c.start + 1).max(0);
            let last = c.end.min(n);
            let mut t = first;
            while need > RESOURCE_EPSILON && t < last {
                let idx = t as usize;
                let avail = self.initial[idx] - used[idx];
                if avail > 0.0 {
                    let take = need.min(avail);
                    used[idx] += take;
                    need -= take;
                }
                t += 1;
            }
            if need > RESOURCE_EPSILON {
                return None;
            }
        }

        Some(used)
    }

    /// Would a copy of `amount` over `(start, end)` fit, given what is
    /// already committed?
    pub fn has_enough_resource(&self, start: Time, end: Time, amount: f64) -> bool {
        self.has_enough_resource_multi_check(&[(start, end, amount)])
    }

    /// Validates several hypothetical reservations together, without
    /// mutating anything.
    pub fn has_enough_resource_multi_check(&self, requests: &[(Time, Time, f64)]) -> bool {
        let extra: Vec<AsynchronousCopy> = requests.iter()
            .enumerate()
            .map(|(idx, (start, end, amount))| AsynchronousCopy {
                start:      *start,
                end:        *end,
                resource:   *amount,
                space:      MemorySpace::Alternate,
                // Hypothetical copies queue behind committed
                // ones with the same window.
                id:         CopyId::MAX - (requests.len() - idx) as CopyId,
            })
            .collect();

        self.replay(&extra).is_some()
    }

    pub fn add_copy(&mut self, copy: &AsynchronousCopy) -> Result<(), ResourceError> {
        match self.replay(std::slice::from_ref(copy)) {
            Some(used)  => {
                self.copies.insert(copy.queue_key(), *copy);
                self.consumed = used;
                Ok(())
            },
            None        => Err(ResourceError {
                id:     copy.id,
                start:  copy.start,
                end:    copy.end,
                amount: copy.resource,
            }),
        }
    }

    /// Returns `false` if the copy was never committed.
    pub fn remove_copy(&mut self, copy: &AsynchronousCopy) -> bool {
        if self.copies.remove(&copy.queue_key()).is_none() {
            return false;
        }
        // Removing a copy never starves the ones queued behind it.
        if let Some(used) = self.replay(&[]) {
            self.consumed = used;
        }

        true
    }

    /// Bandwidth still free at step `t`.
    #[inline(always)]
    pub fn remaining(&self, t: Time) -> f64 {
        usize::try_from(t).ok()
            .and_then(|idx| self.initial.get(idx).zip(self.consumed.get(idx)))
            .map(|(i, c)| i - c)
            .unwrap_or(0.0)
    }

    pub fn remaining_resources(&self) -> Vec<f64> {
        self.initial.iter()
            .zip(self.consumed.iter())
            .map(|(i, c)| i - c)
            .collect()
    }

    #[inline(always)]
    pub fn num_copies(&self) -> usize {
        self.copies.len()
    }
}

/// The committed copy windows into one memory space. Copies are issued
/// to a FIFO queue, so a window strictly nested inside another one would
/// have to overtake it. Sharing an endpoint is fine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsynchronousCopyOrdering {
    ranges: BTreeMap<(Time, Time), usize>,
}

impl AsynchronousCopyOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_copy(&mut self, copy: &AsynchronousCopy) {
        *self.ranges
            .entry((copy.start, copy.end))
            .or_insert(0) += 1;
    }

    pub fn remove_copy(&mut self, copy: &AsynchronousCopy) {
        let key = (copy.start, copy.end);
        if let Some(count) = self.ranges.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.ranges.remove(&key);
            }
        }
    }

    pub fn violates_ordering(&self, start: Time, end: Time) -> bool {
        // Started earlier, finishes later: we would overtake it.
        self.ranges
            .range(..(start, Time::MIN))
            .any(|((_, e), _)| *e > end)
        ||
        // Starts later, finishes earlier: it would overtake us.
        self.ranges
            .range((start.saturating_add(1), Time::MIN)..)
            .any(|((_, e), _)| *e < end)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.ranges.values().sum()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
