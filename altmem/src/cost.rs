use crate::helpe::*;

/// Elapsed-time estimates for instructions and copies. The pass never
/// second-guesses the numbers; it only needs them to be deterministic.
pub trait CostOracle {
    /// Seconds spent executing the instruction at `t`. May be zero
    /// (e.g. asynchronous collectives).
    fn elapsed_time(&self, t: Time) -> f64;
    /// Seconds needed to move `bytes` between the two memories.
    fn elapsed_copy_time(&self, bytes: ByteSteps) -> f64;
    /// How many times an instruction `depth` loops deep runs per
    /// execution of the top level.
    fn while_loop_trip_multiplier(&self, depth: u32) -> f64;
}

/// A [CostOracle] reading per-instruction costs from a table, with a
/// fixed copy bandwidth and a fixed trip count per loop level.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOracle {
    elapsed:            Vec<f64>,
    bytes_per_second:   f64,
    trip_count:         f64,
}

impl TableOracle {
    pub fn new(elapsed: Vec<f64>, bytes_per_second: f64) -> Self {
        Self {
            elapsed,
            bytes_per_second,
            trip_count: 5.0,
        }
    }

    /// Every instruction takes `per_instruction` seconds.
    pub fn uniform(len: usize, per_instruction: f64, bytes_per_second: f64) -> Self {
        Self::new(vec![per_instruction; len], bytes_per_second)
    }

    pub fn with_trip_count(mut self, trip_count: f64) -> Self {
        self.trip_count = trip_count;
        self
    }

    pub fn set_elapsed(&mut self, t: Time, elapsed: f64) {
        if let Some(e) = usize::try_from(t).ok().and_then(|idx| self.elapsed.get_mut(idx)) {
            *e = elapsed;
        }
    }
}

impl CostOracle for TableOracle {
    fn elapsed_time(&self, t: Time) -> f64 {
        usize::try_from(t).ok()
            .and_then(|idx| self.elapsed.get(idx))
            .copied()
            .unwrap_or(0.0)
    }

    fn elapsed_copy_time(&self, bytes: ByteSteps) -> f64 {
        bytes as f64 / self.bytes_per_second
    }

    fn while_loop_trip_multiplier(&self, depth: u32) -> f64 {
        self.trip_count.powi(depth as i32)
    }
}

/// Everything derived from the oracle that is worth computing only
/// once per pass. Owned by whoever runs the pass; nothing in here is
/// global.
#[derive(Debug, Clone, Default)]
pub struct CostCache {
    /// Unweighted per-instruction elapsed time.
    elapsed:        Vec<f64>,
    /// Reference depth -> prefix sums of loop-weighted elapsed time.
    /// `prefix[d][k]` sums instructions `0..k`.
    prefix:         BTreeMap<u32, Vec<f64>>,
    boundedness:    HashMap<GroupId, f64>,
}

impl CostCache {
    pub fn build(oracle: &dyn CostOracle, program: &Program) -> Self {
        let len = program.end_time();
        let elapsed: Vec<f64> = (0..len).map(|t| oracle.elapsed_time(t)).collect();
        let depths: BTreeSet<u32> = (0..len).map(|t| program.nest_depth(t)).collect();
        let mut prefix = BTreeMap::new();
        for d in depths {
            let mut running = 0.0;
            let mut sums = Vec::with_capacity(elapsed.len() + 1);
            sums.push(0.0);
            for (t, e) in elapsed.iter().enumerate() {
                let rel = program.nest_depth(t as Time).saturating_sub(d);
                running += e * oracle.while_loop_trip_multiplier(rel);
                sums.push(running);
            }
            prefix.insert(d, sums);
        }

        Self {
            elapsed,
            prefix,
            boundedness:    HashMap::new(),
        }
    }
}

/// The oracle plus its cache, as seen by the pass.
pub struct CostAnalysis<'a> {
    oracle:     &'a dyn CostOracle,
    program:    &'a Program,
    cache:      CostCache,
}

impl<'a> CostAnalysis<'a> {
    pub fn new(oracle: &'a dyn CostOracle, program: &'a Program) -> Self {
        let mut cache = CostCache::build(oracle, program);
        for bi in program.buffer_intervals() {
            let b = Self::boundedness_of(oracle, program, &bi);
            cache.boundedness.insert(bi.group, b);
        }

        Self {
            oracle,
            program,
            cache,
        }
    }

    #[inline(always)]
    pub fn program(&self) -> &'a Program {
        self.program
    }

    #[inline(always)]
    pub fn elapsed(&self, t: Time) -> f64 {
        usize::try_from(t).ok()
            .and_then(|idx| self.cache.elapsed.get(idx))
            .copied()
            .unwrap_or(0.0)
    }

    #[inline(always)]
    pub fn copy_elapsed(&self, bytes: ByteSteps) -> f64 {
        self.oracle.elapsed_copy_time(bytes)
    }

    /// Bandwidth available at each step, seeded from instruction times.
    pub fn initial_resources(&self) -> Vec<f64> {
        self.cache.elapsed.clone()
    }

    /// Loop-weighted time spent strictly between `start` and `end`,
    /// relative to the nest depth of `end`.
    pub fn interval_elapsed(&self, start: Time, end: Time) -> f64 {
        let depth = self.program.nest_depth(end);
        self.interval_elapsed_at(start, end, depth)
    }

    pub fn interval_elapsed_at(&self, start: Time, end: Time, depth: u32) -> f64 {
        let Some(sums) = self.cache.prefix.get(&depth)
            .or_else(|| self.cache.prefix.values().next()) else {
            return 0.0;
        };
        let n = sums.len() as Time - 1;
        let lo = (start + 1).clamp(0, n);
        let hi = end.clamp(0, n);
        if hi <= lo { 0.0 }
        else { sums[hi as usize] - sums[lo as usize] }
    }

    /// Time saved per byte by serving a group's uses from alternate
    /// memory. Computed once per group when the analysis is built.
    pub fn memory_boundedness(&self, bi: &BufferInterval) -> f64 {
        self.cache.boundedness
            .get(&bi.group)
            .copied()
            .unwrap_or_else(|| Self::boundedness_of(self.oracle, self.program, bi))
    }

    fn boundedness_of(oracle: &dyn CostOracle, program: &Program, bi: &BufferInterval) -> f64 {
        let copy = oracle.elapsed_copy_time(bi.size);
        let saved: f64 = bi.members
            .iter()
            .flat_map(|id| program.value(*id).uses.iter())
            .map(|u| {
                copy.min(oracle.elapsed_time(u.time))
                    * oracle.while_loop_trip_multiplier(program.nest_depth(u.time))
            })
            .sum();

        saved / bi.size as f64
    }
}
