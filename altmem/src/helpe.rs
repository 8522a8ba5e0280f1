pub use std::{
    collections::{HashMap, BinaryHeap, BTreeMap, BTreeSet},
    path::PathBuf,
    io::{BufRead, BufReader},
    cmp::Ordering,
    time::Instant,
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use rayon::prelude::*;
pub use indexmap::{IndexMap, IndexSet};
pub use clap::{Parser, ValueEnum};
pub use tracing::{debug, info, warn};

pub use crate::{Value, BufferInterval, Use, Requirement, DefaultReason,
    allocation::*,
    program::*,
    cost::*,
    resource::*,
    ledger::*,
    input::*,
};

/// The unit for measuring bytes. Sizes, offsets and capacities
/// all share it.
pub type ByteSteps = usize;

/// The unit for measuring logical time, i.e., the index of an
/// instruction in the (fixed) schedule.
///
/// Signed, since copies are allowed to start "before" the very first
/// instruction: a copy with exclusive start `-1` may use step `0`.
pub type Time = i64;

/// Identifies a [Value]. Assigned densely by the program model, so that
/// ordering by ID never depends on memory addresses.
pub type ValueId = u32;

/// Identifies a colocation group: an arena index into
/// [Program::groups].
pub type GroupId = u32;

/// Identifies an asynchronous copy. Handed out in strictly
/// increasing order by the [Ledger].
pub type CopyId = u64;

/// A half-open range of logical time, `[start, end)`.
///
/// A value defined at `d` and last used at `u` lives on `[d, u + 1)`:
/// two intervals meeting at a point do *not* overlap, and thus their
/// chunks may share an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start:  Time,
    pub end:    Time,
}

impl Interval {
    #[inline(always)]
    pub fn new(start: Time, end: Time) -> Self {
        debug_assert!(start <= end, "Reversed interval requested");
        Self { start, end }
    }

    #[inline(always)]
    pub fn overlaps_with(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[inline(always)]
    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t < self.end
    }

    #[inline(always)]
    pub fn len(&self) -> Time {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The smallest interval containing both.
    #[inline(always)]
    pub fn hull(&self, other: &Self) -> Self {
        Self {
            start:  self.start.min(other.start),
            end:    self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

//---START ERRORS
#[derive(Error, Debug, Clone, PartialEq)]
/// The pass-level errors. Only [MsaError::Unsatisfiable] can surface
/// from a well-formed [Program]: it is the single diagnostic naming
/// a constraint that cannot be met.
pub enum MsaError {
    #[error("value `{name}` (#{value}) cannot be placed: {reason}")]
    Unsatisfiable {
        value:  ValueId,
        name:   String,
        size:   ByteSteps,
        reason: String,
    },
    #[error("{message}\n{:?}", culprit)]
    /// Appears while constructing the [Program] to be dealt with.
    InvalidValue {
        message:    String,
        culprit:    Value,
    },
    #[error("value `{name}` (#{value}) is colocated with values that both require and forbid alternate memory")]
    ConflictingRequirement {
        value:  ValueId,
        name:   String,
    },
    #[error("alias #{from} -> #{to} refers to an unknown value")]
    UnknownAlias {
        from:   ValueId,
        to:     ValueId,
    },
    #[error("instruction {index} refers to unknown computation {computation}")]
    InvalidSchedule {
        index:          Time,
        computation:    u32,
    },
    #[error("finished plan breaks {violations} rule(s), first: {first}")]
    /// Only surfaces when plan verification is switched on.
    InvalidPlan {
        violations: usize,
        first:      String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("not enough resource for copy #{id} over ({start}, {end}): {amount} requested")]
/// A reservation that does not fit was committed anyway.
pub struct ResourceError {
    pub id:     CopyId,
    pub start:  Time,
    pub end:    Time,
    pub amount: f64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("trial #{given} is stale; innermost open trial is {:?}", open)]
/// Trials must be closed innermost-first.
pub struct TrialError {
    pub given:  usize,
    pub open:   Option<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    #[error("cannot slice {size} bytes into {slices} pieces")]
    Unsliceable {
        size:   ByteSteps,
        slices: usize,
    },
    #[error("proposed slices sum up to {got} bytes instead of {expected}")]
    SizeMismatch {
        expected:   ByteSteps,
        got:        ByteSteps,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepackError {
    #[error("repacked makespan {makespan} exceeds capacity {capacity}")]
    OutOfCapacity {
        makespan: ByteSteps,
        capacity: ByteSteps,
    },
    #[error("colocation group {group} has blocks of different sizes")]
    BadGroup {
        group:  GroupId,
    },
}
//---END ERRORS

/// Rounds `cand` up to the next multiple of `alignment`.
#[inline(always)]
pub fn align_up(cand: ByteSteps, alignment: ByteSteps) -> ByteSteps {
    if alignment <= 1 || cand % alignment == 0 { cand }
    else { (cand / alignment + 1) * alignment }
}
