//! Welcome to `altmem`!
//!
//! A compile-time pass deciding which short-lived values of a scheduled
//! dataflow program live in a small, fast *alternate* memory and which
//! in the big, slow *default* one, and scheduling the asynchronous copies
//! (prefetches and evictions) that move values between the two.

mod value;
mod analyze;

pub mod algo;
pub mod allocation;
pub mod cost;
pub mod input;
pub mod ledger;
pub mod program;
pub mod repack;
pub mod resource;
pub mod helpe;

pub use crate::helpe::*;
pub use crate::analyze::{verify_plan, Violation};

/// Our fundamental unit of interest. A [`Value`] is the output of one
/// instruction of the schedule, together with everything that reads it:
///
/// 1. [`size`](Value::size) bytes come into existence at logical time
///     [`definition`](Value::definition).
/// 2. Every [`Use`] reads the value at its own logical time. The last one
///     ends the value's life.
///
/// > ***ATTENTION:*** liveness is half-open. A value defined at `d` and
/// > last used at `u` lives on `[d, u + 1)`. If a value dies at exactly
/// > the time another one is defined, the two may share an offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub id:             ValueId,
    pub name:           String,
    pub size:           ByteSteps,
    pub definition:     Time,
    /// Sorted by increasing time by [`Program::init`].
    pub uses:           Vec<Use>,
    pub requirement:    Requirement,
    /// Filled in by [`Program::init`]. Values that do not alias anything
    /// form singleton groups.
    pub group:          GroupId,
}

/// One read of a [Value].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Use {
    /// Index of the reading instruction.
    pub time:       Time,
    /// Operand position within the reading instruction.
    pub operand:    usize,
}

/// External placement constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// The allocator is free to decide.
    Any,
    /// Pre-colored: must live in alternate memory for its whole life.
    Alternate,
    /// Must never receive an alternate memory chunk.
    Default(DefaultReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultReason {
    Parameter,
    /// Loop-carried value pinned by policy.
    LoopPolicy,
    ConditionalOutput,
    /// Control operand of a collective operation.
    CollectiveControl,
    /// Inherited across a call/conditional/fusion boundary from the
    /// given caller-side value.
    Propagated(ValueId),
}

/// The entity ordered by the comparator and consumed by the allocator:
/// a colocation group seen as one unit. Most groups contain a single
/// value; loop-carried chains (parameter, body uses, loop output)
/// contain several, all of which must end up at the same offset.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInterval {
    pub group:          GroupId,
    /// Sorted by definition time, ties by ID.
    pub members:        Vec<ValueId>,
    /// From the earliest member definition to the latest member death.
    pub span:           Interval,
    /// Largest member size.
    pub size:           ByteSteps,
    /// Strictest requirement over all members.
    pub requirement:    Requirement,
}
