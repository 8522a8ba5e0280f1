use crate::helpe::*;

impl Value {
    /// Creates a [Value] that the [Program] gatekeeper will later
    /// validate and assign to a group.
    pub fn new(
        id:             ValueId,
        name:           &str,
        size:           ByteSteps,
        definition:     Time,
        uses:           &[Time],
    ) -> Self {
        Self {
            id,
            name:           String::from(name),
            size,
            definition,
            uses:           uses.iter()
                                .map(|&time| Use { time, operand: 0 })
                                .collect(),
            requirement:    Requirement::Any,
            group:          id,
        }
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirement = requirement;
        self
    }

    /// The time of the last use. Values nobody reads die right
    /// after their definition.
    #[inline(always)]
    pub fn last_use(&self) -> Time {
        self.uses
            .last()
            .map(|u| u.time)
            .unwrap_or(self.definition)
    }

    /// The half-open live range, `[definition, last use + 1)`.
    #[inline(always)]
    pub fn live_range(&self) -> Interval {
        Interval::new(self.definition, self.last_use() + 1)
    }

    /// Returns `true` if the value is live at moment `t`.
    #[inline(always)]
    pub fn is_live_at(&self, t: Time) -> bool {
        self.live_range().contains(t)
    }

    #[inline(always)]
    pub fn requires_default(&self) -> bool {
        matches!(self.requirement, Requirement::Default(_))
    }

    #[inline(always)]
    pub fn requires_alternate(&self) -> bool {
        matches!(self.requirement, Requirement::Alternate)
    }

    /// Time-space product of the value's life.
    #[inline(always)]
    pub fn area(&self) -> u128 {
        self.size as u128 * self.live_range().len() as u128
    }
}

impl Requirement {
    /// Merges two requirements of colocated values. `None` means
    /// that they contradict each other.
    #[inline(always)]
    pub fn merge(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Requirement::Any, o) | (o, Requirement::Any)   => Some(o),
            (Requirement::Alternate, Requirement::Alternate) => Some(Requirement::Alternate),
            (Requirement::Default(r), Requirement::Default(_)) => Some(Requirement::Default(r)),
            _   => None,
        }
    }
}

impl BufferInterval {
    #[inline(always)]
    pub fn is_colocated(&self) -> bool {
        self.members.len() > 1
    }

    /// The ID of the group's earliest-defined member. Used for
    /// deterministic tie-breaks and diagnostics.
    #[inline(always)]
    pub fn leader(&self) -> ValueId {
        self.members[0]
    }
}
