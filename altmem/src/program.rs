use crate::helpe::*;

/// Arena index of a [Computation] within a [Schedule].
pub type ComputationId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationKind {
    Entry,
    WhileBody,
    WhileCondition,
    ConditionalBranch,
    Call,
    Fusion,
}

impl ComputationKind {
    /// Loop bodies and conditions execute many times per parent
    /// execution; they deepen the nest.
    #[inline(always)]
    fn is_loop(self) -> bool {
        matches!(self, ComputationKind::WhileBody | ComputationKind::WhileCondition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    pub name:   String,
    pub kind:   ComputationKind,
    pub parent: Option<ComputationId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub name:           String,
    pub computation:    ComputationId,
}

/// The flattened, fixed instruction order the pass works on. Logical
/// time `t` is simply the index of an instruction in here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    computations:   Vec<Computation>,
    instructions:   Vec<Instruction>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single entry computation of `len` anonymous instructions.
    pub fn straight_line(len: usize) -> Self {
        let mut res = Self::new();
        let entry = res.add_computation("entry", ComputationKind::Entry, None);
        res.push_n(entry, len);
        res
    }

    pub fn add_computation(
        &mut self,
        name:   &str,
        kind:   ComputationKind,
        parent: Option<ComputationId>,
    ) -> ComputationId {
        self.computations.push(Computation {
            name:   String::from(name),
            kind,
            parent,
        });

        (self.computations.len() - 1) as ComputationId
    }

    /// Appends one instruction and returns its logical time.
    pub fn push(&mut self, name: &str, computation: ComputationId) -> Time {
        self.instructions.push(Instruction {
            name: String::from(name),
            computation,
        });

        (self.instructions.len() - 1) as Time
    }

    pub fn push_n(&mut self, computation: ComputationId, n: usize) {
        for _ in 0..n {
            let idx = self.instructions.len();
            self.push(&format!("i{idx}"), computation);
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// Loop parameter, body uses and loop output: one colocation group.
    LoopCarried,
    /// Caller-side operand handed to a callee parameter (conditional
    /// branch, call or fusion). Carries required-default constraints
    /// into the callee.
    Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alias {
    pub from:   ValueId,
    pub to:     ValueId,
    pub kind:   AliasKind,
}

/// The program model the pass consumes: schedule, values and their
/// aliasing, validated once by [`Program::init`].
#[derive(Debug, Clone)]
pub struct Program {
    schedule:   Schedule,
    nest_depth: Vec<u32>,
    values:     Vec<Value>,
    /// Group ID -> members, in increasing group ID order.
    groups:     IndexMap<GroupId, Vec<ValueId>>,
}

impl Program {
    /// Initializes a [Program]. A successfully returned one is
    /// guaranteed to be compliant with all of the allocator's
    /// assumptions. These are:
    /// - value IDs are dense and equal to their index
    /// - no value has zero size
    /// - definitions and uses refer to existing instructions
    /// - every use comes strictly after the definition
    /// - computations only nest under earlier computations
    /// - colocated values agree on their requirements
    ///
    /// Uses are sorted, loop-carried aliases are folded into groups and
    /// required-default constraints are pushed across boundaries.
    ///
    /// This function is the gatekeeper to the rest of the library.
    pub fn init(
        schedule:   Schedule,
        mut values: Vec<Value>,
        aliases:    &[Alias],
    ) -> Result<Self, MsaError> {
        let nest_depth = Self::compute_nest_depth(&schedule)?;
        let len = schedule.len() as Time;

        for (idx, v) in values.iter_mut().enumerate() {
            v.uses.sort_unstable();
            let message = if v.id as usize != idx {
                Some("Value with non-dense ID found!")
            } else if v.size == 0 {
                Some("Value with 0 size found!")
            } else if v.definition < 0 || v.definition >= len {
                Some("Value defined outside the schedule found!")
            } else if v.uses.iter().any(|u| u.time <= v.definition) {
                Some("Value used before (or at) its definition found!")
            } else if v.uses.iter().any(|u| u.time >= len) {
                Some("Value used outside the schedule found!")
            } else { None };
            if let Some(m) = message {
                return Err(MsaError::InvalidValue {
                    message: String::from(m),
                    culprit: v.clone(),
                });
            }
        }
        if let Some(a) = aliases.iter()
            .find(|a| a.from as usize >= values.len() || a.to as usize >= values.len()) {
            return Err(MsaError::UnknownAlias {
                from:   a.from,
                to:     a.to,
            });
        }

        let groups = Self::fold_loop_chains(&mut values, aliases);
        Self::propagate_defaults(&mut values, aliases, &groups)?;

        let res = Self {
            schedule,
            nest_depth,
            values,
            groups,
        };
        // Check group agreement eagerly, so that the allocator only
        // ever meets consistent groups.
        for gid in res.groups.keys() {
            res.buffer_interval(*gid)?;
        }

        Ok(res)
    }

    fn compute_nest_depth(schedule: &Schedule) -> Result<Vec<u32>, MsaError> {
        let mut comp_depth: Vec<u32> = Vec::with_capacity(schedule.computations.len());
        for (idx, c) in schedule.computations.iter().enumerate() {
            let inherited = match c.parent {
                Some(p) if (p as usize) < idx   => comp_depth[p as usize],
                Some(p) => {
                    return Err(MsaError::InvalidSchedule {
                        index:          -1,
                        computation:    p,
                    });
                },
                None    => 0,
            };
            comp_depth.push(inherited + c.kind.is_loop() as u32);
        }

        schedule.instructions
            .iter()
            .enumerate()
            .map(|(t, i)| {
                comp_depth.get(i.computation as usize)
                    .copied()
                    .ok_or(MsaError::InvalidSchedule {
                        index:          t as Time,
                        computation:    i.computation,
                    })
            })
            .collect()
    }

    /// Pushes required-default constraints from caller-side operands to
    /// callee parameters, transitively. A value that must stay in default
    /// memory drags its whole colocation group along, and every member of
    /// that group forwards the constraint across its own boundaries.
    fn propagate_defaults(
        values:     &mut [Value],
        aliases:    &[Alias],
        groups:     &IndexMap<GroupId, Vec<ValueId>>,
    ) -> Result<(), MsaError> {
        let mut worklist: Vec<ValueId> = values.iter()
            .filter(|v| v.requires_default())
            .map(|v| v.id)
            .collect();
        while let Some(from) = worklist.pop() {
            let colocated = groups.get(&values[from as usize].group)
                .into_iter()
                .flatten()
                .copied();
            let callees = aliases.iter()
                .filter(|a| a.kind == AliasKind::Boundary && a.from == from)
                .map(|a| a.to);
            for to in colocated.chain(callees).collect_vec() {
                let target = &mut values[to as usize];
                match target.requirement {
                    Requirement::Any    => {
                        target.requirement = Requirement::Default(DefaultReason::Propagated(from));
                        worklist.push(to);
                    },
                    Requirement::Default(_) => {},
                    Requirement::Alternate  => {
                        return Err(MsaError::ConflictingRequirement {
                            value:  target.id,
                            name:   target.name.clone(),
                        });
                    },
                }
            }
        }

        Ok(())
    }

    /// Folds loop-carried aliases into colocation groups. A group's ID
    /// is its smallest member ID, so that numbering is independent of
    /// the order aliases were listed in.
    fn fold_loop_chains(values: &mut [Value], aliases: &[Alias]) -> IndexMap<GroupId, Vec<ValueId>> {
        let mut parent: Vec<ValueId> = (0..values.len() as ValueId).collect();
        fn find(parent: &mut [ValueId], mut x: ValueId) -> ValueId {
            while parent[x as usize] != x {
                parent[x as usize] = parent[parent[x as usize] as usize];
                x = parent[x as usize];
            }
            x
        }
        for a in aliases.iter().filter(|a| a.kind == AliasKind::LoopCarried) {
            let (ra, rb) = (find(&mut parent, a.from), find(&mut parent, a.to));
            if ra != rb {
                let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
                parent[hi as usize] = lo;
            }
        }

        let mut groups: IndexMap<GroupId, Vec<ValueId>> = IndexMap::new();
        for idx in 0..values.len() {
            let root = find(&mut parent, idx as ValueId);
            values[idx].group = root;
            groups.entry(root)
                .or_default()
                .push(idx as ValueId);
        }
        groups.sort_keys();
        for members in groups.values_mut() {
            members.sort_by_key(|id| (values[*id as usize].definition, *id));
        }

        groups
    }

    /// Views a colocation group as a single unit.
    ///
    /// Panics if `group` is not one of [`Program::groups`].
    pub fn buffer_interval(&self, group: GroupId) -> Result<BufferInterval, MsaError> {
        let members = self.groups[&group].clone();
        let first = &self.values[members[0] as usize];
        let mut span = first.live_range();
        let mut size = first.size;
        let mut requirement = first.requirement;
        for id in members.iter().skip(1) {
            let v = &self.values[*id as usize];
            span = span.hull(&v.live_range());
            size = size.max(v.size);
            requirement = requirement
                .merge(v.requirement)
                .ok_or(MsaError::ConflictingRequirement {
                    value:  v.id,
                    name:   v.name.clone(),
                })?;
        }

        Ok(BufferInterval {
            group,
            members,
            span,
            size,
            requirement,
        })
    }

    /// All colocation groups, in group ID order.
    pub fn buffer_intervals(&self) -> Vec<BufferInterval> {
        self.groups
            .keys()
            .filter_map(|gid| self.buffer_interval(*gid).ok())
            .collect()
    }

    #[inline(always)]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[inline(always)]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id as usize]
    }

    #[inline(always)]
    pub fn groups(&self) -> &IndexMap<GroupId, Vec<ValueId>> {
        &self.groups
    }

    #[inline(always)]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Number of instructions, i.e., the first time past the schedule.
    #[inline(always)]
    pub fn end_time(&self) -> Time {
        self.schedule.len() as Time
    }

    #[inline(always)]
    pub fn instruction(&self, t: Time) -> Option<&Instruction> {
        usize::try_from(t).ok()
            .and_then(|idx| self.schedule.instructions.get(idx))
    }

    /// Loop nest depth of the instruction at `t`. Out-of-schedule
    /// times are treated as top level.
    #[inline(always)]
    pub fn nest_depth(&self, t: Time) -> u32 {
        usize::try_from(t).ok()
            .and_then(|idx| self.nest_depth.get(idx))
            .copied()
            .unwrap_or(0)
    }

    #[inline(always)]
    pub fn computation_of(&self, t: Time) -> Option<ComputationId> {
        self.instruction(t).map(|i| i.computation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_schedule() -> Schedule {
        let mut s = Schedule::new();
        let entry = s.add_computation("entry", ComputationKind::Entry, None);
        let body = s.add_computation("body", ComputationKind::WhileBody, Some(entry));
        s.push_n(entry, 2);
        s.push_n(body, 4);
        s.push_n(entry, 2);
        s
    }

    #[test]
    fn rejects_zero_size() {
        let vals = vec![Value::new(0, "z", 0, 0, &[1])];
        assert!(matches!(
            Program::init(Schedule::straight_line(4), vals, &[]),
            Err(MsaError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_use_before_definition() {
        let vals = vec![Value::new(0, "v", 4, 2, &[1])];
        assert!(Program::init(Schedule::straight_line(4), vals, &[]).is_err());
    }

    #[test]
    fn nest_depth_follows_loops() {
        let p = Program::init(loop_schedule(), vec![Value::new(0, "v", 4, 0, &[7])], &[]).unwrap();
        assert_eq!(p.nest_depth(1), 0);
        assert_eq!(p.nest_depth(3), 1);
        assert_eq!(p.nest_depth(6), 0);
    }

    #[test]
    fn loop_chain_inherits_default() {
        let vals = vec![
            Value::new(0, "init", 8, 0, &[1]),
            Value::new(1, "param", 8, 2, &[3]),
            Value::new(2, "out", 8, 5, &[6])
                .with_requirement(Requirement::Default(DefaultReason::LoopPolicy)),
        ];
        let aliases = [
            Alias { from: 1, to: 2, kind: AliasKind::LoopCarried },
            Alias { from: 0, to: 1, kind: AliasKind::LoopCarried },
        ];
        let p = Program::init(loop_schedule(), vals, &aliases).unwrap();
        assert_eq!(p.groups().len(), 1);
        let bi = p.buffer_interval(0).unwrap();
        assert_eq!(bi.members, vec![0, 1, 2]);
        assert!(matches!(bi.requirement, Requirement::Default(_)));
        assert_eq!(bi.span, Interval::new(0, 7));
    }

    #[test]
    fn boundary_propagates_recursively() {
        let vals = vec![
            Value::new(0, "arg", 8, 0, &[1])
                .with_requirement(Requirement::Default(DefaultReason::Parameter)),
            Value::new(1, "branch_param", 8, 1, &[2]),
            Value::new(2, "fusion_param", 8, 2, &[3]),
        ];
        let aliases = [
            Alias { from: 0, to: 1, kind: AliasKind::Boundary },
            Alias { from: 1, to: 2, kind: AliasKind::Boundary },
        ];
        let p = Program::init(Schedule::straight_line(4), vals, &aliases).unwrap();
        assert_eq!(p.value(2).requirement, Requirement::Default(DefaultReason::Propagated(1)));
    }

    #[test]
    fn loop_group_default_crosses_boundaries() {
        let vals = vec![
            Value::new(0, "carried", 8, 0, &[1]),
            Value::new(1, "carried_out", 8, 1, &[2])
                .with_requirement(Requirement::Default(DefaultReason::LoopPolicy)),
            Value::new(2, "callee_param", 8, 2, &[3]),
            Value::new(3, "nested_param", 8, 3, &[4]),
        ];
        let aliases = [
            Alias { from: 0, to: 1, kind: AliasKind::LoopCarried },
            Alias { from: 0, to: 2, kind: AliasKind::Boundary },
            Alias { from: 2, to: 3, kind: AliasKind::Boundary },
        ];
        let p = Program::init(Schedule::straight_line(5), vals, &aliases).unwrap();
        assert!(matches!(p.buffer_interval(0).unwrap().requirement, Requirement::Default(_)));
        assert_eq!(p.value(0).requirement, Requirement::Default(DefaultReason::Propagated(1)));
        assert_eq!(p.value(2).requirement, Requirement::Default(DefaultReason::Propagated(0)));
        assert_eq!(p.value(3).requirement, Requirement::Default(DefaultReason::Propagated(2)));
    }

    #[test]
    fn group_default_meets_required_callee() {
        let vals = vec![
            Value::new(0, "carried", 8, 0, &[1]),
            Value::new(1, "carried_out", 8, 1, &[2])
                .with_requirement(Requirement::Default(DefaultReason::LoopPolicy)),
            Value::new(2, "callee_param", 8, 2, &[3]).with_requirement(Requirement::Alternate),
        ];
        let aliases = [
            Alias { from: 0, to: 1, kind: AliasKind::LoopCarried },
            Alias { from: 0, to: 2, kind: AliasKind::Boundary },
        ];
        match Program::init(Schedule::straight_line(4), vals, &aliases) {
            Err(MsaError::ConflictingRequirement { value, .. }) => assert_eq!(value, 2),
            other   => panic!("Expected a conflict, got {other:?}"),
        }
    }

    #[test]
    fn conflicting_group_rejected() {
        let vals = vec![
            Value::new(0, "a", 8, 0, &[1]).with_requirement(Requirement::Alternate),
            Value::new(1, "b", 8, 1, &[2])
                .with_requirement(Requirement::Default(DefaultReason::LoopPolicy)),
        ];
        let aliases = [Alias { from: 0, to: 1, kind: AliasKind::LoopCarried }];
        assert!(matches!(
            Program::init(Schedule::straight_line(4), vals, &aliases),
            Err(MsaError::ConflictingRequirement { .. })
        ));
    }
}
