use crate::helpe::*;

/// What decides the order when no override applies.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum BaseOrder {
    /// Groups saving the most compute per byte go first.
    #[default]
    MemoryBoundedness,
    /// Bigger groups go first.
    Size,
}

/// Selects buffer intervals by properties of their members. Unset
/// fields match anything; a group matches if any of its members
/// matches every set field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideMatcher {
    /// Prefix of the defining instruction's name.
    pub instruction_prefix: Option<String>,
    /// Some use reads the value through this operand position.
    pub operand:            Option<usize>,
    /// The definition falls within this window.
    pub position:           Option<Interval>,
    /// Inclusive size bounds.
    pub size:               Option<(ByteSteps, ByteSteps)>,
}

impl OverrideMatcher {
    fn matches_value(&self, program: &Program, v: &Value) -> bool {
        let name_ok = self.instruction_prefix
            .as_ref()
            .is_none_or(|p| {
                program.instruction(v.definition)
                    .is_some_and(|i| i.name.starts_with(p.as_str()))
            });
        let operand_ok = self.operand
            .is_none_or(|o| v.uses.iter().any(|u| u.operand == o));
        let position_ok = self.position
            .is_none_or(|w| w.contains(v.definition));
        let size_ok = self.size
            .is_none_or(|(lo, hi)| lo <= v.size && v.size <= hi);

        name_ok && operand_ok && position_ok && size_ok
    }

    pub fn matches(&self, program: &Program, bi: &BufferInterval) -> bool {
        bi.members
            .iter()
            .any(|id| self.matches_value(program, program.value(*id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverridePolicy {
    ForceFirst,
    ForceLast,
    /// Scales the base key; above 1.0 means earlier.
    Eagerness(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorityOverride {
    pub matcher:    OverrideMatcher,
    pub policy:     OverridePolicy,
}

/// Everything an ordering decision looks at, computed once per
/// buffer interval.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SortKey {
    /// 0: required in alternate memory, 1: forced first, 2: regular,
    /// 3: forced last.
    class:  u8,
    /// Position of the override that forced the class.
    rank:   usize,
    base:   f64,
    size:   ByteSteps,
    span:   Time,
    group:  GroupId,
}

impl SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class.cmp(&other.class)
            .then(self.rank.cmp(&other.rank))
            .then(other.base.total_cmp(&self.base))
            .then(other.size.cmp(&self.size))
            .then(other.span.cmp(&self.span))
            .then(self.group.cmp(&other.group))
    }
}

/// A total order over buffer intervals. Overrides are consulted in
/// list order and the first match wins. Ties are broken by size, then
/// span, then group ID, never by where things sit in memory.
pub struct BufferIntervalComparator<'a> {
    cost:       &'a CostAnalysis<'a>,
    base:       BaseOrder,
    overrides:  &'a [PriorityOverride],
}

impl<'a> BufferIntervalComparator<'a> {
    pub fn new(
        cost:       &'a CostAnalysis<'a>,
        base:       BaseOrder,
        overrides:  &'a [PriorityOverride],
    ) -> Self {
        Self {
            cost,
            base,
            overrides,
        }
    }

    fn key(&self, bi: &BufferInterval) -> SortKey {
        let program = self.cost.program();
        let mut base = match self.base {
            BaseOrder::MemoryBoundedness    => self.cost.memory_boundedness(bi),
            BaseOrder::Size                 => bi.size as f64,
        };
        let (mut class, mut rank) = (2, 0);
        if matches!(bi.requirement, Requirement::Alternate) {
            class = 0;
        } else if let Some((idx, o)) = self.overrides
            .iter()
            .enumerate()
            .find(|(_, o)| o.matcher.matches(program, bi)) {
            match o.policy {
                OverridePolicy::ForceFirst      => { class = 1; rank = idx; },
                OverridePolicy::ForceLast       => { class = 3; rank = idx; },
                OverridePolicy::Eagerness(w)    => { base *= w; },
            }
        }

        SortKey {
            class,
            rank,
            base,
            size:   bi.size,
            span:   bi.span.len(),
            group:  bi.group,
        }
    }

    #[inline(always)]
    pub fn compare(&self, a: &BufferInterval, b: &BufferInterval) -> Ordering {
        self.key(a).cmp(&self.key(b))
    }

    /// Returns the buffer intervals in processing order.
    pub fn sort(&self, intervals: Vec<BufferInterval>) -> Vec<BufferInterval> {
        intervals.into_iter()
            .map(|bi| (self.key(&bi), bi))
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, bi)| bi)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        let mut s = Schedule::new();
        let entry = s.add_computation("entry", ComputationKind::Entry, None);
        s.push("param.0", entry);
        s.push("dot.1", entry);
        s.push("add.2", entry);
        s.push("dot.3", entry);
        s.push_n(entry, 4);
        let mut vals = vec![
            Value::new(0, "p", 16, 0, &[5]),
            Value::new(1, "d1", 64, 1, &[2]),
            Value::new(2, "a", 32, 2, &[7]),
            Value::new(3, "d3", 64, 3, &[4]),
        ];
        vals[2].uses[0].operand = 1;
        Program::init(s, vals, &[]).unwrap()
    }

    fn order(cmp: &BufferIntervalComparator, p: &Program) -> Vec<GroupId> {
        cmp.sort(p.buffer_intervals())
            .iter()
            .map(|bi| bi.group)
            .collect()
    }

    #[test]
    fn size_order_breaks_ties_by_span() {
        let p = program();
        let oracle = TableOracle::uniform(8, 1.0, 1.0);
        let cost = CostAnalysis::new(&oracle, &p);
        let cmp = BufferIntervalComparator::new(&cost, BaseOrder::Size, &[]);
        // 1 and 3 are both 64 bytes and live for 2 steps; group ID decides.
        assert_eq!(order(&cmp, &p), vec![1, 3, 2, 0]);
    }

    #[test]
    fn first_matching_override_wins() {
        let p = program();
        let oracle = TableOracle::uniform(8, 1.0, 1.0);
        let cost = CostAnalysis::new(&oracle, &p);
        let overrides = vec![
            PriorityOverride {
                matcher:    OverrideMatcher { operand: Some(1), ..Default::default() },
                policy:     OverridePolicy::ForceFirst,
            },
            PriorityOverride {
                matcher:    OverrideMatcher { instruction_prefix: Some(String::from("dot")), ..Default::default() },
                policy:     OverridePolicy::ForceLast,
            },
            PriorityOverride {
                matcher:    OverrideMatcher { instruction_prefix: Some(String::from("dot")), ..Default::default() },
                policy:     OverridePolicy::ForceFirst,
            },
        ];
        let cmp = BufferIntervalComparator::new(&cost, BaseOrder::Size, &overrides);
        assert_eq!(order(&cmp, &p), vec![2, 0, 1, 3]);
    }

    #[test]
    fn eagerness_scales_base_key() {
        let p = program();
        let oracle = TableOracle::uniform(8, 1.0, 1.0);
        let cost = CostAnalysis::new(&oracle, &p);
        let overrides = vec![PriorityOverride {
            matcher:    OverrideMatcher { size: Some((16, 16)), ..Default::default() },
            policy:     OverridePolicy::Eagerness(10.0),
        }];
        let cmp = BufferIntervalComparator::new(&cost, BaseOrder::Size, &overrides);
        assert_eq!(order(&cmp, &p)[0], 0);
    }

    #[test]
    fn required_alternate_beats_everything() {
        let p = program();
        let vals: Vec<Value> = p.values()
            .iter()
            .cloned()
            .map(|v| if v.id == 0 { v.with_requirement(Requirement::Alternate) } else { v })
            .collect();
        let p = Program::init(p.schedule().clone(), vals, &[]).unwrap();
        let oracle = TableOracle::uniform(8, 1.0, 1.0);
        let cost = CostAnalysis::new(&oracle, &p);
        let overrides = vec![PriorityOverride {
            matcher:    OverrideMatcher { instruction_prefix: Some(String::from("dot")), ..Default::default() },
            policy:     OverridePolicy::ForceFirst,
        }];
        let cmp = BufferIntervalComparator::new(&cost, BaseOrder::Size, &overrides);
        assert_eq!(order(&cmp, &p), vec![0, 1, 3, 2]);
    }

    #[test]
    fn sorting_is_repeatable() {
        let p = program();
        let oracle = TableOracle::uniform(8, 1.0, 4.0);
        let cost = CostAnalysis::new(&oracle, &p);
        let cmp = BufferIntervalComparator::new(&cost, BaseOrder::MemoryBoundedness, &[]);
        let first = order(&cmp, &p);
        let reversed: Vec<BufferInterval> = p.buffer_intervals().into_iter().rev().collect();
        let second: Vec<GroupId> = cmp.sort(reversed).iter().map(|bi| bi.group).collect();
        assert_eq!(first, second);
    }
}
