//! Position bookkeeping for the ordered rule list.
//!
//! Positions are 1-based and always form a permutation of `1..=N`. A move
//! takes one rule from `from` to `to` and shifts every rule strictly between
//! the two by one slot toward the vacated position; all other rules keep
//! their relative order.

use std::ops::RangeInclusive;

use super::Rule;
use crate::error::{Error, Result};
use crate::types::RuleId;

/// A planned single-element move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: u32,
    pub to: u32,
}

impl Move {
    /// Plan a move in a list of `len` rules.
    ///
    /// Returns `Ok(None)` when `to == from` (nothing to do) and an error when
    /// `to` is outside `1..=len`.
    pub fn plan(from: u32, to: u32, len: usize) -> Result<Option<Move>> {
        if to == 0 || to as usize > len {
            return Err(Error::PositionOutOfRange { position: to, len });
        }
        if to == from {
            return Ok(None);
        }
        Ok(Some(Move { from, to }))
    }

    /// Positions whose occupant changes.
    pub fn affected(&self) -> RangeInclusive<u32> {
        self.from.min(self.to)..=self.from.max(self.to)
    }

    /// Apply to a list kept sorted by position.
    pub fn apply(&self, rules: &mut Vec<Rule>) {
        let rule = rules.remove(self.from as usize - 1);
        rules.insert(self.to as usize - 1, rule);
        for position in self.affected() {
            rules[position as usize - 1].position = position;
        }
    }
}

/// Remove the rule at `position` and pull every later rule up by one.
pub fn remove_at(rules: &mut Vec<Rule>, position: u32) -> Rule {
    let removed = rules.remove(position as usize - 1);
    for rule in rules.iter_mut().skip(position as usize - 1) {
        rule.position -= 1;
    }
    removed
}

/// Rebuild local order from positions reported by the engine.
///
/// Rules the engine does not know keep their relative order after all known
/// rules. Positions are renumbered densely afterwards.
pub fn reconcile<F>(rules: &mut [Rule], engine_position: F)
where
    F: Fn(RuleId) -> Option<u32>,
{
    rules.sort_by_key(|r| (engine_position(r.id).unwrap_or(u32::MAX), r.position));
    renumber(rules);
}

/// Assign positions `1..=N` in list order.
pub fn renumber(rules: &mut [Rule]) {
    for (index, rule) in rules.iter_mut().enumerate() {
        rule.position = index as u32 + 1;
    }
}

/// Whether positions are exactly `1..=N` in list order.
pub fn is_dense(rules: &[Rule]) -> bool {
    rules
        .iter()
        .enumerate()
        .all(|(index, rule)| rule.position == index as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::RuleDefinition;
    use crate::types::{Protocol, RuleAction};

    fn rules(n: u32) -> Vec<Rule> {
        (1..=n)
            .map(|i| Rule {
                id: i * 10,
                definition: RuleDefinition {
                    process_pattern: format!("p{}.exe", i),
                    host_pattern: "*".into(),
                    port_pattern: "*".into(),
                    protocol: Protocol::Tcp,
                    action: RuleAction::Direct,
                    proxy_config_id: 0,
                },
                enabled: true,
                position: i,
            })
            .collect()
    }

    fn ids(rules: &[Rule]) -> Vec<u32> {
        rules.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_plan_bounds() {
        assert!(matches!(
            Move::plan(1, 0, 3),
            Err(Error::PositionOutOfRange { position: 0, len: 3 })
        ));
        assert!(Move::plan(1, 4, 3).is_err());
        assert_eq!(Move::plan(2, 2, 3).unwrap(), None);
        assert_eq!(Move::plan(1, 3, 3).unwrap(), Some(Move { from: 1, to: 3 }));
    }

    #[test]
    fn test_move_down() {
        let mut list = rules(5);
        Move { from: 2, to: 4 }.apply(&mut list);
        assert_eq!(ids(&list), vec![10, 30, 40, 20, 50]);
        assert!(is_dense(&list));
    }

    #[test]
    fn test_move_up() {
        let mut list = rules(5);
        Move { from: 5, to: 1 }.apply(&mut list);
        assert_eq!(ids(&list), vec![50, 10, 20, 30, 40]);
        assert!(is_dense(&list));
    }

    #[test]
    fn test_remove_closes_gap() {
        let mut list = rules(4);
        let removed = remove_at(&mut list, 2);
        assert_eq!(removed.id, 20);
        assert_eq!(ids(&list), vec![10, 30, 40]);
        assert_eq!(list.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reconcile_uses_engine_order() {
        let mut list = rules(3);
        let engine = [30, 10];
        reconcile(&mut list, |id| {
            engine.iter().position(|&e| e == id).map(|i| i as u32 + 1)
        });
        assert_eq!(ids(&list), vec![30, 10, 20]);
        assert!(is_dense(&list));
    }
}
