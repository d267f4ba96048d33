//! Ordered rule collection kept in lockstep with the enforcement engine.

mod reorder;
mod rule;

pub use reorder::{is_dense, Move};
pub use rule::{Rule, RuleDefinition, RuleDraft};

use crate::error::{Error, Result};
use crate::gateway::{EnforcementGateway, Operation};
use crate::proxy::ProxyConfigRegistry;
use crate::types::{ProxyConfigId, RuleId};

/// Change published to [`RuleSet`] subscribers after a confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    Added { id: RuleId, position: u32 },
    Edited { id: RuleId },
    Deleted { id: RuleId, position: u32 },
    Moved { id: RuleId, from: u32, to: u32 },
    Toggled { id: RuleId, enabled: bool },
    /// Local order was rebuilt from the engine's order
    Reordered,
}

/// Subscriber callback.
pub type ChangeListener = Box<dyn Fn(&RuleChange) + Send + Sync>;

/// RuleSet owns the rules in evaluation order (first match wins).
///
/// Every mutation is first offered to the engine; the local list only
/// changes once the engine accepts. Positions stay a dense `1..=N` after
/// every operation.
///
/// Callers serialize access; there is no internal locking.
#[derive(Default)]
pub struct RuleSet {
    /// Sorted by position
    rules: Vec<Rule>,
    listeners: Vec<ChangeListener>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in position order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn position_of(&self, id: RuleId) -> Option<u32> {
        self.get(id).map(|r| r.position)
    }

    /// Register a change listener.
    pub fn subscribe(&mut self, listener: ChangeListener) {
        self.listeners.push(listener);
    }

    /// Validate, register with the engine and append at position `N+1`.
    ///
    /// A PROXY draft without a proxy reference uses the first registered
    /// config. A disabled draft is disabled in the engine right after it is
    /// added; if that fails the engine copy is removed again.
    pub fn add(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        registry: &ProxyConfigRegistry,
        draft: &RuleDraft,
    ) -> Result<RuleId> {
        self.append(gateway, registry, draft, None)
    }

    /// Like [`RuleSet::add`], asking the engine to keep the identifier the
    /// rule was persisted with.
    pub fn restore(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        registry: &ProxyConfigRegistry,
        persisted: RuleId,
        draft: &RuleDraft,
    ) -> Result<RuleId> {
        self.append(gateway, registry, draft, Some(persisted))
    }

    fn append(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        registry: &ProxyConfigRegistry,
        draft: &RuleDraft,
        persisted: Option<RuleId>,
    ) -> Result<RuleId> {
        let mut definition = draft.normalize()?;
        resolve_proxy(registry, &mut definition)?;

        let accepted = match persisted {
            Some(persisted) => gateway.restore_rule(persisted, &definition),
            None => gateway.add_rule(&definition),
        };
        let id = accepted.ok_or(Error::EngineRejected {
            operation: Operation::AddRule,
        })?;

        if !draft.enabled && !gateway.disable_rule(id) {
            if !gateway.delete_rule(id) {
                log::error!("Rule {} left enabled in engine after failed add", id);
            }
            return Err(Error::EngineRejected {
                operation: Operation::DisableRule,
            });
        }

        let position = self.rules.len() as u32 + 1;
        self.rules.push(Rule {
            id,
            definition,
            enabled: draft.enabled,
            position,
        });
        log::debug!("Added rule {} at position {}", id, position);
        self.notify(RuleChange::Added { id, position });
        Ok(id)
    }

    /// Redefine a rule in place, keeping its identifier, position and
    /// enabled flag. `draft.enabled` is ignored.
    pub fn edit(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        registry: &ProxyConfigRegistry,
        id: RuleId,
        draft: &RuleDraft,
    ) -> Result<()> {
        let index = self.index_of(id).ok_or(Error::NotFound { kind: "rule", id })?;
        let mut definition = draft.normalize()?;
        resolve_proxy(registry, &mut definition)?;

        if !gateway.edit_rule(id, &definition) {
            return Err(Error::EngineRejected {
                operation: Operation::EditRule,
            });
        }

        let rule = &mut self.rules[index];
        rule.definition = definition;
        if !rule.enabled && !gateway.disable_rule(id) {
            log::warn!("Rule {} could not be kept disabled after edit", id);
            rule.enabled = true;
        }
        self.notify(RuleChange::Edited { id });
        Ok(())
    }

    /// Delete a rule. Returns `false` if it was already gone.
    pub fn delete(&mut self, gateway: &mut dyn EnforcementGateway, id: RuleId) -> Result<bool> {
        let Some(index) = self.index_of(id) else {
            return Ok(false);
        };

        if !gateway.delete_rule(id) {
            return Err(Error::EngineRejected {
                operation: Operation::DeleteRule,
            });
        }

        let position = self.rules[index].position;
        reorder::remove_at(&mut self.rules, position);
        log::debug!("Deleted rule {} from position {}", id, position);
        self.notify(RuleChange::Deleted { id, position });
        Ok(true)
    }

    /// Delete several rules one by one. Rules the engine refuses to delete
    /// stay in place. Returns how many were removed.
    pub fn delete_many(&mut self, gateway: &mut dyn EnforcementGateway, ids: &[RuleId]) -> usize {
        let mut removed = 0;
        for &id in ids {
            match self.delete(gateway, id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Rule {} not deleted: {}", id, e),
            }
        }
        removed
    }

    /// Enable or disable a rule.
    ///
    /// Returns `false` when the rule no longer exists or already has the
    /// requested state.
    pub fn set_enabled(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        id: RuleId,
        enabled: bool,
    ) -> Result<bool> {
        let Some(index) = self.index_of(id) else {
            return Ok(false);
        };
        if self.rules[index].enabled == enabled {
            return Ok(false);
        }

        let (accepted, operation) = if enabled {
            (gateway.enable_rule(id), Operation::EnableRule)
        } else {
            (gateway.disable_rule(id), Operation::DisableRule)
        };
        if !accepted {
            return Err(Error::EngineRejected { operation });
        }

        self.rules[index].enabled = enabled;
        self.notify(RuleChange::Toggled { id, enabled });
        Ok(true)
    }

    pub fn enable(&mut self, gateway: &mut dyn EnforcementGateway, id: RuleId) -> Result<bool> {
        self.set_enabled(gateway, id, true)
    }

    pub fn disable(&mut self, gateway: &mut dyn EnforcementGateway, id: RuleId) -> Result<bool> {
        self.set_enabled(gateway, id, false)
    }

    /// Move a rule to `position`, shifting the rules in between.
    ///
    /// Moving a rule to its current position succeeds without an engine
    /// call and returns `false` ("not moved"); it is not a failure. After
    /// the engine confirms, engine positions are read back; if the local
    /// order no longer follows the engine's it is rebuilt from the engine's
    /// order.
    pub fn move_to_position(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        id: RuleId,
        position: u32,
    ) -> Result<bool> {
        let index = self.index_of(id).ok_or(Error::NotFound { kind: "rule", id })?;
        let from = self.rules[index].position;
        let Some(mv) = Move::plan(from, position, self.rules.len())? else {
            return Ok(false);
        };

        if !gateway.move_rule_to_position(id, position) {
            return Err(Error::EngineRejected {
                operation: Operation::MoveRule,
            });
        }

        mv.apply(&mut self.rules);
        self.notify(RuleChange::Moved {
            id,
            from,
            to: position,
        });

        if !in_engine_order(&self.rules, &*gateway) {
            log::warn!(
                "Rule order diverged from engine after moving rule {} to {}; resyncing",
                id,
                position
            );
            reorder::reconcile(&mut self.rules, |rule| gateway.rule_position(rule));
            self.notify(RuleChange::Reordered);
        }
        Ok(true)
    }

    /// Number of PROXY rules routed through `config_id`.
    pub fn count_referencing(&self, config_id: ProxyConfigId) -> usize {
        self.rules
            .iter()
            .filter(|r| r.definition.references(config_id))
            .count()
    }

    /// Delete every PROXY rule routed through `config_id` via the per-rule
    /// delete path. Stops at the first engine refusal.
    pub fn delete_rules_referencing(
        &mut self,
        gateway: &mut dyn EnforcementGateway,
        config_id: ProxyConfigId,
    ) -> Result<usize> {
        let ids: Vec<RuleId> = self
            .rules
            .iter()
            .filter(|r| r.definition.references(config_id))
            .map(|r| r.id)
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.delete(gateway, id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn index_of(&self, id: RuleId) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    fn notify(&self, change: RuleChange) {
        for listener in &self.listeners {
            listener(&change);
        }
    }
}

/// Whether every pair of neighbouring rules the engine knows is in
/// ascending engine position.
fn in_engine_order(rules: &[Rule], gateway: &dyn EnforcementGateway) -> bool {
    rules.windows(2).all(|pair| {
        match (gateway.rule_position(pair[0].id), gateway.rule_position(pair[1].id)) {
            (Some(a), Some(b)) => a < b,
            _ => true,
        }
    })
}

fn resolve_proxy(registry: &ProxyConfigRegistry, definition: &mut RuleDefinition) -> Result<()> {
    if !definition.action.uses_proxy() {
        definition.proxy_config_id = 0;
        return Ok(());
    }
    if definition.proxy_config_id == 0 {
        definition.proxy_config_id = registry.first().ok_or(Error::MissingProxyConfig)?.id;
    } else if !registry.contains(definition.proxy_config_id) {
        return Err(Error::UnknownProxyConfig(definition.proxy_config_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, MemoryGateway};
    use crate::proxy::ProxyConfig;
    use crate::types::{Protocol, ProxyType, RuleAction};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Fixture {
        gw: MemoryGateway,
        registry: ProxyConfigRegistry,
        rules: RuleSet,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                gw: MemoryGateway::new(),
                registry: ProxyConfigRegistry::new(),
                rules: RuleSet::new(),
            }
        }

        fn proxy(&mut self, port: u16) -> ProxyConfigId {
            self.registry
                .add(
                    Some(&mut self.gw),
                    ProxyConfig::new(ProxyType::Socks5, "127.0.0.1", port),
                )
                .unwrap()
        }

        fn add(&mut self, process: &str, action: RuleAction) -> RuleId {
            let draft = RuleDraft::new(process, "*", "*", Protocol::Tcp, action);
            self.rules.add(&mut self.gw, &self.registry, &draft).unwrap()
        }

        fn add_via(&mut self, process: &str, config: ProxyConfigId) -> RuleId {
            let draft = RuleDraft::new(process, "*", "*", Protocol::Tcp, RuleAction::Proxy)
                .with_proxy_config(config);
            self.rules.add(&mut self.gw, &self.registry, &draft).unwrap()
        }

        fn ids(&self) -> Vec<RuleId> {
            self.rules.rules().iter().map(|r| r.id).collect()
        }
    }

    #[test]
    fn test_add_appends() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Block);
        assert_eq!(f.rules.position_of(a), Some(1));
        assert_eq!(f.rules.position_of(b), Some(2));
        assert_eq!(f.rules.get(a).unwrap().definition.process_pattern, "a.exe");
        assert!(is_dense(f.rules.rules()));
    }

    #[test]
    fn test_add_proxy_defaults_to_first_config() {
        let mut f = Fixture::new();
        let first = f.proxy(1080);
        f.proxy(1081);
        let id = f.add("a", RuleAction::Proxy);
        assert_eq!(f.rules.get(id).unwrap().definition.proxy_config_id, first);
    }

    #[test]
    fn test_add_proxy_without_configs_fails() {
        let mut f = Fixture::new();
        let draft = RuleDraft::new("a", "*", "*", Protocol::Tcp, RuleAction::Proxy);
        let err = f.rules.add(&mut f.gw, &f.registry, &draft).unwrap_err();
        assert!(matches!(err, Error::MissingProxyConfig));

        let draft = draft.with_proxy_config(77);
        f.proxy(1080);
        let err = f.rules.add(&mut f.gw, &f.registry, &draft).unwrap_err();
        assert!(matches!(err, Error::UnknownProxyConfig(77)));
        assert!(f.rules.is_empty());
        assert!(f.gw.rule_ids().is_empty());
    }

    #[test]
    fn test_restore_keeps_persisted_id() {
        let mut f = Fixture::new();
        let draft = RuleDraft::new("c", "*", "*", Protocol::Tcp, RuleAction::Direct);
        assert_eq!(f.rules.restore(&mut f.gw, &f.registry, 3, &draft).unwrap(), 3);
        let next = f.add("d", RuleAction::Block);
        assert_eq!(next, 4);
        assert_eq!(f.ids(), vec![3, 4]);
        assert_eq!(f.rules.position_of(3), Some(1));
    }

    #[test]
    fn test_add_rejected_by_engine() {
        let mut f = Fixture::new();
        f.gw.reject(Operation::AddRule);
        let draft = RuleDraft::new("a", "*", "*", Protocol::Tcp, RuleAction::Direct);
        assert!(f.rules.add(&mut f.gw, &f.registry, &draft).is_err());
        assert!(f.rules.is_empty());
    }

    #[test]
    fn test_validation_error_never_reaches_engine() {
        let mut f = Fixture::new();
        let draft = RuleDraft::new("a", "*", "99999", Protocol::Tcp, RuleAction::Direct);
        assert!(f.rules.add(&mut f.gw, &f.registry, &draft).is_err());
        assert!(f.gw.calls().is_empty());
    }

    #[test]
    fn test_add_disabled() {
        let mut f = Fixture::new();
        let draft =
            RuleDraft::new("a", "*", "*", Protocol::Tcp, RuleAction::Direct).with_enabled(false);
        let id = f.rules.add(&mut f.gw, &f.registry, &draft).unwrap();
        assert!(!f.rules.get(id).unwrap().enabled);
        assert_eq!(f.gw.is_rule_enabled(id), Some(false));

        f.gw.reject(Operation::DisableRule);
        assert!(f.rules.add(&mut f.gw, &f.registry, &draft).is_err());
        assert_eq!(f.rules.len(), 1);
        assert_eq!(f.gw.rule_ids(), vec![id]);
    }

    #[test]
    fn test_edit_preserves_id_and_position() {
        let mut f = Fixture::new();
        let pc = f.proxy(1080);
        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Direct);
        f.add("c", RuleAction::Direct);

        let draft = RuleDraft::new("browser", "example.com", "443", Protocol::Both, RuleAction::Proxy);
        f.rules.edit(&mut f.gw, &f.registry, b, &draft).unwrap();

        let rule = f.rules.get(b).unwrap();
        assert_eq!(rule.position, 2);
        assert_eq!(rule.definition.process_pattern, "browser.exe");
        assert_eq!(rule.definition.proxy_config_id, pc);
        assert_eq!(f.gw.rule(b).unwrap(), &rule.definition);
        assert_eq!(f.rules.position_of(a), Some(1));
    }

    #[test]
    fn test_edit_keeps_disabled_rule_disabled() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        f.rules.disable(&mut f.gw, a).unwrap();
        let draft = RuleDraft::new("z", "*", "*", Protocol::Tcp, RuleAction::Block);
        f.rules.edit(&mut f.gw, &f.registry, a, &draft).unwrap();
        assert!(!f.rules.get(a).unwrap().enabled);
        assert_eq!(f.gw.is_rule_enabled(a), Some(false));
    }

    #[test]
    fn test_edit_rejected_keeps_old_definition() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        f.gw.reject(Operation::EditRule);
        let draft = RuleDraft::new("z", "*", "*", Protocol::Tcp, RuleAction::Block);
        assert!(f.rules.edit(&mut f.gw, &f.registry, a, &draft).is_err());
        assert_eq!(f.rules.get(a).unwrap().definition.process_pattern, "a.exe");
        assert!(matches!(
            f.rules.edit(&mut f.gw, &f.registry, 999, &draft),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_shifts_later_rules() {
        let mut f = Fixture::new();
        let ids: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|p| f.add(p, RuleAction::Direct))
            .collect();

        assert!(f.rules.delete(&mut f.gw, ids[1]).unwrap());
        assert_eq!(f.rules.position_of(ids[0]), Some(1));
        assert_eq!(f.rules.position_of(ids[2]), Some(2));
        assert_eq!(f.rules.position_of(ids[3]), Some(3));
        assert!(!f.rules.delete(&mut f.gw, ids[1]).unwrap());
    }

    #[test]
    fn test_delete_fail_closed() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        f.gw.reject(Operation::DeleteRule);
        assert!(matches!(
            f.rules.delete(&mut f.gw, a),
            Err(Error::EngineRejected {
                operation: Operation::DeleteRule
            })
        ));
        let rule = f.rules.get(a).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.position, 1);
    }

    #[test]
    fn test_delete_many_skips_refused() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Direct);
        assert_eq!(f.rules.delete_many(&mut f.gw, &[a, 999, b]), 2);
        assert!(f.rules.is_empty());
    }

    #[test]
    fn test_toggle() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        assert!(f.rules.disable(&mut f.gw, a).unwrap());
        assert!(!f.rules.disable(&mut f.gw, a).unwrap());
        assert!(f.rules.enable(&mut f.gw, a).unwrap());
        assert!(!f.rules.enable(&mut f.gw, 12345).unwrap());

        f.gw.reject(Operation::DisableRule);
        assert!(f.rules.disable(&mut f.gw, a).is_err());
        assert!(f.rules.get(a).unwrap().enabled);
    }

    #[test]
    fn test_move_shifts_between() {
        let mut f = Fixture::new();
        let ids: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|p| f.add(p, RuleAction::Direct))
            .collect();

        assert!(f.rules.move_to_position(&mut f.gw, ids[3], 2).unwrap());
        assert_eq!(f.ids(), vec![ids[0], ids[3], ids[1], ids[2]]);
        assert_eq!(f.ids(), f.gw.rule_ids());
        assert!(is_dense(f.rules.rules()));
    }

    #[test]
    fn test_move_to_same_position_is_noop() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        f.add("b", RuleAction::Direct);
        f.gw.clear_calls();

        assert!(!f.rules.move_to_position(&mut f.gw, a, 1).unwrap());
        assert!(f.gw.calls().is_empty());
        assert_eq!(f.rules.position_of(a), Some(1));
    }

    #[test]
    fn test_move_out_of_range_and_rejected() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Direct);
        assert!(matches!(
            f.rules.move_to_position(&mut f.gw, a, 3),
            Err(Error::PositionOutOfRange { .. })
        ));
        assert!(f.rules.move_to_position(&mut f.gw, a, 0).is_err());

        f.gw.reject(Operation::MoveRule);
        assert!(f.rules.move_to_position(&mut f.gw, b, 1).is_err());
        assert_eq!(f.ids(), vec![a, b]);
    }

    #[test]
    fn test_move_resyncs_when_engine_differs() {
        let mut f = Fixture::new();
        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Direct);
        let c = f.add("c", RuleAction::Direct);

        // engine gains a rule of its own at the front
        let def = f.rules.get(a).unwrap().definition.clone();
        f.gw.insert_foreign_rule(def, 1);

        assert!(f.rules.move_to_position(&mut f.gw, c, 2).unwrap());
        // engine: [foreign, c, a, b]
        assert_eq!(f.ids(), vec![c, a, b]);
        assert!(is_dense(f.rules.rules()));
    }

    #[test]
    fn test_cascade_delete() {
        let mut f = Fixture::new();
        let keep_pc = f.proxy(1080);
        let gone_pc = f.proxy(1081);
        let r1 = f.add_via("a", gone_pc);
        let r2 = f.add("b", RuleAction::Direct);
        let r3 = f.add_via("c", gone_pc);
        let r4 = f.add_via("d", keep_pc);
        let r5 = f.add_via("e", gone_pc);

        assert_eq!(f.rules.count_referencing(gone_pc), 3);
        assert_eq!(f.rules.delete_rules_referencing(&mut f.gw, gone_pc).unwrap(), 3);
        assert_eq!(f.ids(), vec![r2, r4]);
        assert!(is_dense(f.rules.rules()));
        for id in [r1, r3, r5] {
            assert!(f.gw.calls().contains(&GatewayCall::DeleteRule(id)));
        }
    }

    #[test]
    fn test_subscribers_see_changes() {
        let mut f = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.rules
            .subscribe(Box::new(move |change: &RuleChange| sink.lock().push(change.clone())));

        let a = f.add("a", RuleAction::Direct);
        let b = f.add("b", RuleAction::Direct);
        f.rules.move_to_position(&mut f.gw, b, 1).unwrap();
        f.rules.disable(&mut f.gw, a).unwrap();
        f.rules.delete(&mut f.gw, a).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                RuleChange::Added { id: a, position: 1 },
                RuleChange::Added { id: b, position: 2 },
                RuleChange::Moved { id: b, from: 2, to: 1 },
                RuleChange::Toggled { id: a, enabled: false },
                RuleChange::Deleted { id: a, position: 2 },
            ]
        );
    }
}
