//! Boundary to the enforcement engine.
//!
//! The engine intercepts connections and evaluates rules; this crate only
//! keeps it synchronized with the authored policy. Every call is synchronous
//! and reports plain success or failure. The engine holds no durable state,
//! so after a restart everything is replayed from the persisted snapshot.

use ahash::{AHashMap, AHashSet};
use std::fmt;

use crate::events::{ConnectionEvent, EngineEvent, EventSink};
use crate::proxy::ProxyConfig;
use crate::ruleset::RuleDefinition;
use crate::types::{ProxyConfigId, RuleId};

/// Operations that the engine may refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AddProxyConfig,
    EditProxyConfig,
    DeleteProxyConfig,
    AddRule,
    EditRule,
    DeleteRule,
    EnableRule,
    DisableRule,
    MoveRule,
    TestProxyConfig,
    Start,
    Stop,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::AddProxyConfig => "add proxy config",
            Operation::EditProxyConfig => "edit proxy config",
            Operation::DeleteProxyConfig => "delete proxy config",
            Operation::AddRule => "add rule",
            Operation::EditRule => "edit rule",
            Operation::DeleteRule => "delete rule",
            Operation::EnableRule => "enable rule",
            Operation::DisableRule => "disable rule",
            Operation::MoveRule => "move rule",
            Operation::TestProxyConfig => "test proxy config",
            Operation::Start => "start",
            Operation::Stop => "stop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability set consumed from the enforcement engine.
pub trait EnforcementGateway {
    /// Returns the engine-assigned identifier, or `None` if refused.
    fn add_proxy_config(&mut self, config: &ProxyConfig) -> Option<ProxyConfigId>;
    fn edit_proxy_config(&mut self, id: ProxyConfigId, config: &ProxyConfig) -> bool;
    fn delete_proxy_config(&mut self, id: ProxyConfigId) -> bool;

    /// Register a config during startup replay, preferably under the
    /// identifier it was persisted with. Engines that always assign fresh
    /// identifiers keep the default.
    fn restore_proxy_config(
        &mut self,
        _persisted: ProxyConfigId,
        config: &ProxyConfig,
    ) -> Option<ProxyConfigId> {
        self.add_proxy_config(config)
    }

    /// Connect to `target_host:target_port` through config `id` and return
    /// the engine's report, or `None` if the test could not be run.
    fn test_proxy_config(
        &mut self,
        id: ProxyConfigId,
        target_host: &str,
        target_port: u16,
    ) -> Option<String>;

    /// Returns the engine-assigned identifier, or `None` if refused.
    fn add_rule(&mut self, rule: &RuleDefinition) -> Option<RuleId>;

    /// Register a rule during startup replay, preferably under the
    /// identifier it was persisted with.
    fn restore_rule(&mut self, _persisted: RuleId, rule: &RuleDefinition) -> Option<RuleId> {
        self.add_rule(rule)
    }
    /// Full redefinition under the same identifier.
    fn edit_rule(&mut self, id: RuleId, rule: &RuleDefinition) -> bool;
    fn delete_rule(&mut self, id: RuleId) -> bool;
    fn enable_rule(&mut self, id: RuleId) -> bool;
    fn disable_rule(&mut self, id: RuleId) -> bool;

    /// 1-based position of a rule in the engine's list.
    fn rule_position(&self, id: RuleId) -> Option<u32>;
    fn move_rule_to_position(&mut self, id: RuleId, position: u32) -> bool;

    fn set_dns_via_proxy(&mut self, enable: bool);
    fn set_localhost_via_proxy(&mut self, enable: bool);
    fn set_traffic_logging_enabled(&mut self, enable: bool);
    /// Forget the connection history the engine keeps.
    fn clear_connection_logs(&mut self);

    /// Install the callback that receives diagnostic and connection events.
    fn set_event_sink(&mut self, sink: EventSink);

    fn start(&mut self) -> bool;
    fn stop(&mut self) -> bool;
}

/// A recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    AddProxyConfig(ProxyConfigId),
    EditProxyConfig(ProxyConfigId),
    DeleteProxyConfig(ProxyConfigId),
    TestProxyConfig(ProxyConfigId),
    AddRule(RuleId),
    EditRule(RuleId),
    DeleteRule(RuleId),
    EnableRule(RuleId),
    DisableRule(RuleId),
    MoveRule { id: RuleId, position: u32 },
    SetDnsViaProxy(bool),
    SetLocalhostViaProxy(bool),
    SetTrafficLogging(bool),
    ClearConnectionLogs,
    Start,
    Stop,
}

#[derive(Debug, Clone)]
struct EngineRule {
    id: RuleId,
    definition: RuleDefinition,
    enabled: bool,
}

/// In-memory engine that keeps the same state a real engine would.
///
/// Used as an engine stand-in for offline policy editing and as a test
/// double: it records every call and can be told to refuse operations.
#[derive(Default)]
pub struct MemoryGateway {
    configs: AHashMap<ProxyConfigId, ProxyConfig>,
    rules: Vec<EngineRule>,
    next_config_id: ProxyConfigId,
    next_rule_id: RuleId,
    rejected: AHashSet<Operation>,
    calls: Vec<GatewayCall>,
    dns_via_proxy: bool,
    localhost_via_proxy: bool,
    traffic_logging: bool,
    running: bool,
    sink: Option<EventSink>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            next_config_id: 1,
            next_rule_id: 1,
            ..Default::default()
        }
    }

    /// Refuse every future call of `op`.
    pub fn reject(&mut self, op: Operation) {
        self.rejected.insert(op);
    }

    /// Accept `op` again.
    pub fn accept(&mut self, op: Operation) {
        self.rejected.remove(&op);
    }

    /// Calls that were accepted, in order.
    pub fn calls(&self) -> &[GatewayCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Rule identifiers in engine evaluation order.
    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(|r| r.id).collect()
    }

    pub fn rule(&self, id: RuleId) -> Option<&RuleDefinition> {
        self.rules.iter().find(|r| r.id == id).map(|r| &r.definition)
    }

    pub fn is_rule_enabled(&self, id: RuleId) -> Option<bool> {
        self.rules.iter().find(|r| r.id == id).map(|r| r.enabled)
    }

    pub fn proxy_config(&self, id: ProxyConfigId) -> Option<&ProxyConfig> {
        self.configs.get(&id)
    }

    /// Insert a rule straight into the engine at `position`, bypassing any
    /// local rule set. Simulates engine-side changes.
    pub fn insert_foreign_rule(&mut self, definition: RuleDefinition, position: u32) -> RuleId {
        let id = self.fresh_rule_id();
        self.next_rule_id = id.saturating_add(1);
        let index = (position.max(1) as usize - 1).min(self.rules.len());
        self.rules.insert(
            index,
            EngineRule {
                id,
                definition,
                enabled: true,
            },
        );
        id
    }

    pub fn dns_via_proxy(&self) -> bool {
        self.dns_via_proxy
    }

    pub fn localhost_via_proxy(&self) -> bool {
        self.localhost_via_proxy
    }

    pub fn traffic_logging(&self) -> bool {
        self.traffic_logging
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Deliver an event to the installed sink, as the engine would.
    pub fn emit(&self, event: EngineEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Convenience for emitting a connection event.
    pub fn emit_connection(&self, event: ConnectionEvent) {
        if self.traffic_logging {
            self.emit(EngineEvent::Connection(event));
        }
    }

    fn allowed(&self, op: Operation) -> bool {
        !self.rejected.contains(&op)
    }

    fn rule_index(&self, id: RuleId) -> Option<usize> {
        self.rules.iter().position(|r| r.id == id)
    }

    fn proxy_reference_ok(&self, rule: &RuleDefinition) -> bool {
        !rule.action.uses_proxy()
            || rule.proxy_config_id == 0
            || self.configs.contains_key(&rule.proxy_config_id)
    }

    fn insert_config(&mut self, id: ProxyConfigId, config: &ProxyConfig) -> ProxyConfigId {
        let mut stored = config.clone();
        stored.id = id;
        self.configs.insert(id, stored);
        self.next_config_id = self.next_config_id.max(id.saturating_add(1));
        self.calls.push(GatewayCall::AddProxyConfig(id));
        id
    }

    fn push_rule(&mut self, id: RuleId, rule: &RuleDefinition) -> RuleId {
        self.rules.push(EngineRule {
            id,
            definition: rule.clone(),
            enabled: true,
        });
        self.next_rule_id = self.next_rule_id.max(id.saturating_add(1));
        self.calls.push(GatewayCall::AddRule(id));
        id
    }

    fn fresh_config_id(&self) -> ProxyConfigId {
        let mut id = self.next_config_id.max(1);
        while self.configs.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        id
    }

    fn fresh_rule_id(&self) -> RuleId {
        let mut id = self.next_rule_id.max(1);
        while self.rule_index(id).is_some() {
            id = id.wrapping_add(1).max(1);
        }
        id
    }

    fn set_enabled(&mut self, op: Operation, id: RuleId, enabled: bool) -> bool {
        if !self.allowed(op) {
            return false;
        }
        let Some(index) = self.rule_index(id) else {
            return false;
        };
        self.rules[index].enabled = enabled;
        self.calls.push(if enabled {
            GatewayCall::EnableRule(id)
        } else {
            GatewayCall::DisableRule(id)
        });
        true
    }
}

impl EnforcementGateway for MemoryGateway {
    fn add_proxy_config(&mut self, config: &ProxyConfig) -> Option<ProxyConfigId> {
        if !self.allowed(Operation::AddProxyConfig) {
            return None;
        }
        let id = self.fresh_config_id();
        Some(self.insert_config(id, config))
    }

    /// Keeps the persisted identifier when it is free.
    fn restore_proxy_config(
        &mut self,
        persisted: ProxyConfigId,
        config: &ProxyConfig,
    ) -> Option<ProxyConfigId> {
        if persisted == 0 || self.configs.contains_key(&persisted) {
            return self.add_proxy_config(config);
        }
        if !self.allowed(Operation::AddProxyConfig) {
            return None;
        }
        Some(self.insert_config(persisted, config))
    }

    /// Reports the route without opening a connection.
    fn test_proxy_config(
        &mut self,
        id: ProxyConfigId,
        target_host: &str,
        target_port: u16,
    ) -> Option<String> {
        if !self.allowed(Operation::TestProxyConfig) {
            return None;
        }
        let config = self.configs.get(&id)?;
        let report = format!(
            "Testing {} -> {}:{}\nin-memory engine: route accepted, no connection made",
            config.display_name(),
            target_host,
            target_port
        );
        self.calls.push(GatewayCall::TestProxyConfig(id));
        Some(report)
    }

    fn edit_proxy_config(&mut self, id: ProxyConfigId, config: &ProxyConfig) -> bool {
        if !self.allowed(Operation::EditProxyConfig) {
            return false;
        }
        match self.configs.get_mut(&id) {
            Some(existing) => {
                *existing = ProxyConfig {
                    id,
                    ..config.clone()
                };
                self.calls.push(GatewayCall::EditProxyConfig(id));
                true
            }
            None => false,
        }
    }

    fn delete_proxy_config(&mut self, id: ProxyConfigId) -> bool {
        if !self.allowed(Operation::DeleteProxyConfig) || self.configs.remove(&id).is_none() {
            return false;
        }
        self.calls.push(GatewayCall::DeleteProxyConfig(id));
        true
    }

    fn add_rule(&mut self, rule: &RuleDefinition) -> Option<RuleId> {
        if !self.allowed(Operation::AddRule) || !self.proxy_reference_ok(rule) {
            return None;
        }
        let id = self.fresh_rule_id();
        Some(self.push_rule(id, rule))
    }

    /// Keeps the persisted identifier when it is free.
    fn restore_rule(&mut self, persisted: RuleId, rule: &RuleDefinition) -> Option<RuleId> {
        if persisted == 0 || self.rule_index(persisted).is_some() {
            return self.add_rule(rule);
        }
        if !self.allowed(Operation::AddRule) || !self.proxy_reference_ok(rule) {
            return None;
        }
        Some(self.push_rule(persisted, rule))
    }

    fn edit_rule(&mut self, id: RuleId, rule: &RuleDefinition) -> bool {
        if !self.allowed(Operation::EditRule) || !self.proxy_reference_ok(rule) {
            return false;
        }
        let Some(index) = self.rule_index(id) else {
            return false;
        };
        // Redefinition resets the enabled flag.
        self.rules[index] = EngineRule {
            id,
            definition: rule.clone(),
            enabled: true,
        };
        self.calls.push(GatewayCall::EditRule(id));
        true
    }

    fn delete_rule(&mut self, id: RuleId) -> bool {
        if !self.allowed(Operation::DeleteRule) {
            return false;
        }
        let Some(index) = self.rule_index(id) else {
            return false;
        };
        self.rules.remove(index);
        self.calls.push(GatewayCall::DeleteRule(id));
        true
    }

    fn enable_rule(&mut self, id: RuleId) -> bool {
        self.set_enabled(Operation::EnableRule, id, true)
    }

    fn disable_rule(&mut self, id: RuleId) -> bool {
        self.set_enabled(Operation::DisableRule, id, false)
    }

    fn rule_position(&self, id: RuleId) -> Option<u32> {
        self.rule_index(id).map(|i| i as u32 + 1)
    }

    fn move_rule_to_position(&mut self, id: RuleId, position: u32) -> bool {
        if !self.allowed(Operation::MoveRule) || position == 0 || position as usize > self.rules.len() {
            return false;
        }
        let Some(index) = self.rule_index(id) else {
            return false;
        };
        let rule = self.rules.remove(index);
        self.rules.insert(position as usize - 1, rule);
        self.calls.push(GatewayCall::MoveRule { id, position });
        true
    }

    fn set_dns_via_proxy(&mut self, enable: bool) {
        self.dns_via_proxy = enable;
        self.calls.push(GatewayCall::SetDnsViaProxy(enable));
    }

    fn set_localhost_via_proxy(&mut self, enable: bool) {
        self.localhost_via_proxy = enable;
        self.calls.push(GatewayCall::SetLocalhostViaProxy(enable));
    }

    fn set_traffic_logging_enabled(&mut self, enable: bool) {
        self.traffic_logging = enable;
        self.calls.push(GatewayCall::SetTrafficLogging(enable));
    }

    fn clear_connection_logs(&mut self) {
        self.calls.push(GatewayCall::ClearConnectionLogs);
    }

    fn set_event_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> bool {
        if !self.allowed(Operation::Start) {
            return false;
        }
        if !self.running {
            self.running = true;
            self.calls.push(GatewayCall::Start);
            self.emit(EngineEvent::Diagnostic("engine started".to_string()));
        }
        true
    }

    fn stop(&mut self) -> bool {
        if !self.allowed(Operation::Stop) {
            return false;
        }
        if self.running {
            self.running = false;
            self.calls.push(GatewayCall::Stop);
            self.emit(EngineEvent::Diagnostic("engine stopped".to_string()));
        }
        true
    }
}
