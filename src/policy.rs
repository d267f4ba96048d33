//! Control-context facade over the rule set, the proxy registry, the global
//! settings and the persisted snapshot.
//!
//! Every successful mutation is mirrored to the engine first and then
//! persisted. A [`Policy`] is owned by one control context; wrap it in a
//! lock if several threads need it.

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;

use crate::converter::{self, ImportPlan};
use crate::error::{Error, Result};
use crate::events::EventLog;
use crate::gateway::{EnforcementGateway, Operation};
use crate::pattern;
use crate::proxy::{ProxyConfig, ProxyConfigRegistry};
use crate::ruleset::{ChangeListener, Rule, RuleDraft, RuleSet};
use crate::store::{ConfigStore, SaveWorker, Settings, Snapshot, SCHEMA_VERSION};
use crate::types::{ProxyConfigId, RuleId};

enum Persistence {
    Off,
    Inline(ConfigStore),
    Background(SaveWorker),
}

/// Outcome of replaying a persisted snapshot into the engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub proxy_configs: usize,
    pub rules: usize,
    /// Persisted proxy config ids the engine refused
    pub failed_configs: Vec<ProxyConfigId>,
    /// Persisted rule ids that could not be replayed
    pub dropped_rules: Vec<RuleId>,
}

/// Outcome of a bulk import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub added: Vec<RuleId>,
    /// Disabled entries that were not imported
    pub skipped: Vec<String>,
    /// Entries refused by the engine, with the reason
    pub failed: Vec<(String, String)>,
}

pub struct Policy<G: EnforcementGateway> {
    gateway: G,
    rules: RuleSet,
    proxies: ProxyConfigRegistry,
    settings: Settings,
    persistence: Persistence,
    events: Option<Arc<EventLog>>,
}

impl<G: EnforcementGateway> Policy<G> {
    /// Empty policy without persistence.
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            rules: RuleSet::new(),
            proxies: ProxyConfigRegistry::new(),
            settings: Settings::default(),
            persistence: Persistence::Off,
            events: None,
        }
    }

    /// Persist every change synchronously to `store`.
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.persistence = Persistence::Inline(store);
        self
    }

    /// Persist every change to `store` from a background thread.
    pub fn with_background_store(mut self, store: ConfigStore) -> Result<Self> {
        self.persistence = Persistence::Background(SaveWorker::spawn(store)?);
        Ok(self)
    }

    /// Route engine events into `log`.
    pub fn attach_event_log(&mut self, log: Arc<EventLog>) {
        log.set_traffic_logging(self.settings.traffic_logging_enabled);
        self.gateway.set_event_sink(log.sink());
        self.events = Some(log);
    }

    /// Replay a persisted snapshot into an empty policy.
    ///
    /// Proxy configs are registered first. The engine is asked to keep each
    /// persisted id; any id it assigns instead is mapped. Rules follow in
    /// position order, again under their persisted ids where possible, with
    /// their proxy reference remapped; rules whose reference cannot be
    /// mapped are dropped. Disabled rules are disabled again and the global
    /// toggles are applied last. The result is persisted once.
    pub fn restore(&mut self, snapshot: &Snapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut id_map: AHashMap<ProxyConfigId, ProxyConfigId> = AHashMap::new();

        for config in &snapshot.proxy_configs {
            match self.proxies.restore(Some(&mut self.gateway), config.clone()) {
                Ok(id) => {
                    id_map.insert(config.id, id);
                    report.proxy_configs += 1;
                }
                Err(e) => {
                    log::warn!("Proxy config {} not restored: {}", config.id, e);
                    report.failed_configs.push(config.id);
                }
            }
        }

        let mut ordered: Vec<&Rule> = snapshot.rules.iter().collect();
        ordered.sort_by_key(|r| r.position);

        for rule in ordered {
            let mut draft = rule.to_draft();
            let persisted = rule.definition.proxy_config_id;
            if rule.definition.action.uses_proxy() && persisted != 0 {
                match id_map.get(&persisted) {
                    Some(&id) => draft.proxy_config_id = id,
                    None => {
                        log::warn!(
                            "Rule {} dropped: proxy config {} is not available",
                            rule.id,
                            persisted
                        );
                        report.dropped_rules.push(rule.id);
                        continue;
                    }
                }
            }

            match self.rules.restore(&mut self.gateway, &self.proxies, rule.id, &draft) {
                Ok(_) => report.rules += 1,
                Err(e) => {
                    log::warn!("Rule {} not restored: {}", rule.id, e);
                    report.dropped_rules.push(rule.id);
                }
            }
        }

        self.settings = snapshot.settings.clone();
        self.apply_toggles();

        let summary = format!(
            "Restored {} proxy configs and {} rules ({} dropped)",
            report.proxy_configs,
            report.rules,
            report.dropped_rules.len()
        );
        log::info!("{}", summary);
        if let Some(events) = &self.events {
            events.note(&summary);
        }
        self.persist();
        report
    }

    /// Current state as plain data.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SCHEMA_VERSION.to_string(),
            settings: self.settings.clone(),
            proxy_configs: self.proxies.list().to_vec(),
            rules: self.rules.rules().to_vec(),
        }
    }

    /// Block until queued background saves are on disk.
    pub fn flush(&self) {
        if let Persistence::Background(worker) = &self.persistence {
            worker.flush();
        }
    }

    // Proxy configs

    pub fn add_proxy_config(&mut self, config: ProxyConfig) -> Result<ProxyConfigId> {
        let result = self.proxies.add(Some(&mut self.gateway), config);
        self.persisted(result)
    }

    /// Reuse a registered config with the same endpoint, or add a new one.
    pub fn ensure_proxy_config(&mut self, config: ProxyConfig) -> Result<ProxyConfigId> {
        if let Some(id) = self.proxies.find_endpoint(&config).map(|c| c.id) {
            return Ok(id);
        }
        self.add_proxy_config(config)
    }

    pub fn edit_proxy_config(&mut self, id: ProxyConfigId, config: ProxyConfig) -> Result<()> {
        let result = self.proxies.edit(Some(&mut self.gateway), id, config);
        self.persisted(result)
    }

    /// Number of rules that deleting config `id` would remove.
    pub fn rules_referencing_config(&self, id: ProxyConfigId) -> usize {
        self.rules.count_referencing(id)
    }

    /// Delete a proxy config together with every PROXY rule routed through
    /// it.
    ///
    /// Returns `None` when the config does not exist, otherwise the number
    /// of rules removed. If the engine refuses a rule deletion the config is
    /// kept; rules already deleted stay deleted.
    pub fn delete_proxy_config(&mut self, id: ProxyConfigId) -> Result<Option<usize>> {
        if !self.proxies.contains(id) {
            return Ok(None);
        }

        let removed = match self.rules.delete_rules_referencing(&mut self.gateway, id) {
            Ok(removed) => removed,
            Err(e) => {
                self.persist();
                return Err(e);
            }
        };
        if removed > 0 {
            log::info!("Deleted {} rules routed through proxy config {}", removed, id);
        }

        let result = self.proxies.delete(Some(&mut self.gateway), id);
        self.persist();
        result.map(|_| Some(removed))
    }

    /// Ask the engine to reach `target_host:target_port` through config
    /// `id` and return its report.
    pub fn test_proxy_config(
        &mut self,
        id: ProxyConfigId,
        target_host: &str,
        target_port: u16,
    ) -> Result<String> {
        let mut errors = Vec::new();
        let host = pattern::validate_endpoint_host(target_host)
            .map_err(|e| errors.push(e))
            .ok();
        let port = pattern::validate_endpoint_port(target_port)
            .map_err(|e| errors.push(e))
            .ok();
        let (Some(host), Some(port)) = (host, port) else {
            return Err(Error::Validation(errors));
        };
        if !self.proxies.contains(id) {
            return Err(Error::NotFound {
                kind: "proxy config",
                id,
            });
        }

        log::debug!("Testing proxy config {} against {}:{}", id, host, port);
        self.gateway
            .test_proxy_config(id, &host, port)
            .ok_or(Error::EngineRejected {
                operation: Operation::TestProxyConfig,
            })
    }

    pub fn proxy_configs(&self) -> &[ProxyConfig] {
        self.proxies.list()
    }

    pub fn proxy_config(&self, id: ProxyConfigId) -> Option<&ProxyConfig> {
        self.proxies.get(id)
    }

    // Rules

    pub fn add_rule(&mut self, draft: &RuleDraft) -> Result<RuleId> {
        let result = self.rules.add(&mut self.gateway, &self.proxies, draft);
        self.persisted(result)
    }

    pub fn edit_rule(&mut self, id: RuleId, draft: &RuleDraft) -> Result<()> {
        let result = self.rules.edit(&mut self.gateway, &self.proxies, id, draft);
        self.persisted(result)
    }

    pub fn delete_rule(&mut self, id: RuleId) -> Result<bool> {
        let result = self.rules.delete(&mut self.gateway, id);
        self.persisted(result)
    }

    /// Delete several rules; returns how many were removed.
    pub fn delete_rules(&mut self, ids: &[RuleId]) -> usize {
        let removed = self.rules.delete_many(&mut self.gateway, ids);
        if removed > 0 {
            self.persist();
        }
        removed
    }

    pub fn set_rule_enabled(&mut self, id: RuleId, enabled: bool) -> Result<bool> {
        let result = self.rules.set_enabled(&mut self.gateway, id, enabled);
        self.persisted(result)
    }

    pub fn enable_rule(&mut self, id: RuleId) -> Result<bool> {
        self.set_rule_enabled(id, true)
    }

    pub fn disable_rule(&mut self, id: RuleId) -> Result<bool> {
        self.set_rule_enabled(id, false)
    }

    pub fn move_rule(&mut self, id: RuleId, position: u32) -> Result<bool> {
        let result = self.rules.move_to_position(&mut self.gateway, id, position);
        self.persisted(result)
    }

    /// Add every rule of an import plan, routing PROXY rules through
    /// `proxy` (or the first config when `None`).
    ///
    /// All patterns are validated before anything is registered; a
    /// validation error rejects the whole plan.
    pub fn import_rules(
        &mut self,
        plan: &ImportPlan,
        proxy: Option<ProxyConfigId>,
    ) -> Result<ImportReport> {
        let mut errors = Vec::new();
        for draft in &plan.drafts {
            if let Err(Error::Validation(mut e)) = draft.normalize() {
                errors.append(&mut e);
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let mut report = ImportReport {
            skipped: plan.skipped.clone(),
            ..ImportReport::default()
        };
        for draft in &plan.drafts {
            let draft = match proxy {
                Some(id) => draft.clone().with_proxy_config(id),
                None => draft.clone(),
            };
            match self.rules.add(&mut self.gateway, &self.proxies, &draft) {
                Ok(id) => report.added.push(id),
                Err(e) => {
                    log::warn!("Rule for {} not imported: {}", draft.process, e);
                    report.failed.push((draft.process.clone(), e.to_string()));
                }
            }
        }

        if !report.added.is_empty() {
            self.persist();
        }
        Ok(report)
    }

    /// Parse a rule file and import it.
    pub fn import_rule_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        proxy: Option<ProxyConfigId>,
    ) -> Result<ImportReport> {
        let plan = converter::parse_rule_file(path)?;
        self.import_rules(&plan, proxy)
    }

    /// Write the rules as an importable rule file.
    pub fn export_rules<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        converter::write_rule_file(path, self.rules.rules())
    }

    /// Rules in position order.
    pub fn rules(&self) -> &[Rule] {
        self.rules.rules()
    }

    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Observe confirmed rule changes.
    pub fn subscribe(&mut self, listener: ChangeListener) {
        self.rules.subscribe(listener);
    }

    // Settings

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_dns_via_proxy(&mut self, enable: bool) {
        self.gateway.set_dns_via_proxy(enable);
        self.settings.dns_via_proxy = enable;
        self.persist();
    }

    pub fn set_localhost_via_proxy(&mut self, enable: bool) {
        self.gateway.set_localhost_via_proxy(enable);
        self.settings.localhost_via_proxy = enable;
        self.persist();
    }

    pub fn set_traffic_logging(&mut self, enable: bool) {
        self.gateway.set_traffic_logging_enabled(enable);
        if let Some(events) = &self.events {
            events.set_traffic_logging(enable);
        }
        self.settings.traffic_logging_enabled = enable;
        self.persist();
    }

    /// Drop the connection history held by the engine and the event log.
    pub fn clear_connection_logs(&mut self) {
        self.gateway.clear_connection_logs();
        if let Some(events) = &self.events {
            events.connections().clear();
        }
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.settings.language = language.into();
        self.persist();
    }

    pub fn set_close_to_tray(&mut self, enable: bool) {
        self.settings.close_to_tray = enable;
        self.persist();
    }

    // Engine

    pub fn start(&mut self) -> Result<()> {
        if !self.gateway.start() {
            return Err(Error::EngineRejected {
                operation: Operation::Start,
            });
        }
        log::info!("Engine started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.gateway.stop() {
            return Err(Error::EngineRejected {
                operation: Operation::Stop,
            });
        }
        log::info!("Engine stopped");
        Ok(())
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Direct engine access. Changes made here are not reflected in the
    /// policy.
    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    fn apply_toggles(&mut self) {
        self.gateway.set_dns_via_proxy(self.settings.dns_via_proxy);
        self.gateway
            .set_localhost_via_proxy(self.settings.localhost_via_proxy);
        self.gateway
            .set_traffic_logging_enabled(self.settings.traffic_logging_enabled);
        if let Some(events) = &self.events {
            events.set_traffic_logging(self.settings.traffic_logging_enabled);
        }
    }

    fn persisted<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_ok() {
            self.persist();
        }
        result
    }

    fn persist(&self) {
        match &self.persistence {
            Persistence::Off => {}
            Persistence::Inline(store) => {
                store.save(&self.snapshot());
            }
            Persistence::Background(worker) => worker.submit(self.snapshot()),
        }
    }
}
