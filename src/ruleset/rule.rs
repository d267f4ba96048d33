//! Rule data model.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::pattern::{self, FieldKind};
use crate::types::{Protocol, ProxyConfigId, RuleAction, RuleId};

fn default_true() -> bool {
    true
}

/// Unvalidated rule input as typed by an author or read from an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDraft {
    pub process: String,
    pub hosts: String,
    pub ports: String,
    pub protocol: Protocol,
    pub action: RuleAction,
    /// `0` selects the first registered proxy config for PROXY rules
    pub proxy_config_id: ProxyConfigId,
    pub enabled: bool,
}

impl RuleDraft {
    pub fn new(
        process: impl Into<String>,
        hosts: impl Into<String>,
        ports: impl Into<String>,
        protocol: Protocol,
        action: RuleAction,
    ) -> Self {
        Self {
            process: process.into(),
            hosts: hosts.into(),
            ports: ports.into(),
            protocol,
            action,
            proxy_config_id: 0,
            enabled: true,
        }
    }

    pub fn with_proxy_config(mut self, id: ProxyConfigId) -> Self {
        self.proxy_config_id = id;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validate all three pattern fields, reporting every offending field.
    ///
    /// DIRECT and BLOCK rules never carry a proxy reference.
    pub fn normalize(&self) -> Result<RuleDefinition> {
        let mut errors = Vec::new();
        let mut field = |value: &str, kind| match pattern::validate(value, kind) {
            Ok(v) => v,
            Err(e) => {
                errors.push(e);
                String::new()
            }
        };

        let process_pattern = field(&self.process, FieldKind::Process);
        let host_pattern = field(&self.hosts, FieldKind::Host);
        let port_pattern = field(&self.ports, FieldKind::Port);

        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        Ok(RuleDefinition {
            process_pattern,
            host_pattern,
            port_pattern,
            protocol: self.protocol,
            action: self.action,
            proxy_config_id: if self.action.uses_proxy() {
                self.proxy_config_id
            } else {
                0
            },
        })
    }
}

impl Default for RuleDraft {
    fn default() -> Self {
        Self::new("*", "*", "*", Protocol::Tcp, RuleAction::Proxy)
    }
}

/// Validated rule fields as handed to the enforcement engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub process_pattern: String,
    pub host_pattern: String,
    pub port_pattern: String,
    pub protocol: Protocol,
    pub action: RuleAction,
    #[serde(default)]
    pub proxy_config_id: ProxyConfigId,
}

impl RuleDefinition {
    /// Whether this definition routes through `config_id`.
    pub fn references(&self, config_id: ProxyConfigId) -> bool {
        self.action.uses_proxy() && self.proxy_config_id == config_id
    }
}

impl fmt::Display for RuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{} -> {}",
            self.process_pattern, self.host_pattern, self.port_pattern, self.protocol, self.action
        )
    }
}

/// A rule owned by a [`crate::RuleSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: RuleId,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 1-based evaluation rank
    pub position: u32,
}

impl Rule {
    /// Draft carrying this rule's current values, for editing or export.
    pub fn to_draft(&self) -> RuleDraft {
        RuleDraft {
            process: self.definition.process_pattern.clone(),
            hosts: self.definition.host_pattern.clone(),
            ports: self.definition.port_pattern.clone(),
            protocol: self.definition.protocol,
            action: self.definition.action,
            proxy_config_id: self.definition.proxy_config_id,
            enabled: self.enabled,
        }
    }
}
