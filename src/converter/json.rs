//! Bulk rule files.
//!
//! A rule file is a JSON array of objects:
//!
//! ```json
//! [
//!   {
//!     "processNames": "chrome.exe",
//!     "targetHosts": "*",
//!     "targetPorts": "443",
//!     "protocol": "TCP",
//!     "action": "PROXY",
//!     "enabled": true
//!   }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::ruleset::{Rule, RuleDraft};
use crate::store::write_atomic;
use crate::types::{Protocol, RuleAction};

/// One entry of a rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleImport {
    #[serde(default)]
    pub process_names: String,
    #[serde(default)]
    pub target_hosts: String,
    #[serde(default)]
    pub target_ports: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub action: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl From<&Rule> for RuleImport {
    fn from(rule: &Rule) -> Self {
        let def = &rule.definition;
        Self {
            process_names: def.process_pattern.clone(),
            target_hosts: def.host_pattern.clone(),
            target_ports: def.port_pattern.clone(),
            protocol: def.protocol.as_str().to_string(),
            action: def.action.as_str().to_string(),
            enabled: rule.enabled,
        }
    }
}

/// Rules ready to be added, in file order.
#[derive(Debug, Default)]
pub struct ImportPlan {
    pub drafts: Vec<RuleDraft>,
    /// Process patterns of entries skipped because they were disabled
    pub skipped: Vec<String>,
}

impl ImportPlan {
    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

/// Read and parse a rule file.
pub fn parse_rule_file<P: AsRef<Path>>(path: P) -> Result<ImportPlan> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let plan = parse_rule_str(&text)?;
    log::info!(
        "Loaded {} rule(s) from {} ({} disabled skipped)",
        plan.drafts.len(),
        path.display(),
        plan.skipped.len()
    );
    Ok(plan)
}

/// Parse rule file content.
///
/// Any malformed protocol or action rejects the whole file, so nothing is
/// registered from a partially valid import.
pub fn parse_rule_str(text: &str) -> Result<ImportPlan> {
    let entries: Vec<RuleImport> =
        serde_json::from_str(text).map_err(|e| Error::InvalidImport(e.to_string()))?;

    let mut plan = ImportPlan::default();
    if entries.is_empty() {
        log::warn!("Rule file contains no rules");
        return Ok(plan);
    }

    for entry in entries {
        if !entry.enabled {
            log::info!("Skipping disabled rule: {}", entry.process_names);
            plan.skipped.push(entry.process_names);
            continue;
        }
        let protocol = Protocol::parse(entry.protocol.trim())?;
        let action = RuleAction::parse(entry.action.trim())?;
        plan.drafts.push(RuleDraft::new(
            entry.process_names,
            entry.target_hosts,
            entry.target_ports,
            protocol,
            action,
        ));
    }
    Ok(plan)
}

/// Convert rules to rule file entries, in the given order.
pub fn export_rules(rules: &[Rule]) -> Vec<RuleImport> {
    rules.iter().map(RuleImport::from).collect()
}

/// Write rules as a rule file.
pub fn write_rule_file<P: AsRef<Path>>(path: P, rules: &[Rule]) -> Result<()> {
    let entries = export_rules(rules);
    write_atomic(path.as_ref(), |w| {
        serde_json::to_writer_pretty(&mut *w, &entries)?;
        w.write_all(b"\n")
    })
}
