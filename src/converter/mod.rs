//! Text formats for rules and proxy endpoints.
//!
//! - [`line`]: the compact command-line grammar
//!   (`process:hosts:ports:protocol:action`, `type://host:port`)
//! - [`json`]: the bulk rule file used for import and export

pub mod json;
pub mod line;

pub use json::{export_rules, parse_rule_file, parse_rule_str, write_rule_file, ImportPlan, RuleImport};
pub use line::{parse_proxy_url, parse_rule_line, DEFAULT_PROXY_URL};
