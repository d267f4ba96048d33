//! Procroute - per-process traffic routing policy.
//!
//! This crate manages the ordered rule list an external enforcement engine
//! evaluates for every outbound connection: which process, to which hosts
//! and ports, over which protocol, is sent through a proxy, sent direct or
//! blocked. It keeps the engine synchronized with the authored policy and
//! stores the policy durably.
//!
//! # Features
//!
//! - **Pattern grammar**: process, host and port patterns with wildcards,
//!   lists, CIDR blocks and port ranges
//! - **Ordered rules**: first match wins; positions stay dense `1..=N`
//!   across add, delete and move
//! - **Proxy registry**: up to 16 SOCKS5/HTTP endpoints, with cascading
//!   delete of the rules that use them
//! - **Fail-closed sync**: local state only changes after the engine accepts
//! - **Atomic persistence**: temp file plus rename, schema-versioned
//! - **Bulk import/export**: JSON rule files and a one-line rule grammar
//!
//! # Quick Start
//!
//! ```ignore
//! use procroute::{ConfigStore, MemoryGateway, Policy, ProxyConfig, ProxyType};
//! use procroute::converter::parse_rule_line;
//!
//! let store = ConfigStore::open_default()?;
//! let snapshot = store.load();
//!
//! let mut policy = Policy::new(MemoryGateway::new());
//! policy.restore(&snapshot);
//! let mut policy = policy.with_store(store);
//!
//! let proxy = policy.add_proxy_config(ProxyConfig::new(ProxyType::Socks5, "127.0.0.1", 1080))?;
//! let rule = parse_rule_line("chrome.exe:*:443;8443:TCP:PROXY")?.with_proxy_config(proxy);
//! let id = policy.add_rule(&rule)?;
//! policy.move_rule(id, 1)?;
//! ```
//!
//! # Engine
//!
//! The engine is reached through the [`EnforcementGateway`] trait. It holds
//! no durable state, so at startup [`Policy::restore`] replays the persisted
//! snapshot: proxy configs first, then rules in position order, each under
//! its persisted identifier when the engine can keep it.
//! [`MemoryGateway`] is an in-memory engine for offline editing and tests.

mod error;
mod types;

pub mod converter;
pub mod events;
pub mod gateway;
pub mod pattern;
pub mod policy;
pub mod proxy;
pub mod ruleset;
pub mod store;

// Re-export core types
pub use error::{Error, Result, ValidationError, ValidationReason};
pub use types::{Protocol, ProxyConfigId, ProxyType, RuleAction, RuleId};

// Re-export policy model
pub use policy::{ImportReport, Policy, RestoreReport};
pub use proxy::{ProxyConfig, ProxyConfigRegistry, MAX_PROXY_CONFIGS};
pub use ruleset::{Rule, RuleChange, RuleDefinition, RuleDraft, RuleSet};

// Re-export engine boundary
pub use events::{ConnectionEvent, EngineEvent, EventLog, LogPump};
pub use gateway::{EnforcementGateway, MemoryGateway, Operation};

// Re-export persistence
pub use store::{ConfigStore, SaveWorker, Settings, Snapshot, SCHEMA_VERSION};
