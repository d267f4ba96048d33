//! Proxy endpoint registry.
//!
//! Rules with action PROXY reference a [`ProxyConfig`] by identifier. The
//! registry only stores a config after the enforcement engine has accepted
//! it. When no engine is attached (preview mode) identifiers are derived
//! from the wall clock instead; that keeps the registry usable offline but
//! uniqueness is best-effort only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::gateway::{EnforcementGateway, Operation};
use crate::pattern;
use crate::types::{ProxyConfigId, ProxyType};

/// Maximum number of proxy configs the engine accepts.
pub const MAX_PROXY_CONFIGS: usize = 16;

/// A named proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub id: ProxyConfigId,
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    /// Empty means no authentication
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxyConfig {
    pub fn new(proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: 0,
            proxy_type,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }

    /// Label shown in rule lists, e.g. `SOCKS5://127.0.0.1:1080`.
    pub fn display_name(&self) -> String {
        format!("{}://{}:{}", self.proxy_type, self.host, self.port)
    }

    /// Same endpoint and credentials, ignoring the identifier.
    pub fn same_endpoint(&self, other: &ProxyConfig) -> bool {
        self.proxy_type == other.proxy_type
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.username == other.username
            && self.password == other.password
    }

    /// Validate host and port, returning a copy with the host trimmed.
    pub fn validated(&self) -> Result<ProxyConfig> {
        let mut errors = Vec::new();
        let host = pattern::validate_endpoint_host(&self.host).map_err(|e| errors.push(e)).ok();
        let port = pattern::validate_endpoint_port(self.port).map_err(|e| errors.push(e)).ok();

        match (host, port) {
            (Some(host), Some(port)) => Ok(ProxyConfig {
                host,
                port,
                ..self.clone()
            }),
            _ => Err(Error::Validation(errors)),
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())?;
        if self.has_auth() {
            write!(f, " (auth: {}:***)", self.username)?;
        }
        Ok(())
    }
}

/// Insertion-ordered set of proxy configs.
#[derive(Debug, Default)]
pub struct ProxyConfigRegistry {
    configs: Vec<ProxyConfig>,
}

impl ProxyConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a config and return its identifier.
    ///
    /// With a gateway the identifier comes from the engine; without one a
    /// time-derived identifier is generated.
    pub fn add(
        &mut self,
        gateway: Option<&mut dyn EnforcementGateway>,
        config: ProxyConfig,
    ) -> Result<ProxyConfigId> {
        self.register(gateway, config, None)
    }

    /// Re-register a persisted config, keeping `config.id` when the engine
    /// (or, offline, the registry) still has it free.
    pub fn restore(
        &mut self,
        gateway: Option<&mut dyn EnforcementGateway>,
        config: ProxyConfig,
    ) -> Result<ProxyConfigId> {
        let persisted = config.id;
        self.register(gateway, config, Some(persisted))
    }

    fn register(
        &mut self,
        gateway: Option<&mut dyn EnforcementGateway>,
        config: ProxyConfig,
        persisted: Option<ProxyConfigId>,
    ) -> Result<ProxyConfigId> {
        if self.configs.len() >= MAX_PROXY_CONFIGS {
            return Err(Error::RegistryFull(MAX_PROXY_CONFIGS));
        }
        let mut config = config.validated()?;

        let id = match (gateway, persisted) {
            (Some(gw), Some(persisted)) => gw.restore_proxy_config(persisted, &config),
            (Some(gw), None) => gw.add_proxy_config(&config),
            (None, Some(persisted)) if persisted != 0 && !self.contains(persisted) => {
                Some(persisted)
            }
            (None, _) => Some(self.offline_id()),
        }
        .ok_or(Error::EngineRejected {
            operation: Operation::AddProxyConfig,
        })?;

        config.id = id;
        log::debug!("Registered proxy config {}: {}", id, config.display_name());
        self.configs.push(config);
        Ok(id)
    }

    /// Replace the endpoint of an existing config, keeping its identifier
    /// and display position.
    pub fn edit(
        &mut self,
        gateway: Option<&mut dyn EnforcementGateway>,
        id: ProxyConfigId,
        config: ProxyConfig,
    ) -> Result<()> {
        let index = self.index_of(id).ok_or(Error::NotFound {
            kind: "proxy config",
            id,
        })?;
        let mut config = config.validated()?;
        config.id = id;

        if let Some(gw) = gateway {
            if !gw.edit_proxy_config(id, &config) {
                return Err(Error::EngineRejected {
                    operation: Operation::EditProxyConfig,
                });
            }
        }

        self.configs[index] = config;
        Ok(())
    }

    /// Remove a config. Returns `false` if it was not registered.
    ///
    /// This does not touch rules; use [`crate::Policy::delete_proxy_config`]
    /// to remove referencing rules first.
    pub fn delete(
        &mut self,
        gateway: Option<&mut dyn EnforcementGateway>,
        id: ProxyConfigId,
    ) -> Result<bool> {
        let Some(index) = self.index_of(id) else {
            return Ok(false);
        };

        if let Some(gw) = gateway {
            if !gw.delete_proxy_config(id) {
                return Err(Error::EngineRejected {
                    operation: Operation::DeleteProxyConfig,
                });
            }
        }

        let removed = self.configs.remove(index);
        log::debug!("Removed proxy config {}: {}", id, removed.display_name());
        Ok(true)
    }

    /// Configs in insertion order.
    pub fn list(&self) -> &[ProxyConfig] {
        &self.configs
    }

    pub fn get(&self, id: ProxyConfigId) -> Option<&ProxyConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    /// Default choice for new PROXY rules.
    pub fn first(&self) -> Option<&ProxyConfig> {
        self.configs.first()
    }

    /// Find a registered config with the same endpoint.
    pub fn find_endpoint(&self, config: &ProxyConfig) -> Option<&ProxyConfig> {
        self.configs.iter().find(|c| c.same_endpoint(config))
    }

    pub fn contains(&self, id: ProxyConfigId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    fn index_of(&self, id: ProxyConfigId) -> Option<usize> {
        self.configs.iter().position(|c| c.id == id)
    }

    /// Low 32 bits of the current Unix time in milliseconds, bumped past
    /// zero and past identifiers already in use.
    fn offline_id(&self) -> ProxyConfigId {
        let mut id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or(1);
        while id == 0 || self.contains(id) {
            id = id.wrapping_add(1);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;

    fn socks(port: u16) -> ProxyConfig {
        ProxyConfig::new(ProxyType::Socks5, "127.0.0.1", port)
    }

    #[test]
    fn test_add_uses_engine_id() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let a = reg.add(Some(&mut gw), socks(1080)).unwrap();
        let b = reg.add(Some(&mut gw), socks(1081)).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.list().iter().map(|c| c.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(gw.proxy_config(a).unwrap().port, 1080);
        assert_eq!(reg.first().unwrap().id, a);
    }

    #[test]
    fn test_add_rejected_leaves_registry_empty() {
        let mut gw = MemoryGateway::new();
        gw.reject(Operation::AddProxyConfig);
        let mut reg = ProxyConfigRegistry::new();
        let err = reg.add(Some(&mut gw), socks(1080)).unwrap_err();
        assert!(matches!(err, Error::EngineRejected { .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_add_validates_endpoint() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let bad = ProxyConfig::new(ProxyType::Http, "not a host", 0);
        let err = reg.add(Some(&mut gw), bad).unwrap_err();
        assert_eq!(err.validation_errors().len(), 2);
        assert!(gw.calls().is_empty());
    }

    #[test]
    fn test_offline_ids_are_unique() {
        let mut reg = ProxyConfigRegistry::new();
        let a = reg.add(None, socks(1080)).unwrap();
        let b = reg.add(None, socks(1081)).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_restore_keeps_persisted_id() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let mut config = socks(1082);
        config.id = 3;
        assert_eq!(reg.restore(Some(&mut gw), config.clone()).unwrap(), 3);
        assert_eq!(gw.proxy_config(3).unwrap().port, 1082);
        assert_ne!(reg.add(Some(&mut gw), socks(1083)).unwrap(), 3);

        let mut offline = ProxyConfigRegistry::new();
        assert_eq!(offline.restore(None, config.clone()).unwrap(), 3);
        assert_ne!(offline.restore(None, config).unwrap(), 3);
    }

    #[test]
    fn test_capacity_limit() {
        let mut reg = ProxyConfigRegistry::new();
        for i in 0..MAX_PROXY_CONFIGS {
            reg.add(None, socks(2000 + i as u16)).unwrap();
        }
        assert!(matches!(
            reg.add(None, socks(3000)),
            Err(Error::RegistryFull(MAX_PROXY_CONFIGS))
        ));
    }

    #[test]
    fn test_edit_keeps_id_and_order() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let a = reg.add(Some(&mut gw), socks(1080)).unwrap();
        let b = reg.add(Some(&mut gw), socks(1081)).unwrap();

        let updated = ProxyConfig::new(ProxyType::Http, "proxy.local", 8080).with_credentials("u", "p");
        reg.edit(Some(&mut gw), a, updated).unwrap();

        assert_eq!(reg.list()[0].id, a);
        assert_eq!(reg.list()[0].proxy_type, ProxyType::Http);
        assert!(reg.list()[0].has_auth());
        assert_eq!(reg.list()[1].id, b);
        assert_eq!(gw.proxy_config(a).unwrap().host, "proxy.local");
    }

    #[test]
    fn test_edit_rejected_keeps_old_value() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let a = reg.add(Some(&mut gw), socks(1080)).unwrap();
        gw.reject(Operation::EditProxyConfig);
        assert!(reg.edit(Some(&mut gw), a, socks(9999)).is_err());
        assert_eq!(reg.get(a).unwrap().port, 1080);
        assert!(matches!(
            reg.edit(Some(&mut gw), 999, socks(1)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let mut gw = MemoryGateway::new();
        let mut reg = ProxyConfigRegistry::new();
        let a = reg.add(Some(&mut gw), socks(1080)).unwrap();
        assert!(reg.delete(Some(&mut gw), a).unwrap());
        assert!(!reg.delete(Some(&mut gw), a).unwrap());
        assert!(reg.is_empty());
        assert!(gw.proxy_config(a).is_none());
    }

    #[test]
    fn test_display_hides_password() {
        let cfg = socks(1080).with_credentials("alice", "secret");
        let text = cfg.to_string();
        assert!(text.contains("alice"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_serde_uses_type_key() {
        let json = serde_json::to_value(socks(1080)).unwrap();
        assert_eq!(json["type"], "SOCKS5");
        assert_eq!(json["port"], 1080);
    }
}
