//! Enumerations shared by rules, proxy configs and the engine boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Engine-assigned rule identifier. `0` means "not yet accepted".
pub type RuleId = u32;

/// Registry-assigned proxy config identifier. `0` means "none".
pub type ProxyConfigId = u32;

/// RuleAction is what happens to a connection when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    /// Route through the referenced proxy config
    #[default]
    Proxy,
    /// Route directly without proxy
    Direct,
    /// Drop the connection
    Block,
}

impl RuleAction {
    /// Parse an action (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "PROXY" => Ok(RuleAction::Proxy),
            "DIRECT" => Ok(RuleAction::Direct),
            "BLOCK" => Ok(RuleAction::Block),
            _ => Err(Error::InvalidAction(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Proxy => "PROXY",
            RuleAction::Direct => "DIRECT",
            RuleAction::Block => "BLOCK",
        }
    }

    /// Whether this action routes through a proxy config.
    pub fn uses_proxy(&self) -> bool {
        matches!(self, RuleAction::Proxy)
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RuleAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Transport protocol a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    /// Parse a protocol (case-insensitive). `TCP+UDP` is an alias for `BOTH`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "BOTH" | "TCP+UDP" => Ok(Protocol::Both),
            _ => Err(Error::InvalidProtocol(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Both => "BOTH",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Proxy server protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyType {
    #[default]
    Socks5,
    Http,
}

impl ProxyType {
    /// Parse a proxy type (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SOCKS5" => Ok(ProxyType::Socks5),
            "HTTP" => Ok(ProxyType::Http),
            _ => Err(Error::InvalidProxyType(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Socks5 => "SOCKS5",
            ProxyType::Http => "HTTP",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
