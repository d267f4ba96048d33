//! Single-line rule and proxy URL grammar.

use crate::error::{Error, Result};
use crate::pattern::{self, WILDCARD};
use crate::proxy::ProxyConfig;
use crate::ruleset::RuleDraft;
use crate::types::{Protocol, ProxyType, RuleAction};

/// Proxy used when none is given on the command line.
pub const DEFAULT_PROXY_URL: &str = "socks5://127.0.0.1:4444";

/// Parse `process:hosts:ports:protocol:action`.
///
/// The line is split on the first four colons. Empty pattern fields mean
/// `*`. Patterns are only checked later by [`RuleDraft::normalize`].
pub fn parse_rule_line(line: &str) -> Result<RuleDraft> {
    let parts: Vec<&str> = line.splitn(5, ':').collect();
    if parts.len() != 5 {
        return Err(Error::InvalidRuleFormat(line.to_string()));
    }

    let protocol = Protocol::parse(parts[3].trim())?;
    let action = RuleAction::parse(parts[4].trim())?;

    Ok(RuleDraft::new(
        or_wildcard(parts[0]),
        or_wildcard(parts[1]),
        or_wildcard(parts[2]),
        protocol,
        action,
    ))
}

fn or_wildcard(field: &str) -> &str {
    match field.trim() {
        "" => WILDCARD,
        s => s,
    }
}

/// Parse `type://host:port` or `type://host:port:username:password`.
///
/// `type` is `socks5` or `http`, case-insensitive.
pub fn parse_proxy_url(url: &str) -> Result<ProxyConfig> {
    let invalid = || Error::InvalidProxyUrl(url.to_string());

    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let proxy_type = ProxyType::parse(scheme).map_err(|_| invalid())?;

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() < 2 {
        return Err(invalid());
    }
    let port = pattern::parse_endpoint_port(parts[1]).map_err(|_| invalid())?;

    let config = ProxyConfig::new(proxy_type, parts[0], port);
    Ok(if parts.len() >= 4 {
        config.with_credentials(parts[2], parts[3])
    } else {
        config
    })
}
