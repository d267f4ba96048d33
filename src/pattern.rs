//! Pattern grammar for the free-text rule fields.
//!
//! A rule carries three match fields, each a list of tokens:
//!
//! - **process**: `chrome.exe`, `chr*.exe`, `*`, or several joined by `;`
//! - **host**: `*`, `10.0.0.1`, `10.0.0.0/8`, `192.168.*.*`, `example.com`,
//!   `*.example.com`, several joined by `;` or `,`
//! - **port**: `*`, `443`, `80-100`, several joined by `;` or `,`
//!
//! Validation never fails on empty input: an empty or whitespace-only field
//! normalizes to `*`. Host and port lists are re-joined with `;`.

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;

use crate::error::{ValidationError, ValidationReason};

/// Token that matches anything.
pub const WILDCARD: &str = "*";

/// Suffix appended to bare process names.
pub const EXECUTABLE_SUFFIX: &str = ".exe";

static PROCESS_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[A-Za-z0-9 ._\-*;"\\:()]+$"#).expect("static regex"));

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?$").expect("static regex"));

static HOST_GLOB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:*-]+$").expect("static regex"));

/// Which rule field a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Process,
    Host,
    Port,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Process => "process",
            FieldKind::Host => "host",
            FieldKind::Port => "port",
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single parsed host token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostToken {
    Any,
    Address(IpAddr),
    Network(IpNet),
    /// Glob with `*`, including dotted IP wildcards like `192.168.*.*`
    Glob(String),
    Name(String),
}

/// A single parsed port token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortToken {
    Any,
    Single(u16),
    /// Inclusive range
    Range(u16, u16),
}

/// Validate and normalize a field value.
pub fn validate(field: &str, kind: FieldKind) -> Result<String, ValidationError> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Ok(WILDCARD.to_string());
    }

    match kind {
        FieldKind::Process => validate_process(trimmed),
        FieldKind::Host => validate_list(trimmed, kind, |t| parse_host_token(t).map(|_| ())),
        FieldKind::Port => validate_list(trimmed, kind, |t| parse_port_token(t).map(|_| ())),
    }
}

fn validate_process(value: &str) -> Result<String, ValidationError> {
    if !PROCESS_CHARS.is_match(value) {
        return Err(ValidationError::new(
            FieldKind::Process,
            ValidationReason::InvalidCharacters(value.to_string()),
        ));
    }

    if value == WILDCARD {
        return Ok(value.to_string());
    }

    let lower = value.to_lowercase();
    let lower = lower.trim_matches('"');
    let has_suffix = lower.ends_with(EXECUTABLE_SUFFIX)
        || lower.contains(&format!("{} ", EXECUTABLE_SUFFIX));
    if has_suffix || value.contains(';') {
        Ok(value.to_string())
    } else {
        Ok(format!("{}{}", value, EXECUTABLE_SUFFIX))
    }
}

fn validate_list<F>(value: &str, kind: FieldKind, check: F) -> Result<String, ValidationError>
where
    F: Fn(&str) -> Result<(), ValidationReason>,
{
    let mut tokens = Vec::new();
    for token in split_tokens(value) {
        check(token).map_err(|reason| ValidationError::new(kind, reason))?;
        tokens.push(token);
    }

    if tokens.is_empty() {
        return Ok(WILDCARD.to_string());
    }
    Ok(tokens.join(";"))
}

/// Split a host or port list on `;` and `,`, skipping blank entries.
pub fn split_tokens(value: &str) -> impl Iterator<Item = &str> {
    value
        .split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Parse one host token.
pub fn parse_host_token(token: &str) -> Result<HostToken, ValidationReason> {
    if token == WILDCARD {
        return Ok(HostToken::Any);
    }
    if let Ok(addr) = token.parse::<IpAddr>() {
        return Ok(HostToken::Address(addr));
    }
    if let Ok(net) = token.parse::<IpNet>() {
        return Ok(HostToken::Network(net));
    }
    if token.contains('*') {
        if HOST_GLOB.is_match(token) {
            return Ok(HostToken::Glob(token.to_lowercase()));
        }
        return Err(ValidationReason::InvalidHost(token.to_string()));
    }
    if is_dns_name(token) {
        return Ok(HostToken::Name(token.to_lowercase()));
    }
    Err(ValidationReason::InvalidHost(token.to_string()))
}

/// Parse one port token.
pub fn parse_port_token(token: &str) -> Result<PortToken, ValidationReason> {
    if token == WILDCARD {
        return Ok(PortToken::Any);
    }

    if let Some((low, high)) = token.split_once('-') {
        let range_err = || ValidationReason::InvalidPortRange(token.to_string());
        let low = parse_port_number(low.trim()).map_err(|_| range_err())?;
        let high = parse_port_number(high.trim()).map_err(|_| range_err())?;
        if low > high {
            return Err(range_err());
        }
        return Ok(PortToken::Range(low, high));
    }

    parse_port_number(token).map(PortToken::Single)
}

fn parse_port_number(s: &str) -> Result<u16, ValidationReason> {
    match s.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ValidationReason::InvalidPort(s.to_string())),
    }
}

/// Syntactic DNS name check: dot-separated labels, at most 253 bytes.
///
/// An all-numeric last label is rejected so that malformed IPv4 literals
/// such as `999.999.999.999` are not taken for names.
pub fn is_dns_name(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let numeric_tld = name
        .rsplit('.')
        .next()
        .is_some_and(|label| label.bytes().all(|b| b.is_ascii_digit()));
    !numeric_tld && name.split('.').all(|label| DNS_LABEL.is_match(label))
}

/// Validate a proxy endpoint host: a literal IP address or a DNS name.
pub fn validate_endpoint_host(host: &str) -> Result<String, ValidationError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ValidationError::new(FieldKind::Host, ValidationReason::Required));
    }
    if host.parse::<IpAddr>().is_ok() || is_dns_name(host) {
        return Ok(host.to_string());
    }
    Err(ValidationError::new(
        FieldKind::Host,
        ValidationReason::InvalidHost(host.to_string()),
    ))
}

/// Validate a proxy endpoint port.
pub fn validate_endpoint_port(port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::new(
            FieldKind::Port,
            ValidationReason::InvalidPort(port.to_string()),
        ));
    }
    Ok(port)
}

/// Parse a proxy endpoint port from text.
pub fn parse_endpoint_port(port: &str) -> Result<u16, ValidationError> {
    parse_port_number(port.trim()).map_err(|reason| ValidationError::new(FieldKind::Port, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_normalizes_to_wildcard() {
        for kind in [FieldKind::Process, FieldKind::Host, FieldKind::Port] {
            assert_eq!(validate("", kind).unwrap(), "*");
            assert_eq!(validate("   ", kind).unwrap(), "*");
        }
        assert_eq!(validate(";,", FieldKind::Port).unwrap(), "*");
    }

    #[test]
    fn test_process_suffix_appended() {
        assert_eq!(validate("chrome", FieldKind::Process).unwrap(), "chrome.exe");
        assert_eq!(validate("chrome.exe", FieldKind::Process).unwrap(), "chrome.exe");
        assert_eq!(validate("Chrome.EXE", FieldKind::Process).unwrap(), "Chrome.EXE");
        assert_eq!(validate("chr*", FieldKind::Process).unwrap(), "chr*.exe");
        assert_eq!(validate("*", FieldKind::Process).unwrap(), "*");
    }

    #[test]
    fn test_process_multi_value_untouched() {
        assert_eq!(
            validate("chrome;firefox", FieldKind::Process).unwrap(),
            "chrome;firefox"
        );
        assert_eq!(
            validate("\"C:\\Program Files\\app.exe\"", FieldKind::Process).unwrap(),
            "\"C:\\Program Files\\app.exe\""
        );
    }

    #[test]
    fn test_process_invalid_characters() {
        let err = validate("chrome<script>", FieldKind::Process).unwrap_err();
        assert_eq!(err.field, FieldKind::Process);
        assert!(matches!(err.reason, ValidationReason::InvalidCharacters(_)));
        assert!(validate("a|b", FieldKind::Process).is_err());
    }

    #[test]
    fn test_host_tokens() {
        assert_eq!(parse_host_token("*").unwrap(), HostToken::Any);
        assert!(matches!(parse_host_token("10.0.0.1").unwrap(), HostToken::Address(_)));
        assert!(matches!(parse_host_token("::1").unwrap(), HostToken::Address(_)));
        assert!(matches!(parse_host_token("10.0.0.0/8").unwrap(), HostToken::Network(_)));
        assert!(matches!(parse_host_token("192.168.*.*").unwrap(), HostToken::Glob(_)));
        assert!(matches!(parse_host_token("*.example.com").unwrap(), HostToken::Glob(_)));
        assert_eq!(
            parse_host_token("Example.COM").unwrap(),
            HostToken::Name("example.com".into())
        );
        assert!(parse_host_token("bad host").is_err());
        assert!(parse_host_token("-bad.com").is_err());
        assert!(parse_host_token("a/b*").is_err());
    }

    #[test]
    fn test_host_list_normalized() {
        assert_eq!(
            validate("google.com, 10.0.0.1 ;*.example.org", FieldKind::Host).unwrap(),
            "google.com;10.0.0.1;*.example.org"
        );
        let err = validate("google.com;bad!host", FieldKind::Host).unwrap_err();
        assert_eq!(err.field, FieldKind::Host);
    }

    #[test]
    fn test_port_tokens() {
        assert_eq!(parse_port_token("*").unwrap(), PortToken::Any);
        assert_eq!(parse_port_token("443").unwrap(), PortToken::Single(443));
        assert_eq!(parse_port_token("80-100").unwrap(), PortToken::Range(80, 100));
        assert_eq!(parse_port_token("8080-8080").unwrap(), PortToken::Range(8080, 8080));
        assert!(matches!(
            parse_port_token("100-80"),
            Err(ValidationReason::InvalidPortRange(_))
        ));
        assert!(parse_port_token("0").is_err());
        assert!(parse_port_token("65536").is_err());
        assert!(parse_port_token("http").is_err());
    }

    #[test]
    fn test_port_list() {
        assert_eq!(validate("443;8443", FieldKind::Port).unwrap(), "443;8443");
        assert_eq!(validate("80, 443", FieldKind::Port).unwrap(), "80;443");
        assert_eq!(validate("1-1024;8080", FieldKind::Port).unwrap(), "1-1024;8080");
        assert!(validate("80;99999", FieldKind::Port).is_err());
    }

    #[test]
    fn test_quoted_path_keeps_suffix() {
        assert_eq!(
            validate("\"C:\\Tools\\App.EXE\"", FieldKind::Process).unwrap(),
            "\"C:\\Tools\\App.EXE\""
        );
    }

    #[test]
    fn test_numeric_names_rejected() {
        assert!(!is_dns_name("999.999.999.999"));
        assert!(!is_dns_name("10.0.0"));
        assert!(is_dns_name("1password.com"));
        assert!(is_dns_name("host-01"));
        assert!(parse_host_token("999.999.999.999").is_err());
        assert!(validate_endpoint_host("256.1.1.1").is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert_eq!(validate_endpoint_host(" 127.0.0.1 ").unwrap(), "127.0.0.1");
        assert!(validate_endpoint_host("proxy.example.com").is_ok());
        assert!(validate_endpoint_host("::1").is_ok());
        assert!(validate_endpoint_host("").is_err());
        assert!(validate_endpoint_host("*.example.com").is_err());
        assert!(validate_endpoint_port(0).is_err());
        assert_eq!(validate_endpoint_port(1080).unwrap(), 1080);
        assert_eq!(parse_endpoint_port("8080").unwrap(), 8080);
        assert!(parse_endpoint_port("70000").is_err());
    }
}
