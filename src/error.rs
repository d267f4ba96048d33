//! Error types for procroute.

use thiserror::Error;

use crate::gateway::Operation;
use crate::pattern::FieldKind;

/// Error type for procroute operations.
#[derive(Error, Debug)]
pub enum Error {
    /// One or more rule or proxy fields failed validation
    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The enforcement engine refused the operation; local state is unchanged
    #[error("enforcement engine rejected {operation}")]
    EngineRejected { operation: Operation },

    /// Rule or proxy config identifier is not present
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u32 },

    /// Target position outside `1..=len`
    #[error("position {position} out of range 1..={len}")]
    PositionOutOfRange { position: u32, len: usize },

    /// Rule references a proxy config that does not exist
    #[error("unknown proxy config: {0}")]
    UnknownProxyConfig(u32),

    /// PROXY rule created while no proxy config is registered
    #[error("PROXY action requires a registered proxy config")]
    MissingProxyConfig,

    /// Proxy config registry is at capacity
    #[error("proxy config registry is full ({0} entries)")]
    RegistryFull(usize),

    /// Invalid protocol token
    #[error("invalid protocol: {0}. Use TCP, UDP, or BOTH")]
    InvalidProtocol(String),

    /// Invalid action token
    #[error("invalid action: {0}. Use PROXY, DIRECT, or BLOCK")]
    InvalidAction(String),

    /// Invalid proxy type token
    #[error("invalid proxy type: {0}. Use SOCKS5 or HTTP")]
    InvalidProxyType(String),

    /// Malformed single-line rule
    #[error("invalid rule format: {0}. Expected process:hosts:ports:protocol:action")]
    InvalidRuleFormat(String),

    /// Malformed proxy URL
    #[error("invalid proxy format: {0}. Use type://host:port or type://host:port:username:password")]
    InvalidProxyUrl(String),

    /// Malformed bulk import file
    #[error("invalid rule file: {0}")]
    InvalidImport(String),

    /// Persisted snapshot could not be written or read
    #[error("persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Field-scoped validation errors, if this is a validation failure.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Error::Validation(errors) => errors,
            _ => &[],
        }
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(vec![e])
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for procroute operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A validation failure scoped to a single field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: FieldKind,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(field: FieldKind, reason: ValidationReason) -> Self {
        Self { field, reason }
    }
}

/// Why a field was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    /// Characters outside the accepted set
    #[error("invalid characters in {0:?}")]
    InvalidCharacters(String),

    /// Host token is neither an address, a DNS name nor a glob
    #[error("invalid host {0:?}")]
    InvalidHost(String),

    /// Port token is not a number in 1..=65535
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// Range with low > high or malformed bounds
    #[error("invalid port range {0:?}")]
    InvalidPortRange(String),

    /// Field must not be empty (proxy endpoint host)
    #[error("value is required")]
    Required,
}
