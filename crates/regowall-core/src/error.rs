//! Shared error type across regowall crates.

use thiserror::Error;

/// Stable error categories (used for logs, metrics labels and HTTP mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incomplete policy event.
    Validation,
    /// Address could not be parsed into an IPv4/IPv6 canonical form.
    InvalidAddress,
    /// A policy's rule source failed to compile.
    Compilation,
    /// Publishing to or consuming from the distribution channel failed.
    Channel,
    /// The policy evaluator failed at request time.
    Evaluation,
    /// Startup configuration is unusable.
    Config,
    /// Internal invariant broken.
    Internal,
}

impl ErrorKind {
    /// String representation used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::InvalidAddress => "INVALID_ADDRESS",
            ErrorKind::Compilation => "COMPILATION",
            ErrorKind::Channel => "CHANNEL",
            ErrorKind::Evaluation => "EVALUATION",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RegowallError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum RegowallError {
    #[error("invalid policy event: {0}")]
    Validation(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("policy {policy} failed to compile: {reason}")]
    Compilation { policy: String, reason: String },
    #[error("channel: {0}")]
    Channel(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RegowallError {
    /// Map the error to its stable category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegowallError::Validation(_) => ErrorKind::Validation,
            RegowallError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            RegowallError::Compilation { .. } => ErrorKind::Compilation,
            RegowallError::Channel(_) => ErrorKind::Channel,
            RegowallError::Evaluation(_) => ErrorKind::Evaluation,
            RegowallError::Config(_) => ErrorKind::Config,
            RegowallError::Internal(_) => ErrorKind::Internal,
        }
    }
}
