//! Error types for the licensing module.

use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// The token string is not a decodable license record.
    #[error("invalid license token format: {0}")]
    InvalidFormat(String),

    /// The recomputed signature does not match the embedded one.
    #[error("license signature mismatch (token has been tampered with)")]
    IntegrityMismatch,

    /// License has expired.
    #[error("license expired at {0}")]
    Expired(String),

    /// License revoked by the issuer.
    #[error("license has been revoked")]
    Revoked,

    /// No token has been installed on this machine.
    #[error("no license token found, please enter a license token")]
    NoToken,

    /// The revocation query produced no answer (timeout, refused, bad reply).
    #[error("revocation status indeterminate: {0}")]
    NetworkIndeterminate(String),

    /// Registry database error.
    #[error("registry error: {0}")]
    Registry(String),

    /// An identifier prefix matched more than one license.
    #[error("identifier '{id}' matches {matches} licenses; give more characters")]
    AmbiguousId { id: String, matches: usize },

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LicenseError {
    /// Returns true if the consuming application must stop offering service.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat(_) | Self::IntegrityMismatch | Self::Revoked
        )
    }

    /// Returns true if the application may prompt for a replacement token
    /// and re-run verification without restarting.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Expired(_) | Self::NoToken)
    }
}

impl From<rusqlite::Error> for LicenseError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Registry(err.to_string())
    }
}

impl From<std::io::Error> for LicenseError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
