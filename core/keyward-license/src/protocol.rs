//! Wire types shared by the issuer host's HTTP API and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revocation Channel route (GET with `?license_id=` or POST with JSON).
pub const CHECK_LICENSE_PATH: &str = "/api/v1/check_license";

/// Connection/usage report route (POST to report, GET to list).
pub const CONNECTIONS_PATH: &str = "/api/v1/connections";

/// License listing route.
pub const LICENSES_PATH: &str = "/api/v1/licenses";

/// Body (or query) of a revocation check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckLicenseRequest {
    /// Short id, registry id, or a prefix of either.
    #[serde(default)]
    pub license_id: Option<String>,
}

/// Outcome class of an API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Revocation Channel answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckLicenseResponse {
    pub status: ResponseStatus,
    /// Only ever true when the registry positively holds a revoked record.
    pub revoked: bool,
    pub message: String,
}

impl CheckLicenseResponse {
    #[must_use]
    pub fn not_revoked(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            revoked: false,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn revoked() -> Self {
        Self {
            status: ResponseStatus::Ok,
            revoked: true,
            message: "license has been revoked".to_string(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            revoked: false,
            message: message.into(),
        }
    }
}

/// A client's report of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub device_id: String,
    pub license_short_id: String,
    /// Address the client believes it is reachable at; the server falls back
    /// to the peer address when empty.
    #[serde(default)]
    pub client_address: String,
}

/// A stored connection report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub device_id: String,
    pub license_short_id: String,
    pub client_address: String,
    pub reported_at: DateTime<Utc>,
}

/// Acknowledgement of a connection report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAck {
    pub status: ResponseStatus,
    pub message: String,
    pub reported_at: Option<DateTime<Utc>>,
}
