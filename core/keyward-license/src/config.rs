//! Configuration for clients and the issuer host.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application directory name under the platform data dir.
pub const APP_DIR: &str = "keyward";

/// Default interval between Revocation Channel polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default timeout for a single Revocation Channel query.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default port of the issuer host's HTTP API.
pub const DEFAULT_SERVER_PORT: u16 = 8888;

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Client (verifier) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local token file.
    pub token_path: PathBuf,
    /// Base URL of the issuer host (e.g. `http://10.0.0.5:8888`).
    /// Remote revocation checks are disabled when unset.
    pub server_url: Option<String>,
    /// Interval between periodic revocation polls.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Timeout for a single revocation query.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token_path: data_dir().join("license.key"),
            server_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Issuer-side registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// SQLite database holding issued licenses.
    pub database_path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("licenses.db"),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
