//! License issuance.

use crate::clock::{SharedClock, SystemClock};
use crate::codec::TokenCodec;
use crate::error::LicenseResult;
use crate::record::{DurationClass, LicenseRecord};
use crate::registry::{LicenseRegistry, RegistryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Result of issuing a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedLicense {
    /// The exported token, handed to the operator.
    pub token: String,
    /// Short id embedded in the token.
    pub short_id: String,
    /// Registry primary key of the persisted copy.
    pub registry_id: String,
    /// Expiry, or None for perpetual.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Mints, signs and persists new licenses.
pub struct Issuer {
    codec: TokenCodec,
    registry: Arc<LicenseRegistry>,
    clock: SharedClock,
}

impl Issuer {
    /// Creates an issuer writing to `registry` with the embedded secret.
    pub fn new(registry: Arc<LicenseRegistry>) -> Self {
        Self {
            codec: TokenCodec::default(),
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: TokenCodec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Issues a new license.
    ///
    /// The token is never bound at issuance, even when binding is requested:
    /// it binds to the first machine that verifies it. The registry copy gets
    /// its own freshly generated key and keeps the short id alongside it so
    /// revocation lookups by short id still resolve.
    pub fn issue(
        &self,
        duration_class: DurationClass,
        binding_requested: bool,
    ) -> LicenseResult<IssuedLicense> {
        let short_id = LicenseRecord::generate_short_id();
        let mut record =
            LicenseRecord::new(short_id.clone(), duration_class, binding_requested, self.clock.now());

        let token = self.codec.encode(&mut record)?;

        let entry = RegistryEntry {
            registry_id: uuid::Uuid::new_v4().to_string(),
            record,
            revoked_at: None,
            last_device_id: None,
        };
        self.registry.create(&entry)?;

        info!(
            short_id = %short_id,
            registry_id = %entry.registry_id,
            duration = %duration_class,
            binding_requested,
            "license issued"
        );

        Ok(IssuedLicense {
            token,
            short_id,
            registry_id: entry.registry_id,
            expires_at: entry.record.expires_at(),
        })
    }
}
