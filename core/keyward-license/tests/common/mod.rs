//! Shared test helpers for license tests.

#![allow(dead_code)]

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use keyward_license::{
    FingerprintProvider, Issuer, LicenseRegistry, ManualClock, TokenCodec, TokenStore, Verifier,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Secret used by every test codec.
pub const TEST_SECRET: &[u8] = b"keyward-test-secret";

pub fn test_codec() -> TokenCodec {
    TokenCodec::with_secret(TEST_SECRET)
}

/// A fixed starting instant for simulated clocks.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap()
}

/// Issuer-side fixture: in-memory registry plus an issuer on a manual clock.
pub struct IssuerFixture {
    pub clock: ManualClock,
    pub registry: Arc<LicenseRegistry>,
    pub issuer: Issuer,
}

pub fn issuer_fixture() -> IssuerFixture {
    let clock = ManualClock::new(epoch());
    let registry = Arc::new(
        LicenseRegistry::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone())),
    );
    let issuer = Issuer::new(Arc::clone(&registry))
        .with_codec(test_codec())
        .with_clock(Arc::new(clock.clone()));
    IssuerFixture {
        clock,
        registry,
        issuer,
    }
}

/// A client install: its own temp dir, token file and device identity.
pub struct ClientFixture {
    pub dir: TempDir,
    pub token_path: PathBuf,
}

impl ClientFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("license.key");
        Self { dir, token_path }
    }

    /// Builds an offline verifier for `device` sharing `clock`.
    pub fn verifier(&self, device: &str, clock: &ManualClock) -> Verifier {
        Verifier::new(TokenStore::new(self.token_path.clone()))
            .with_codec(test_codec())
            .with_fingerprint(Arc::new(FingerprintProvider::fixed(device)))
            .with_clock(Arc::new(clock.clone()))
    }

    pub fn install(&self, token: &str) {
        std::fs::write(&self.token_path, token).unwrap();
    }

    pub fn stored_token(&self) -> String {
        std::fs::read_to_string(&self.token_path).unwrap()
    }
}

/// Decodes a token to raw JSON for tamper tests.
pub fn token_json(token: &str) -> serde_json::Value {
    let bytes = URL_SAFE_NO_PAD.decode(token.trim()).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Re-encodes raw JSON as a token without re-signing.
pub fn json_token(value: &serde_json::Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
}
