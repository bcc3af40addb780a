//! Client-side token verification.
//!
//! A verification pass walks the stored token through:
//!
//! 1. decode (failure: tampered, format)
//! 2. signature check (failure: tampered, integrity)
//! 3. registry consultation, when requested and a registry is attached
//!    (revoked there: persist the revocation locally, then revoked)
//! 4. expiry (perpetual tokens skip this)
//! 5. device binding: bind on first use, rebind on a new machine
//! 6. embedded status (revoked without any network access)
//! 7. usage flag, then persist the token
//! 8. valid
//!
//! Device changes are never a rejection reason; a token that moves to a new
//! machine is re-signed for that machine.

use crate::clock::{SharedClock, SystemClock};
use crate::codec::TokenCodec;
use crate::config::ClientConfig;
use crate::device::FingerprintProvider;
use crate::error::{LicenseError, LicenseResult};
use crate::record::LicenseRecord;
use crate::registry::{LicenseRegistry, LookupStrategy, RegistryQuery};
use crate::store::{TokenFileGuard, TokenStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a token was classified as tampered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TamperKind {
    /// The token could not be decoded.
    Format,
    /// The signature did not match.
    Integrity,
}

/// States of the verification state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Unverified,
    Tampered(TamperKind),
    Expired,
    Revoked,
    /// The token was moved to this machine during the pass (not terminal).
    MachineRebound,
    Valid,
}

/// What the consuming application should do with a verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Keep offering service.
    Proceed,
    /// Ask for a replacement token and verify again; no restart needed.
    PromptForToken,
    /// Stop offering service now.
    Terminate,
    /// Local I/O trouble; try again later.
    Retry,
}

/// A successful verification.
#[derive(Debug, Clone)]
pub struct Verified {
    /// The token's record after binding/usage updates.
    pub record: LicenseRecord,
    /// True if the token was moved from another device during this pass.
    pub rebound: bool,
    /// How the registry copy was found, when the registry was consulted.
    pub registry_match: Option<LookupStrategy>,
}

/// Flattened verification result for gating decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub valid: bool,
    pub reason: String,
    /// Terminal state of the pass.
    pub state: VerificationState,
    /// Every state visited, starting at `Unverified`.
    pub trail: Vec<VerificationState>,
    pub disposition: Disposition,
    /// Short id of the verified token, when one could be decoded.
    pub short_id: Option<String>,
}

impl CheckOutcome {
    fn from_result(
        result: LicenseResult<Verified>,
        mut trail: Vec<VerificationState>,
    ) -> Self {
        match result {
            Ok(verified) => {
                trail.push(VerificationState::Valid);
                let reason = if verified.rebound {
                    "license verified (transferred to this device)".to_string()
                } else {
                    "license verified".to_string()
                };
                Self {
                    valid: true,
                    reason,
                    state: VerificationState::Valid,
                    trail,
                    disposition: Disposition::Proceed,
                    short_id: Some(verified.record.short_id().to_string()),
                }
            }
            Err(err) => {
                let state = state_for_error(&err);
                if state != VerificationState::Unverified {
                    trail.push(state);
                }
                let disposition = if err.is_fatal() {
                    Disposition::Terminate
                } else if err.is_recoverable() {
                    Disposition::PromptForToken
                } else {
                    Disposition::Retry
                };
                Self {
                    valid: false,
                    reason: err.to_string(),
                    state,
                    trail,
                    disposition,
                    short_id: None,
                }
            }
        }
    }

    /// Returns true if the token moved to this device during the pass.
    #[must_use]
    pub fn rebound(&self) -> bool {
        self.trail.contains(&VerificationState::MachineRebound)
    }
}

fn state_for_error(err: &LicenseError) -> VerificationState {
    match err {
        LicenseError::InvalidFormat(_) => VerificationState::Tampered(TamperKind::Format),
        LicenseError::IntegrityMismatch => VerificationState::Tampered(TamperKind::Integrity),
        LicenseError::Expired(_) => VerificationState::Expired,
        LicenseError::Revoked => VerificationState::Revoked,
        _ => VerificationState::Unverified,
    }
}

/// Verifies the locally installed token.
pub struct Verifier {
    codec: TokenCodec,
    store: TokenStore,
    fingerprint: Arc<FingerprintProvider>,
    registry: Option<Arc<LicenseRegistry>>,
    clock: SharedClock,
}

impl Verifier {
    /// Creates a verifier over `store` using the system fingerprint, the
    /// embedded secret and wall-clock time.
    pub fn new(store: TokenStore) -> Self {
        Self {
            codec: TokenCodec::default(),
            store,
            fingerprint: Arc::new(FingerprintProvider::system()),
            registry: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a verifier from client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(TokenStore::new(config.token_path.clone()))
    }

    #[must_use]
    pub fn with_codec(mut self, codec: TokenCodec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: Arc<FingerprintProvider>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Attaches a locally reachable registry (issuer host installs).
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<LicenseRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The token file this verifier reads and writes.
    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Fingerprint of the machine this verifier runs on.
    #[must_use]
    pub fn device_id(&self) -> &str {
        self.fingerprint.get().id()
    }

    /// Runs a verification pass and flattens the result.
    ///
    /// With `consult_registry = false` the pass is fully offline.
    pub fn check_valid(&self, consult_registry: bool) -> CheckOutcome {
        let mut trail = vec![VerificationState::Unverified];
        let result = self.verify_with_trail(consult_registry, &mut trail);
        CheckOutcome::from_result(result, trail)
    }

    /// Runs a verification pass, returning the verified record.
    pub fn verify(&self, consult_registry: bool) -> LicenseResult<Verified> {
        let mut trail = vec![VerificationState::Unverified];
        self.verify_with_trail(consult_registry, &mut trail)
    }

    fn verify_with_trail(
        &self,
        consult_registry: bool,
        trail: &mut Vec<VerificationState>,
    ) -> LicenseResult<Verified> {
        let guard = self.store.lock()?;
        self.run_pass(&guard, consult_registry, trail)
    }

    /// Installs a token entered by the operator and verifies it.
    ///
    /// Undecodable or tampered tokens are rejected before anything is
    /// written, so they never replace a working token. Neither does an
    /// unrevoked copy of a license whose installed token is revoked.
    pub fn activate(&self, token: &str, consult_registry: bool) -> CheckOutcome {
        let mut trail = vec![VerificationState::Unverified];
        let result = self.install(token, consult_registry, &mut trail);
        CheckOutcome::from_result(result, trail)
    }

    fn install(
        &self,
        token: &str,
        consult_registry: bool,
        trail: &mut Vec<VerificationState>,
    ) -> LicenseResult<Verified> {
        let record = self.codec.decode_verified(token).inspect_err(|err| {
            warn!(error = %err, "rejected license token on activation");
        })?;

        let guard = self.store.lock()?;
        self.ensure_not_unrevoking(&guard, &record)?;
        guard.write(token.trim())?;
        self.run_pass(&guard, consult_registry, trail)
    }

    /// Decodes and authenticates the installed token without mutating it.
    pub fn current_record(&self) -> LicenseResult<Option<LicenseRecord>> {
        self.store
            .read()?
            .map(|token| self.codec.decode_verified(&token))
            .transpose()
    }

    /// Marks the installed token revoked after the Revocation Channel
    /// reported it so. The revoked token is re-signed so later offline
    /// passes still see a valid signature and report revocation.
    pub fn apply_remote_revocation(&self) -> LicenseResult<()> {
        let guard = self.store.lock()?;
        let token = guard.read()?.ok_or(LicenseError::NoToken)?;
        let mut record = self.codec.decode_verified(&token)?;
        if record.is_revoked() {
            return Ok(());
        }
        record.revoke();
        let token = self.codec.encode(&mut record)?;
        guard.write(&token)?;
        info!(short_id = %record.short_id(), "license revoked by issuer; local token updated");
        Ok(())
    }

    fn run_pass(
        &self,
        guard: &TokenFileGuard<'_>,
        consult_registry: bool,
        trail: &mut Vec<VerificationState>,
    ) -> LicenseResult<Verified> {
        let token = guard.read()?.ok_or(LicenseError::NoToken)?;

        // 1. format
        let mut record = self.codec.decode(&token).inspect_err(|e| {
            warn!(error = %e, "license token is not decodable");
        })?;

        // 2. integrity
        if !self.codec.verify_signature(&record) {
            warn!(short_id = %record.short_id(), "license signature mismatch");
            return Err(LicenseError::IntegrityMismatch);
        }

        // 3. registry
        let mut registry_hit = None;
        if consult_registry {
            if let Some(registry) = &self.registry {
                match registry.find(&RegistryQuery::for_record(&record)) {
                    Ok(Some((strategy, entry))) if entry.record.is_revoked() => {
                        debug!(?strategy, "registry reports license revoked");
                        self.persist_revocation(guard, &mut record);
                        return Err(LicenseError::Revoked);
                    }
                    Ok(Some((strategy, entry))) => {
                        registry_hit = Some((strategy, entry.registry_id));
                    }
                    Ok(None) => {
                        debug!(short_id = %record.short_id(), "license not in registry; relying on token");
                    }
                    Err(e) => {
                        warn!(error = %e, "registry unavailable; continuing offline");
                    }
                }
            }
        }

        // 4. expiry
        let now = self.clock.now();
        if record.is_expired_at(now) {
            return Err(LicenseError::Expired(record.expiry_label()));
        }

        // 5. binding
        let mut rebound = false;
        if record.binding_requested() {
            let device = self.fingerprint.get().id();
            match record.bound_device_id() {
                None => {
                    record.bind_to(device);
                    info!(short_id = %record.short_id(), device, "license bound to device");
                }
                Some(bound) if bound != device => {
                    info!(short_id = %record.short_id(), from = bound, to = device, "license moved to new device");
                    record.bind_to(device);
                    rebound = true;
                    trail.push(VerificationState::MachineRebound);
                }
                Some(_) => {}
            }
        }

        // 6. embedded status
        if record.is_revoked() {
            return Err(LicenseError::Revoked);
        }

        // 7. usage + persist
        record.mark_used(now);
        self.ensure_not_unrevoking(guard, &record)?;
        let token = self.codec.encode(&mut record)?;
        if let Err(e) = guard.write(&token) {
            warn!(error = %e, "failed to persist verified token");
        }

        let registry_match = registry_hit.map(|(strategy, registry_id)| {
            self.record_usage(&registry_id, record.bound_device_id());
            strategy
        });

        Ok(Verified {
            record,
            rebound,
            registry_match,
        })
    }

    /// Fails with [`LicenseError::Revoked`] if the token file currently
    /// holds a revoked copy of the same license and `record` is not revoked.
    /// Revocation is one-way, so such a write is refused.
    fn ensure_not_unrevoking(
        &self,
        guard: &TokenFileGuard<'_>,
        record: &LicenseRecord,
    ) -> LicenseResult<()> {
        if record.is_revoked() {
            return Ok(());
        }
        let Some(current) = guard.read()? else {
            return Ok(());
        };
        match self.codec.decode_verified(&current) {
            Ok(on_disk) if on_disk.is_revoked() && on_disk.short_id() == record.short_id() => {
                warn!(short_id = %record.short_id(), "refusing to replace a revoked token");
                Err(LicenseError::Revoked)
            }
            _ => Ok(()),
        }
    }

    fn persist_revocation(&self, guard: &TokenFileGuard<'_>, record: &mut LicenseRecord) {
        record.revoke();
        match self.codec.encode(record) {
            Ok(token) => {
                if let Err(e) = guard.write(&token) {
                    warn!(error = %e, "failed to persist revoked token");
                }
            }
            Err(e) => warn!(error = %e, "failed to re-sign revoked token"),
        }
    }

    fn record_usage(&self, registry_id: &str, device_id: Option<&str>) {
        let Some(registry) = &self.registry else {
            return;
        };
        if let Err(e) = registry.mark_used(registry_id) {
            warn!(error = %e, "failed to mark license used in registry");
        }
        if let Some(device) = device_id {
            if let Err(e) = registry.note_device(registry_id, device) {
                warn!(error = %e, "failed to record device in registry");
            }
        }
    }
}
