//! Revocation Channel client and the periodic revocation watcher.
//!
//! An unanswered query (refused, timed out, non-success status, garbage
//! body) is reported as [`LicenseError::NetworkIndeterminate`] and never as
//! a revocation; the previous local decision stands.

use crate::config::ClientConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::protocol::{CHECK_LICENSE_PATH, CheckLicenseRequest, CheckLicenseResponse};
use crate::verifier::Verifier;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub(crate) fn http_client(timeout: Duration) -> LicenseResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| LicenseError::NetworkIndeterminate(format!("failed to create HTTP client: {e}")))
}

/// The issuer host's answer about one license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationAnswer {
    pub revoked: bool,
    pub message: String,
}

/// Queries the issuer host's Revocation Channel.
#[derive(Debug, Clone)]
pub struct RevocationClient {
    client: Client,
    base_url: String,
}

impl RevocationClient {
    /// Creates a client for the issuer host at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> LicenseResult<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Creates a client from configuration, or None if no server is set.
    pub fn from_config(config: &ClientConfig) -> LicenseResult<Option<Self>> {
        config
            .server_url
            .as_deref()
            .map(|url| Self::new(url, config.request_timeout))
            .transpose()
    }

    /// Asks whether `license_id` is revoked.
    pub async fn check(&self, license_id: &str) -> LicenseResult<RevocationAnswer> {
        let url = format!("{}{}", self.base_url, CHECK_LICENSE_PATH);
        let body = CheckLicenseRequest {
            license_id: Some(license_id.to_string()),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LicenseError::NetworkIndeterminate(format!("revocation query failed: {e}")))?;

        if !response.status().is_success() {
            return Err(LicenseError::NetworkIndeterminate(format!(
                "revocation query returned HTTP {}",
                response.status()
            )));
        }

        let answer: CheckLicenseResponse = response.json().await.map_err(|e| {
            LicenseError::NetworkIndeterminate(format!("invalid revocation response: {e}"))
        })?;

        debug!(license_id, revoked = answer.revoked, "revocation query answered");
        Ok(RevocationAnswer {
            revoked: answer.revoked,
            message: answer.message,
        })
    }
}

/// Session state published by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Revoked,
}

/// Result of a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The issuer host answered: not revoked.
    NotRevoked,
    /// Revoked, either already in the local token or per the issuer host.
    Revoked,
    /// No answer, or the local token could not be read; nothing changed.
    Indeterminate,
    /// No token is installed.
    NoToken,
}

/// Runs one revocation poll for the installed token.
///
/// On a positive answer the local token is marked revoked (on a blocking
/// thread, since it rewrites the token file).
pub async fn poll_once(verifier: &Arc<Verifier>, client: &RevocationClient) -> PollOutcome {
    let reader = Arc::clone(verifier);
    let record = match tokio::task::spawn_blocking(move || reader.current_record()).await {
        Ok(Ok(Some(record))) => record,
        Ok(Ok(None)) => return PollOutcome::NoToken,
        Ok(Err(e)) => {
            warn!(error = %e, "cannot read local token for revocation check");
            return PollOutcome::Indeterminate;
        }
        Err(e) => {
            warn!(error = %e, "revocation check task failed");
            return PollOutcome::Indeterminate;
        }
    };

    if record.is_revoked() {
        return PollOutcome::Revoked;
    }

    match client.check(record.short_id()).await {
        Ok(answer) if answer.revoked => {
            let writer = Arc::clone(verifier);
            match tokio::task::spawn_blocking(move || writer.apply_remote_revocation()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to persist remote revocation"),
                Err(e) => warn!(error = %e, "revocation persist task failed"),
            }
            info!(short_id = %record.short_id(), "issuer reports license revoked");
            PollOutcome::Revoked
        }
        Ok(_) => PollOutcome::NotRevoked,
        Err(e) => {
            warn!(error = %e, "revocation status unknown; keeping previous decision");
            PollOutcome::Indeterminate
        }
    }
}

/// Background task polling the Revocation Channel on an interval and on
/// demand. Polls run one after another, so at most one query is in flight;
/// triggers that arrive during a query collapse into one follow-up poll.
/// Polling stops once the license is revoked.
pub struct RevocationWatcher {
    trigger: Arc<Notify>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl RevocationWatcher {
    /// Starts the watcher. The first poll runs immediately.
    pub fn spawn(verifier: Arc<Verifier>, client: RevocationClient, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(SessionState::Active);
        let trigger = Arc::new(Notify::new());
        let task = tokio::spawn(run_watcher(
            verifier,
            client,
            interval,
            Arc::clone(&trigger),
            tx,
        ));
        Self {
            trigger,
            state: rx,
            task,
        }
    }

    /// Requests an immediate poll.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver that observes session state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Resolves once the license has been found revoked (true) or the
    /// polling task has ended without finding it revoked (false).
    pub async fn revoked(&mut self) -> bool {
        self.state
            .wait_for(|state| *state == SessionState::Revoked)
            .await
            .is_ok()
    }

    /// Stops polling.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for RevocationWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_watcher(
    verifier: Arc<Verifier>,
    client: RevocationClient,
    interval: Duration,
    trigger: Arc<Notify>,
    state: watch::Sender<SessionState>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => debug!("on-demand revocation check"),
        }

        if poll_once(&verifier, &client).await == PollOutcome::Revoked {
            state.send_replace(SessionState::Revoked);
            break;
        }
    }
}
