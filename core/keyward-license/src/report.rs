//! Best-effort connection/usage reporting to the issuer host.
//!
//! Verification never depends on a report being delivered.

use crate::error::{LicenseError, LicenseResult};
use crate::protocol::{CONNECTIONS_PATH, ConnectionReport};
use crate::revocation::http_client;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Sends [`ConnectionReport`]s to the issuer host.
#[derive(Debug, Clone)]
pub struct UsageReporter {
    client: Client,
    base_url: String,
}

impl UsageReporter {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> LicenseResult<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Delivers one report.
    pub async fn report(&self, report: &ConnectionReport) -> LicenseResult<()> {
        let url = format!("{}{}", self.base_url, CONNECTIONS_PATH);
        let response = self
            .client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|e| LicenseError::NetworkIndeterminate(format!("usage report failed: {e}")))?;

        if !response.status().is_success() {
            return Err(LicenseError::NetworkIndeterminate(format!(
                "usage report returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Delivers a report in the background; failures are only logged.
    pub fn report_detached(&self, report: ConnectionReport) {
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.report(&report).await {
                debug!(error = %e, "usage report not delivered");
            }
        });
    }
}
