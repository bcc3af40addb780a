//! The license record: the unit of authorization carried inside a token.
//!
//! A record is created by the [`Issuer`](crate::Issuer), signed by the
//! [`TokenCodec`](crate::TokenCodec), and mutated on the client by the
//! [`Verifier`](crate::Verifier) (binding, usage, revocation). Every
//! mutation must be followed by a re-sign, which is why the setters here are
//! crate-private.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters in a short license id.
pub const SHORT_ID_LEN: usize = 12;

/// Validity duration chosen at issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationClass {
    /// One minute (mostly for demos and testing).
    #[serde(rename = "1m")]
    OneMinute,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// One day.
    #[serde(rename = "1d")]
    OneDay,
    /// Seven days.
    #[serde(rename = "7d")]
    SevenDays,
    /// Thirty days.
    #[serde(rename = "30d")]
    ThirtyDays,
    /// Never expires.
    #[serde(rename = "perpetual")]
    Perpetual,
}

impl DurationClass {
    /// All classes, shortest first.
    pub const ALL: [DurationClass; 6] = [
        Self::OneMinute,
        Self::OneHour,
        Self::OneDay,
        Self::SevenDays,
        Self::ThirtyDays,
        Self::Perpetual,
    ];

    /// Returns the duration in seconds, or None for perpetual.
    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        match self {
            Self::OneMinute => Some(60),
            Self::OneHour => Some(60 * 60),
            Self::OneDay => Some(24 * 60 * 60),
            Self::SevenDays => Some(7 * 24 * 60 * 60),
            Self::ThirtyDays => Some(30 * 24 * 60 * 60),
            Self::Perpetual => None,
        }
    }

    /// Computes the expiry for a record created at `created_at`.
    #[must_use]
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration_secs()
            .map(|secs| created_at + Duration::seconds(secs))
    }

    /// Short label used on the wire and on the command line.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
            Self::Perpetual => "perpetual",
        }
    }
}

impl fmt::Display for DurationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DurationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
            .or(match normalized.as_str() {
                "never" | "forever" => Some(Self::Perpetual),
                _ => None,
            })
            .ok_or_else(|| {
                format!("unknown duration '{s}' (expected one of 1m, 1h, 1d, 7d, 30d, perpetual)")
            })
    }
}

/// Administrative status. The only transition is active -> revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// License is usable.
    Active,
    /// License was revoked by the issuer.
    Revoked,
}

impl LicenseStatus {
    /// Stable string form (also used as the registry column value).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// The signed license payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    short_id: String,
    bound_device_id: Option<String>,
    binding_requested: bool,
    duration_class: DurationClass,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status: LicenseStatus,
    used: bool,
    used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    signature: String,
}

impl LicenseRecord {
    /// Creates a fresh, unsigned, unbound, active record.
    ///
    /// `created_at` is truncated to whole seconds so the registry copy and
    /// the token copy compare equal.
    #[must_use]
    pub fn new(
        short_id: impl Into<String>,
        duration_class: DurationClass,
        binding_requested: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        let created_at = created_at.trunc_subsecs(0);
        Self {
            short_id: short_id.into(),
            bound_device_id: None,
            binding_requested,
            duration_class,
            created_at,
            expires_at: duration_class.expires_at(created_at),
            status: LicenseStatus::Active,
            used: false,
            used_at: None,
            signature: String::new(),
        }
    }

    /// Generates a new short id (12 hex chars of a random UUID).
    #[must_use]
    pub fn generate_short_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..SHORT_ID_LEN].to_string()
    }

    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    #[must_use]
    pub fn bound_device_id(&self) -> Option<&str> {
        self.bound_device_id.as_deref()
    }

    #[must_use]
    pub fn binding_requested(&self) -> bool {
        self.binding_requested
    }

    #[must_use]
    pub fn duration_class(&self) -> DurationClass {
        self.duration_class
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Expiry instant, or None for perpetual licenses.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    #[must_use]
    pub fn status(&self) -> LicenseStatus {
        self.status
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.status == LicenseStatus::Revoked
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used
    }

    #[must_use]
    pub fn used_at(&self) -> Option<DateTime<Utc>> {
        self.used_at
    }

    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Returns true if the record is past its expiry at `now`.
    /// Perpetual records never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    /// Human-readable expiry, `"never"` for perpetual.
    #[must_use]
    pub fn expiry_label(&self) -> String {
        match self.expires_at {
            Some(exp) => exp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "never".to_string(),
        }
    }

    pub(crate) fn set_signature(&mut self, signature: String) {
        self.signature = signature;
    }

    pub(crate) fn bind_to(&mut self, device_id: &str) {
        self.bound_device_id = Some(device_id.to_string());
    }

    /// One-way transition; there is deliberately no inverse.
    pub(crate) fn revoke(&mut self) {
        self.status = LicenseStatus::Revoked;
    }

    pub(crate) fn mark_used(&mut self, at: DateTime<Utc>) {
        if !self.used {
            self.used = true;
            self.used_at = Some(at);
        }
    }

    pub(crate) fn restore(parts: RecordParts) -> Self {
        Self {
            short_id: parts.short_id,
            bound_device_id: parts.bound_device_id,
            binding_requested: parts.binding_requested,
            duration_class: parts.duration_class,
            created_at: parts.created_at,
            expires_at: parts.expires_at,
            status: parts.status,
            used: parts.used,
            used_at: parts.used_at,
            signature: parts.signature,
        }
    }
}

/// Raw columns used by the registry to rebuild a record.
pub(crate) struct RecordParts {
    pub short_id: String,
    pub bound_device_id: Option<String>,
    pub binding_requested: bool,
    pub duration_class: DurationClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: LicenseStatus,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn short_id_is_twelve_hex_chars() {
        let id = LicenseRecord::generate_short_id();
        assert_eq!(id.len(), SHORT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn perpetual_has_no_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let record = LicenseRecord::new("abc", DurationClass::Perpetual, false, now);
        assert!(record.expires_at().is_none());
        assert!(!record.is_expired_at(now + Duration::days(365 * 100)));
    }

    #[test]
    fn created_at_is_truncated_to_seconds() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + Duration::milliseconds(750);
        let record = LicenseRecord::new("abc", DurationClass::OneHour, false, now);
        assert_eq!(record.created_at().timestamp_subsec_nanos(), 0);
        assert_eq!(
            record.expires_at(),
            Some(record.created_at() + Duration::hours(1))
        );
    }

    #[test]
    fn mark_used_keeps_first_timestamp() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut record = LicenseRecord::new("abc", DurationClass::OneDay, false, t0);
        record.mark_used(t0 + Duration::minutes(1));
        record.mark_used(t0 + Duration::minutes(5));
        assert_eq!(record.used_at(), Some(t0 + Duration::minutes(1)));
    }

    #[test]
    fn duration_class_parse() {
        assert_eq!("7d".parse::<DurationClass>(), Ok(DurationClass::SevenDays));
        assert_eq!(" 30D ".parse::<DurationClass>(), Ok(DurationClass::ThirtyDays));
        assert_eq!("never".parse::<DurationClass>(), Ok(DurationClass::Perpetual));
        assert!("2w".parse::<DurationClass>().is_err());
    }
}
