//! License issuance and verification for Keyward.
//!
//! This crate handles:
//! - Minting signed, time-bounded license tokens and keeping the issuer's
//!   registry of them
//! - Offline verification of a token on the consuming machine
//! - Hardware fingerprinting for bind-on-first-use and device transfer
//! - Revocation, both from the local token and by polling the issuer host
//!
//! # Design Principles
//!
//! - **Offline-first**: a token verifies with no network at all; the
//!   revocation poll only ever tightens the local decision
//! - **Tamper-evident**: every record field is covered by an HMAC keyed with
//!   a secret shared by issuer and verifier builds
//! - **Transferable**: a bound token follows the operator to a new machine
//!   instead of locking them out
//!
//! # Token Format
//!
//! Tokens are `base64url(json(record))` without padding. See [`TokenCodec`].

mod clock;
mod codec;
mod config;
mod device;
mod error;
mod issuer;
mod protocol;
mod record;
mod registry;
mod store;
mod verifier;

#[cfg(feature = "online")]
mod report;
#[cfg(feature = "online")]
mod revocation;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::TokenCodec;
pub use config::{
    APP_DIR, ClientConfig, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_PORT,
    RegistryConfig,
};
pub use device::{
    DeviceFingerprint, FingerprintProvider, FingerprintSource, StaticFingerprintSource,
    SystemFingerprintSource,
};
pub use error::{LicenseError, LicenseResult};
pub use issuer::{IssuedLicense, Issuer};
pub use protocol::{
    CHECK_LICENSE_PATH, CONNECTIONS_PATH, CheckLicenseRequest, CheckLicenseResponse,
    ConnectionAck, ConnectionRecord, ConnectionReport, LICENSES_PATH, ResponseStatus,
};
pub use record::{DurationClass, LicenseRecord, LicenseStatus, SHORT_ID_LEN};
pub use registry::{
    DisplayState, LicenseRegistry, LicenseSummary, LookupStrategy, MIN_PREFIX_LEN,
    RegistryEntry, RegistryQuery,
};
pub use store::{TokenFileGuard, TokenStore};
pub use verifier::{
    CheckOutcome, Disposition, TamperKind, VerificationState, Verified, Verifier,
};

#[cfg(feature = "online")]
pub use report::UsageReporter;
#[cfg(feature = "online")]
pub use revocation::{
    PollOutcome, RevocationAnswer, RevocationClient, RevocationWatcher, SessionState, poll_once,
};
