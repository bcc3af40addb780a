//! Device fingerprinting for license binding.
//!
//! Generates a stable hardware fingerprint that identifies this device.
//! Tokens requesting binding are tied to the fingerprint of the first
//! machine that verifies them, and re-tied when they move to another one.
//!
//! Collecting identifiers shells out on some platforms, so the result is
//! memoized by [`FingerprintProvider`] for the lifetime of the process.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

/// Number of digest bytes kept in a fingerprint (hex-encoded to 32 chars).
const FINGERPRINT_BYTES: usize = 16;

/// A stable fingerprint that identifies this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    /// The fingerprint ID (hash of hardware identifiers).
    id: String,
}

impl DeviceFingerprint {
    /// Hashes identifier components into a fingerprint.
    ///
    /// An empty component list still yields a fingerprint (of the empty
    /// string) so callers never have to handle a missing device id.
    #[must_use]
    pub fn from_components<S: AsRef<str>>(components: &[S]) -> Self {
        let combined = components
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("|");

        let mut hasher = Sha256::new();
        hasher.update(combined.as_bytes());
        let hash = hasher.finalize();

        Self {
            id: hex::encode(&hash[..FINGERPRINT_BYTES]),
        }
    }

    /// Returns the fingerprint ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Supplies the raw identifiers a fingerprint is computed from.
pub trait FingerprintSource: Send + Sync {
    /// Returns identifier components in a stable order.
    fn components(&self) -> Vec<String>;
}

/// Reads identifiers from the running system: network adapter MAC,
/// OS-issued machine GUID, hostname and local account name.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFingerprintSource;

impl FingerprintSource for SystemFingerprintSource {
    fn components(&self) -> Vec<String> {
        collect_hardware_ids()
    }
}

/// A fixed identifier, for tests and for hosts that manage identity
/// themselves.
#[derive(Debug, Clone)]
pub struct StaticFingerprintSource(pub String);

impl FingerprintSource for StaticFingerprintSource {
    fn components(&self) -> Vec<String> {
        vec![self.0.clone()]
    }
}

/// Memoizing fingerprint provider.
///
/// The first call to [`get`](Self::get) computes the fingerprint; concurrent
/// callers block until that single computation finishes and then share the
/// result.
pub struct FingerprintProvider {
    source: Box<dyn FingerprintSource>,
    cached: OnceLock<DeviceFingerprint>,
}

impl FingerprintProvider {
    /// Creates a provider over the given source.
    pub fn new(source: impl FingerprintSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            cached: OnceLock::new(),
        }
    }

    /// Creates a provider reading the current machine.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemFingerprintSource)
    }

    /// Creates a provider that always reports a fingerprint derived from `id`.
    #[must_use]
    pub fn fixed(id: impl Into<String>) -> Self {
        Self::new(StaticFingerprintSource(id.into()))
    }

    /// Returns the (memoized) fingerprint.
    pub fn get(&self) -> &DeviceFingerprint {
        self.cached.get_or_init(|| {
            let components = self.source.components();
            let fingerprint = DeviceFingerprint::from_components(&components);
            debug!(
                components = components.len(),
                fingerprint = %fingerprint,
                "computed device fingerprint"
            );
            fingerprint
        })
    }

    /// Returns true once the fingerprint has been computed.
    #[must_use]
    pub fn is_computed(&self) -> bool {
        self.cached.get().is_some()
    }
}

impl fmt::Debug for FingerprintProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintProvider")
            .field("cached", &self.cached.get())
            .finish_non_exhaustive()
    }
}

/// Collects hardware identifiers for fingerprinting.
fn collect_hardware_ids() -> Vec<String> {
    let mut ids = Vec::new();

    // Network adapter (first physical-looking MAC)
    if let Some(mac) = get_mac_address() {
        ids.push(mac);
    }

    // Machine ID (platform-specific, very stable)
    if let Some(machine_id) = get_machine_id() {
        ids.push(machine_id);
    }

    // Hostname (can change but usually stable)
    ids.push(get_hostname());

    // Account name
    if let Ok(user) = env::var("USER").or_else(|_| env::var("USERNAME")) {
        ids.push(user);
    }

    ids
}

/// Gets the machine hostname.
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rejects unset, broadcast and all-zero addresses.
fn is_usable_mac(mac: &str) -> bool {
    let hex: String = mac.chars().filter(char::is_ascii_hexdigit).collect();
    hex.len() == 12 && hex.chars().any(|c| c != '0') && !hex.chars().all(|c| c == 'f' || c == 'F')
}

/// Gets the first usable network adapter MAC address.
fn get_mac_address() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let mut entries: Vec<_> = std::fs::read_dir("/sys/class/net")
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "lo")
            .collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        entries
            .iter()
            .filter_map(|e| std::fs::read_to_string(e.path().join("address")).ok())
            .map(|s| s.trim().to_ascii_lowercase())
            .find(|mac| is_usable_mac(mac))
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ifconfig")
            .arg("en0")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .map(str::trim)
                    .find(|l| l.starts_with("ether "))
                    .map(|l| l.trim_start_matches("ether ").trim().to_ascii_lowercase())
            })
            .filter(|mac| is_usable_mac(mac))
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("getmac")
            .args(["/fo", "csv", "/nh"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .filter_map(|l| l.split(',').next())
                    .map(|s| s.trim_matches('"').to_ascii_lowercase())
                    .find(|mac| is_usable_mac(mac))
            })
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}

/// Gets the machine ID (platform-specific unique identifier).
fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ioreg")
            .args(["-rd1", "-c", "IOPlatformExpertDevice"])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("IOPlatformUUID"))
                    .and_then(|l| l.split('"').nth(3))
                    .map(String::from)
            })
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    #[cfg(target_os = "windows")]
    {
        // HKLM\SOFTWARE\Microsoft\Cryptography\MachineGuid
        std::process::Command::new("reg")
            .args([
                "query",
                r"HKLM\SOFTWARE\Microsoft\Cryptography",
                "/v",
                "MachineGuid",
            ])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|output| {
                output
                    .lines()
                    .find(|l| l.contains("MachineGuid"))
                    .and_then(|l| l.split_whitespace().last())
                    .map(String::from)
            })
            .filter(|guid| guid.len() > 10)
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}
