//! Issuer-side durable store of every issued license.
//!
//! Backed by a single SQLite table. Every mutation is committed before the
//! call returns.
//!
//! Lookups accept the full registry key, the short id embedded in the
//! token, prefixes of either, or, failing all of those, the
//! `(device id, created_at)` pair carried by a bound token. The strategies
//! run in a fixed order (see [`LookupStrategy::CHAIN`]) and the first hit
//! wins. A prefix that matches more than one entry is ambiguous: lookups
//! move on to the next strategy, and `revoke`/`delete` refuse it.

use crate::clock::{SharedClock, SystemClock};
use crate::error::{LicenseError, LicenseResult};
use crate::record::{DurationClass, LicenseRecord, LicenseStatus, RecordParts};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Shortest identifier accepted for prefix matching.
pub const MIN_PREFIX_LEN: usize = 8;

/// A license as persisted by the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Primary key, generated independently of the short id.
    pub registry_id: String,
    /// The record as signed at issuance (plus usage/revocation bookkeeping).
    pub record: LicenseRecord,
    /// When the issuer revoked the license.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Last device seen verifying this license against the registry.
    pub last_device_id: Option<String>,
}

impl RegistryEntry {
    /// Projects the entry for administrative display at `now`.
    #[must_use]
    pub fn display_state(&self, now: DateTime<Utc>) -> DisplayState {
        if self.record.is_revoked() {
            DisplayState::Revoked
        } else if self.record.is_expired_at(now) {
            DisplayState::Expired
        } else {
            DisplayState::Active
        }
    }

    /// Builds the listing row shown to the operator.
    #[must_use]
    pub fn summary(&self, now: DateTime<Utc>) -> LicenseSummary {
        LicenseSummary {
            registry_id: self.registry_id.clone(),
            short_id: self.record.short_id().to_string(),
            duration: self.record.duration_class(),
            created_at: self.record.created_at(),
            expires_at: self.record.expires_at(),
            state: self.display_state(now),
            used: self.record.is_used(),
            used_at: self.record.used_at(),
            revoked_at: self.revoked_at,
            last_device_id: self.last_device_id.clone(),
        }
    }

    fn purge_reason(&self, now: DateTime<Utc>) -> Option<PurgeReason> {
        match self.display_state(now) {
            DisplayState::Revoked => Some(PurgeReason::Revoked),
            DisplayState::Expired => Some(PurgeReason::Expired),
            DisplayState::Active => None,
        }
    }
}

/// Administrative state shown in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayState {
    Active,
    Expired,
    Revoked,
}

/// One row of the administrative license listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseSummary {
    pub registry_id: String,
    pub short_id: String,
    pub duration: DurationClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub state: DisplayState,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_device_id: Option<String>,
}

enum Resolution {
    Found(LookupStrategy, RegistryEntry),
    /// Only prefixes matched, each more than one entry.
    Ambiguous(usize),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgeReason {
    Expired,
    Revoked,
}

/// What the caller knows about the license it is looking for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryQuery {
    /// Registry id, short id, or a prefix of either.
    pub id: Option<String>,
    /// Device the token is bound to.
    pub device_id: Option<String>,
    /// Creation instant embedded in the token.
    pub created_at: Option<DateTime<Utc>>,
}

impl RegistryQuery {
    /// Query by identifier only.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query describing a token's record: its short id plus the
    /// `(device, created_at)` fallback key when the token is bound.
    #[must_use]
    pub fn for_record(record: &LicenseRecord) -> Self {
        Self {
            id: Some(record.short_id().to_string()),
            device_id: record.bound_device_id().map(String::from),
            created_at: Some(record.created_at()),
        }
    }
}

/// A single way of matching a query against a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// Exact registry primary key.
    RegistryId,
    /// Exact short id.
    ShortId,
    /// The query is a prefix of the short id.
    ShortIdPrefix,
    /// The query is a prefix of the registry key (legacy display ids).
    RegistryIdPrefix,
    /// Bound device plus creation time.
    DeviceAndCreatedAt,
}

impl LookupStrategy {
    /// Resolution order; earlier strategies win.
    pub const CHAIN: [LookupStrategy; 5] = [
        Self::RegistryId,
        Self::ShortId,
        Self::ShortIdPrefix,
        Self::RegistryIdPrefix,
        Self::DeviceAndCreatedAt,
    ];

    /// Prefix strategies can match several entries at once.
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::ShortIdPrefix | Self::RegistryIdPrefix)
    }

    /// Returns true if `entry` satisfies this strategy for `query`.
    #[must_use]
    pub fn matches(&self, query: &RegistryQuery, entry: &RegistryEntry) -> bool {
        let id = query.id.as_deref().map(str::trim).filter(|id| !id.is_empty());
        let short_id = entry.record.short_id();

        match self {
            Self::RegistryId => id == Some(entry.registry_id.as_str()),
            Self::ShortId => id == Some(short_id),
            Self::ShortIdPrefix => {
                id.is_some_and(|id| id.len() >= MIN_PREFIX_LEN && short_id.starts_with(id))
            }
            Self::RegistryIdPrefix => id.is_some_and(|id| {
                id.len() >= MIN_PREFIX_LEN && entry.registry_id.starts_with(id)
            }),
            Self::DeviceAndCreatedAt => match (&query.device_id, query.created_at) {
                (Some(device), Some(created_at)) => {
                    let entry_device = entry
                        .record
                        .bound_device_id()
                        .or(entry.last_device_id.as_deref());
                    entry_device == Some(device.as_str())
                        && entry.record.created_at() == created_at
                }
                _ => false,
            },
        }
    }
}

/// The registry.
pub struct LicenseRegistry {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
}

impl LicenseRegistry {
    /// Opens (or creates) a registry at the given path.
    pub fn open(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            LicenseError::Registry(format!("failed to open registry {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory registry (for testing).
    pub fn open_in_memory() -> LicenseResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LicenseError::Registry(format!("failed to open in-memory registry: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> LicenseResult<Self> {
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    /// Replaces the clock used for expiry decisions and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the registry's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn lock(&self) -> LicenseResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LicenseError::Registry("registry lock poisoned".to_string()))
    }

    fn init_schema(&self) -> LicenseResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS licenses (
                registry_id TEXT PRIMARY KEY,
                short_id TEXT NOT NULL,
                bound_device_id TEXT,
                binding_requested INTEGER NOT NULL,
                duration_class TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                status TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                used_at TEXT,
                signature TEXT NOT NULL,
                revoked_at TEXT,
                last_device_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_licenses_short_id ON licenses(short_id);
            ",
        )
        .map_err(|e| LicenseError::Registry(format!("failed to init registry schema: {e}")))?;
        Ok(())
    }

    /// Persists a new entry.
    pub fn create(&self, entry: &RegistryEntry) -> LicenseResult<()> {
        let conn = self.lock()?;
        let record = &entry.record;
        conn.execute(
            "INSERT INTO licenses (registry_id, short_id, bound_device_id, binding_requested,
                duration_class, created_at, expires_at, status, used, used_at, signature,
                revoked_at, last_device_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.registry_id,
                record.short_id(),
                record.bound_device_id(),
                record.binding_requested(),
                record.duration_class().as_str(),
                fmt_ts(record.created_at()),
                record.expires_at().map(fmt_ts),
                record.status().as_str(),
                record.is_used(),
                record.used_at().map(fmt_ts),
                record.signature(),
                entry.revoked_at.map(fmt_ts),
                entry.last_device_id,
            ],
        )
        .map_err(|e| LicenseError::Registry(format!("failed to create license: {e}")))?;
        debug!(registry_id = %entry.registry_id, short_id = %record.short_id(), "registry entry created");
        Ok(())
    }

    /// Returns every entry, newest first.
    pub fn list(&self) -> LicenseResult<Vec<RegistryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT registry_id, short_id, bound_device_id, binding_requested, duration_class,
                    created_at, expires_at, status, used, used_at, signature, revoked_at,
                    last_device_id
             FROM licenses ORDER BY created_at DESC, registry_id",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(raw?.into_entry()?);
        }
        Ok(entries)
    }

    /// Administrative listing projection at the registry's current time.
    pub fn summaries(&self) -> LicenseResult<Vec<LicenseSummary>> {
        let now = self.now();
        Ok(self.list()?.iter().map(|e| e.summary(now)).collect())
    }

    /// Fetches an entry by its exact registry id.
    pub fn get(&self, registry_id: &str) -> LicenseResult<Option<RegistryEntry>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT registry_id, short_id, bound_device_id, binding_requested, duration_class,
                        created_at, expires_at, status, used, used_at, signature, revoked_at,
                        last_device_id
                 FROM licenses WHERE registry_id = ?1",
                params![registry_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Resolves a query through the strategy chain. Ambiguous prefixes are
    /// passed over.
    pub fn find(
        &self,
        query: &RegistryQuery,
    ) -> LicenseResult<Option<(LookupStrategy, RegistryEntry)>> {
        match self.resolve(query)? {
            Resolution::Found(strategy, entry) => Ok(Some((strategy, entry))),
            Resolution::Ambiguous(_) | Resolution::Missing => Ok(None),
        }
    }

    fn resolve(&self, query: &RegistryQuery) -> LicenseResult<Resolution> {
        let entries = self.list()?;
        let mut ambiguous = None;
        for strategy in LookupStrategy::CHAIN {
            let mut hits = entries.iter().filter(|e| strategy.matches(query, e));
            let Some(entry) = hits.next() else {
                continue;
            };
            if strategy.is_prefix() {
                let extra = hits.count();
                if extra > 0 {
                    debug!(?strategy, matches = extra + 1, "ambiguous registry prefix");
                    ambiguous.get_or_insert(extra + 1);
                    continue;
                }
            }
            debug!(?strategy, registry_id = %entry.registry_id, "registry lookup hit");
            return Ok(Resolution::Found(strategy, entry.clone()));
        }
        debug!(?query, "registry lookup miss");
        Ok(ambiguous.map_or(Resolution::Missing, Resolution::Ambiguous))
    }

    /// Lookup for administrative mutations: an ambiguous id is an error
    /// rather than a miss.
    fn resolve_for_update(&self, id: &str) -> LicenseResult<Option<RegistryEntry>> {
        match self.resolve(&RegistryQuery::by_id(id))? {
            Resolution::Found(_, entry) => Ok(Some(entry)),
            Resolution::Ambiguous(matches) => Err(LicenseError::AmbiguousId {
                id: id.trim().to_string(),
                matches,
            }),
            Resolution::Missing => Ok(None),
        }
    }

    /// Looks up by registry id, short id, or a prefix of either.
    pub fn find_by_short_or_registry_id(&self, id: &str) -> LicenseResult<Option<RegistryEntry>> {
        Ok(self.find(&RegistryQuery::by_id(id))?.map(|(_, entry)| entry))
    }

    /// Flags the license as used (first use timestamp is kept).
    pub fn mark_used(&self, registry_id: &str) -> LicenseResult<bool> {
        let now = fmt_ts(self.clock.now());
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE licenses SET used = 1, used_at = COALESCE(used_at, ?1) WHERE registry_id = ?2",
            params![now, registry_id],
        )?;
        Ok(changed > 0)
    }

    /// Records the device that last verified the license.
    pub fn note_device(&self, registry_id: &str, device_id: &str) -> LicenseResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE licenses SET last_device_id = ?1 WHERE registry_id = ?2",
            params![device_id, registry_id],
        )?;
        Ok(changed > 0)
    }

    /// Revokes the matching license. Returns false if nothing matched and
    /// [`LicenseError::AmbiguousId`] if a prefix matched several.
    ///
    /// Revoking an already revoked license is a no-op that still returns
    /// true; the original revocation time is kept.
    pub fn revoke(&self, id: &str) -> LicenseResult<bool> {
        let Some(entry) = self.resolve_for_update(id)? else {
            return Ok(false);
        };
        let now = fmt_ts(self.clock.now());
        let conn = self.lock()?;
        conn.execute(
            "UPDATE licenses SET status = ?1, revoked_at = COALESCE(revoked_at, ?2)
             WHERE registry_id = ?3",
            params![LicenseStatus::Revoked.as_str(), now, entry.registry_id],
        )?;
        info!(registry_id = %entry.registry_id, short_id = %entry.record.short_id(), "license revoked");
        Ok(true)
    }

    /// Hard-deletes the matching license. Returns false if nothing matched
    /// and [`LicenseError::AmbiguousId`] if a prefix matched several.
    pub fn delete(&self, id: &str) -> LicenseResult<bool> {
        let Some(entry) = self.resolve_for_update(id)? else {
            return Ok(false);
        };
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM licenses WHERE registry_id = ?1",
            params![entry.registry_id],
        )?;
        info!(registry_id = %entry.registry_id, "license deleted");
        Ok(changed > 0)
    }

    /// Counts `(expired, revoked)` entries without removing them.
    /// A revoked entry is counted as revoked even if it has also expired.
    pub fn count_expired_or_revoked(&self) -> LicenseResult<(usize, usize)> {
        let now = self.clock.now();
        let entries = self.list()?;
        Ok(tally(entries.iter().filter_map(|e| e.purge_reason(now))))
    }

    /// Removes every revoked or expired entry, returning `(expired, revoked)`.
    pub fn purge_expired_or_revoked(&self) -> LicenseResult<(usize, usize)> {
        let now = self.clock.now();
        let victims: Vec<(String, PurgeReason)> = self
            .list()?
            .into_iter()
            .filter_map(|e| e.purge_reason(now).map(|r| (e.registry_id, r)))
            .collect();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (registry_id, _) in &victims {
            tx.execute(
                "DELETE FROM licenses WHERE registry_id = ?1",
                params![registry_id],
            )?;
        }
        tx.commit()?;

        let counts = tally(victims.iter().map(|(_, r)| *r));
        info!(expired = counts.0, revoked = counts.1, "purged registry");
        Ok(counts)
    }
}

fn tally(reasons: impl Iterator<Item = PurgeReason>) -> (usize, usize) {
    reasons.fold((0, 0), |(expired, revoked), reason| match reason {
        PurgeReason::Expired => (expired + 1, revoked),
        PurgeReason::Revoked => (expired, revoked + 1),
    })
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(column: &str, value: &str) -> LicenseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LicenseError::Registry(format!("bad {column} timestamp '{value}': {e}")))
}

fn parse_opt_ts(column: &str, value: Option<String>) -> LicenseResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

/// Columns as stored, before parsing.
struct RawEntry {
    registry_id: String,
    short_id: String,
    bound_device_id: Option<String>,
    binding_requested: bool,
    duration_class: String,
    created_at: String,
    expires_at: Option<String>,
    status: String,
    used: bool,
    used_at: Option<String>,
    signature: String,
    revoked_at: Option<String>,
    last_device_id: Option<String>,
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        registry_id: row.get(0)?,
        short_id: row.get(1)?,
        bound_device_id: row.get(2)?,
        binding_requested: row.get(3)?,
        duration_class: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        status: row.get(7)?,
        used: row.get(8)?,
        used_at: row.get(9)?,
        signature: row.get(10)?,
        revoked_at: row.get(11)?,
        last_device_id: row.get(12)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> LicenseResult<RegistryEntry> {
        let duration_class = self
            .duration_class
            .parse::<DurationClass>()
            .map_err(LicenseError::Registry)?;
        let status = LicenseStatus::parse(&self.status)
            .ok_or_else(|| LicenseError::Registry(format!("bad status '{}'", self.status)))?;

        let record = LicenseRecord::restore(RecordParts {
            short_id: self.short_id,
            bound_device_id: self.bound_device_id,
            binding_requested: self.binding_requested,
            duration_class,
            created_at: parse_ts("created_at", &self.created_at)?,
            expires_at: parse_opt_ts("expires_at", self.expires_at)?,
            status,
            used: self.used,
            used_at: parse_opt_ts("used_at", self.used_at)?,
            signature: self.signature,
        });

        Ok(RegistryEntry {
            registry_id: self.registry_id,
            record,
            revoked_at: parse_opt_ts("revoked_at", self.revoked_at)?,
            last_device_id: self.last_device_id,
        })
    }
}
