//! Operator-visible log of client connection reports.
//!
//! One row per `(device, license)` pair; a new report from the same pair
//! replaces the previous one.

use chrono::{DateTime, SecondsFormat, Utc};
use keyward_license::{ConnectionRecord, ConnectionReport, LicenseError, LicenseResult};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// SQLite-backed connection log.
#[derive(Clone)]
pub struct ConnectionLog {
    conn: Arc<Mutex<Connection>>,
}

impl ConnectionLog {
    /// Opens (or creates) the log at the given path.
    pub fn open(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| LicenseError::Storage(format!("failed to open connection log: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory log (for testing).
    pub fn open_in_memory() -> LicenseResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            LicenseError::Storage(format!("failed to open in-memory connection log: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> LicenseResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS connections (
                device_id TEXT NOT NULL,
                license_short_id TEXT NOT NULL,
                client_address TEXT NOT NULL,
                reported_at TEXT NOT NULL,
                PRIMARY KEY (device_id, license_short_id)
            );
            ",
        )
        .map_err(|e| LicenseError::Storage(format!("failed to init connection schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> LicenseResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LicenseError::Storage("connection log lock poisoned".to_string()))
    }

    /// Stores a report stamped with `reported_at`.
    pub fn record(
        &self,
        report: &ConnectionReport,
        reported_at: DateTime<Utc>,
    ) -> LicenseResult<ConnectionRecord> {
        let record = ConnectionRecord {
            device_id: report.device_id.clone(),
            license_short_id: report.license_short_id.clone(),
            client_address: report.client_address.clone(),
            reported_at,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO connections (device_id, license_short_id, client_address, reported_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id, license_short_id)
             DO UPDATE SET client_address = excluded.client_address,
                           reported_at = excluded.reported_at",
            params![
                record.device_id,
                record.license_short_id,
                record.client_address,
                record.reported_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(|e| LicenseError::Storage(format!("failed to save connection: {e}")))?;

        debug!(device = %record.device_id, license = %record.license_short_id, "connection recorded");
        Ok(record)
    }

    /// Returns every report, newest first.
    pub fn list(&self) -> LicenseResult<Vec<ConnectionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT device_id, license_short_id, client_address, reported_at
                 FROM connections ORDER BY reported_at DESC",
            )
            .map_err(|e| LicenseError::Storage(format!("failed to query connections: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| LicenseError::Storage(format!("failed to query connections: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (device_id, license_short_id, client_address, reported_at) =
                row.map_err(|e| LicenseError::Storage(format!("failed to read connection: {e}")))?;
            let reported_at = DateTime::parse_from_rfc3339(&reported_at)
                .map_err(|e| LicenseError::Storage(format!("bad reported_at '{reported_at}': {e}")))?
                .with_timezone(&Utc);
            records.push(ConnectionRecord {
                device_id,
                license_short_id,
                client_address,
                reported_at,
            });
        }
        Ok(records)
    }
}
