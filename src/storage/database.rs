//! Local durable store built on rusqlite.
//!
//! Session summaries are stored one row each, with the route and heart-rate
//! series serialized to JSON columns. The table carries a schema version so
//! later releases can migrate in place.

use crate::samples::{HeartRateSample, PositionFix, SessionKind};
use crate::session::SessionSummary;
use crate::storage::health_store::{HealthStore, StoreError, StoredId};
use crate::storage::schema::{CURRENT_VERSION, SCHEMA, SCHEMA_VERSION_TABLE};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// SQLite-backed health store.
pub struct SqliteHealthStore {
    conn: Mutex<Connection>,
}

impl SqliteHealthStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))
    }

    /// Create the schema, migrating from older versions when needed.
    fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_VERSION_TABLE)?;

        let current: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current < CURRENT_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?, datetime('now'))",
                [CURRENT_VERSION],
            )?;
            tracing::info!("health store migrated to schema version {CURRENT_VERSION}");
        }
        Ok(())
    }
}

impl HealthStore for SqliteHealthStore {
    fn write_summary(&self, summary: &SessionSummary) -> Result<StoredId, StoreError> {
        let route_json = serde_json::to_string(&summary.route)?;
        let hr_json = serde_json::to_string(&summary.heart_rate_samples)?;
        let metadata_json = serde_json::to_string(&summary.source_metadata)?;

        let conn = self.lock()?;
        // ON CONFLICT keeps the first write; duplicate summary ids never
        // create a second record.
        conn.execute(
            "INSERT INTO session_summaries (
                id, kind, started_at, ended_at, active_seconds, distance_meters,
                energy_kcal, avg_heart_rate, max_heart_rate, avg_speed_mps,
                route_json, heart_rate_json, metadata_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO NOTHING",
            params![
                summary.id.to_string(),
                kind_to_token(summary.kind)?,
                summary.started_at.to_rfc3339(),
                summary.ended_at.to_rfc3339(),
                summary.active_duration.as_secs_f64(),
                summary.total_distance_meters,
                summary.estimated_energy_kcal,
                summary.avg_heart_rate,
                summary.max_heart_rate,
                summary.avg_speed_mps,
                route_json,
                hr_json,
                metadata_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(summary.id)
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, started_at, ended_at, active_seconds, distance_meters,
                    energy_kcal, avg_heart_rate, max_heart_rate, avg_speed_mps,
                    route_json, heart_rate_json, metadata_json
             FROM session_summaries
             ORDER BY started_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RawSummaryRow {
                id: row.get(0)?,
                kind: row.get(1)?,
                started_at: row.get(2)?,
                ended_at: row.get(3)?,
                active_seconds: row.get(4)?,
                distance_meters: row.get(5)?,
                energy_kcal: row.get(6)?,
                avg_heart_rate: row.get(7)?,
                max_heart_rate: row.get(8)?,
                avg_speed_mps: row.get(9)?,
                route_json: row.get(10)?,
                heart_rate_json: row.get(11)?,
                metadata_json: row.get(12)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?.into_summary()?);
        }
        Ok(summaries)
    }

    fn contains(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM session_summaries WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Raw row values before decoding.
struct RawSummaryRow {
    id: String,
    kind: String,
    started_at: String,
    ended_at: String,
    active_seconds: f64,
    distance_meters: f64,
    energy_kcal: f64,
    avg_heart_rate: Option<u16>,
    max_heart_rate: Option<u16>,
    avg_speed_mps: Option<f64>,
    route_json: String,
    heart_rate_json: String,
    metadata_json: String,
}

impl RawSummaryRow {
    fn into_summary(self) -> Result<SessionSummary, StoreError> {
        let route: Vec<PositionFix> = serde_json::from_str(&self.route_json)?;
        let heart_rate_samples: Vec<HeartRateSample> =
            serde_json::from_str(&self.heart_rate_json)?;
        let source_metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata_json)?;

        Ok(SessionSummary {
            id: Uuid::parse_str(&self.id).map_err(|e| StoreError::Malformed(e.to_string()))?,
            kind: kind_from_token(&self.kind)?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: parse_timestamp(&self.ended_at)?,
            active_duration: Duration::from_secs_f64(self.active_seconds),
            total_distance_meters: self.distance_meters,
            estimated_energy_kcal: self.energy_kcal,
            avg_heart_rate: self.avg_heart_rate,
            max_heart_rate: self.max_heart_rate,
            avg_speed_mps: self.avg_speed_mps,
            route,
            heart_rate_samples,
            source_metadata,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(e.to_string()))
}

/// The kind's serde token, e.g. "strength_training".
fn kind_to_token(kind: SessionKind) -> Result<String, StoreError> {
    match serde_json::to_value(kind)? {
        serde_json::Value::String(token) => Ok(token),
        other => Err(StoreError::Malformed(format!(
            "unexpected kind encoding: {other}"
        ))),
    }
}

fn kind_from_token(token: &str) -> Result<SessionKind, StoreError> {
    serde_json::from_value(serde_json::Value::String(token.to_string()))
        .map_err(|e| StoreError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_summary() -> SessionSummary {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut source_metadata = BTreeMap::new();
        source_metadata.insert("engine_version".to_string(), "test".to_string());
        SessionSummary {
            id: Uuid::new_v4(),
            kind: SessionKind::Running,
            started_at: started,
            ended_at: started + chrono::Duration::minutes(30),
            active_duration: Duration::from_secs(1700),
            total_distance_meters: 5012.5,
            estimated_energy_kcal: 310.0,
            avg_heart_rate: Some(151),
            max_heart_rate: Some(174),
            avg_speed_mps: Some(2.95),
            route: vec![PositionFix::new(48.85, 2.35, 5.0, started)],
            heart_rate_samples: vec![HeartRateSample::new(151, started)],
            source_metadata,
        }
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let store = SqliteHealthStore::open_in_memory().unwrap();
        let summary = sample_summary();

        let id = store.write_summary(&summary).unwrap();
        assert_eq!(id, summary.id);

        let read = store.read_recent(10).unwrap();
        assert_eq!(read.len(), 1);
        let back = &read[0];
        assert_eq!(back.id, summary.id);
        assert_eq!(back.kind, summary.kind);
        assert_eq!(back.started_at, summary.started_at);
        assert!((back.total_distance_meters - summary.total_distance_meters).abs() < 1e-9);
        assert!(
            (back.active_duration.as_secs_f64() - summary.active_duration.as_secs_f64()).abs()
                < 1e-6
        );
        assert_eq!(back.route.len(), 1);
        assert_eq!(back.source_metadata, summary.source_metadata);
    }

    #[test]
    fn test_duplicate_write_keeps_one_record() {
        let store = SqliteHealthStore::open_in_memory().unwrap();
        let summary = sample_summary();

        store.write_summary(&summary).unwrap();
        store.write_summary(&summary).unwrap();

        assert_eq!(store.read_recent(10).unwrap().len(), 1);
        assert!(store.contains(summary.id).unwrap());
    }

    #[test]
    fn test_read_recent_orders_most_recent_first() {
        let store = SqliteHealthStore::open_in_memory().unwrap();

        let mut older = sample_summary();
        older.id = Uuid::new_v4();
        older.started_at = Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap();
        let newer = sample_summary();

        store.write_summary(&older).unwrap();
        store.write_summary(&newer).unwrap();

        let read = store.read_recent(10).unwrap();
        assert_eq!(read[0].id, newer.id);
        assert_eq!(read[1].id, older.id);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.db");
        let store = SqliteHealthStore::open(&path).unwrap();
        store.write_summary(&sample_summary()).unwrap();
        drop(store);

        let reopened = SqliteHealthStore::open(&path).unwrap();
        assert_eq!(reopened.read_recent(10).unwrap().len(), 1);
    }
}
