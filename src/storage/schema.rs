//! Database schema for the local health store.

/// SQL schema for the session summary table.
pub const SCHEMA: &str = r#"
-- Completed session summaries
CREATE TABLE IF NOT EXISTS session_summaries (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    active_seconds REAL NOT NULL,
    distance_meters REAL NOT NULL,
    energy_kcal REAL NOT NULL,
    avg_heart_rate INTEGER,
    max_heart_rate INTEGER,
    avg_speed_mps REAL,
    route_json TEXT NOT NULL,
    heart_rate_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_summaries_started_at ON session_summaries(started_at);
"#;

/// SQL for creating the schema version tracking table.
pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;
