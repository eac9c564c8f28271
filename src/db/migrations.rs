//! Versioned upgrades of the memoria schema and the `schema_meta` key/value helpers.
//!
//! [`schema::init_schema`](super::schema::init_schema) lays down version 1. Each
//! later version is one entry in [`STEPS`], applied in order inside its own
//! transaction together with the version bump.

use rusqlite::{Connection, OptionalExtension};

/// Version this build writes and expects to read.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(target_version, step)`, ascending.
const STEPS: &[(u32, Step)] = &[(2, seed_indexer_cursor), (3, add_history_index)];

/// Read a `schema_meta` value.
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM schema_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()
}

/// Insert or replace a `schema_meta` value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Stored schema version; 0 if the marker is missing or unreadable.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    Ok(get_meta(conn, "schema_version")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    get_meta(conn, "embedding_model")
}

/// Record which model produced the indexed vectors, and its dimension.
pub fn set_embedding_model(conn: &Connection, model: &str, dimensions: usize) -> rusqlite::Result<()> {
    set_meta(conn, "embedding_model", model)?;
    set_meta(conn, "embedding_dimensions", &dimensions.to_string())
}

/// Apply every step above the stored version. A database written by a newer
/// build is left untouched.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    let stored = get_schema_version(conn)?;
    if stored > CURRENT_SCHEMA_VERSION {
        tracing::warn!(stored, supported = CURRENT_SCHEMA_VERSION, "database schema is newer than this build");
        return Ok(());
    }

    for (version, step) in STEPS.iter().filter(|(version, _)| *version > stored) {
        tracing::info!(from = stored, to = version, "applying schema migration");
        let tx = conn.unchecked_transaction()?;
        step(&tx)?;
        set_meta(&tx, "schema_version", &version.to_string())?;
        tx.commit()?;
    }
    Ok(())
}

/// v2: the indexer consumes the change feed from sequence 0.
fn seed_indexer_cursor(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('indexer_cursor', '0')",
        [],
    )?;
    Ok(())
}

/// v3: history queries filter a session by event type before ordering by time.
fn add_history_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_events_session_type_ts \
         ON memory_events(session_id, event_type, ts_epoch DESC);",
    )
}
