//! SQL DDL for all memoria tables.
//!
//! Defines `memory_events` (the append-only event store), `vector_docs` and
//! `vector_docs_fts` (the rebuildable vector index), and `schema_meta`. All DDL
//! uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Event store, partitioned by session_id
CREATE TABLE IF NOT EXISTS memory_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL CHECK(length(session_id) > 0),
    agent_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    event_type TEXT NOT NULL CHECK(event_type IN ('user_input','endpoint_call','assistant_output','snapshot','error')),
    timestamp TEXT NOT NULL,
    ts_epoch INTEGER NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    response_data TEXT NOT NULL DEFAULT '{}',
    texto_semantico TEXT NOT NULL DEFAULT '' CHECK(length(texto_semantico) <= 10000),
    success INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_events_session_ts ON memory_events(session_id, ts_epoch DESC);
CREATE INDEX IF NOT EXISTS idx_events_agent ON memory_events(agent_id);
CREATE INDEX IF NOT EXISTS idx_events_endpoint ON memory_events(endpoint);
CREATE INDEX IF NOT EXISTS idx_events_type ON memory_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_ts ON memory_events(ts_epoch);

CREATE TRIGGER IF NOT EXISTS memory_events_no_update
BEFORE UPDATE ON memory_events
BEGIN
    SELECT RAISE(ABORT, 'memory_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS memory_events_no_delete
BEFORE DELETE ON memory_events
BEGIN
    SELECT RAISE(ABORT, 'memory_events is append-only');
END;

-- Vector index projection (rebuildable from memory_events)
CREATE TABLE IF NOT EXISTS vector_docs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    ts_epoch INTEGER NOT NULL,
    tipo TEXT NOT NULL,
    texto_semantico TEXT NOT NULL,
    exito INTEGER NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vector_docs_session ON vector_docs(session_id);
CREATE INDEX IF NOT EXISTS idx_vector_docs_endpoint ON vector_docs(endpoint);

-- Lexical fallback over the indexed text
CREATE VIRTUAL TABLE IF NOT EXISTS vector_docs_fts USING fts5(
    texto_semantico,
    id UNINDEXED
);

-- Schema metadata and consumer checkpoints
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
