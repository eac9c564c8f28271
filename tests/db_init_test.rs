use memoria::db;
use memoria::memory::embedding_to_bytes;
use rusqlite::Connection;

fn fresh() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    db::schema::init_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

#[test]
fn full_schema_creates_all_tables_and_indexes() {
    let conn = fresh();

    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    for table in ["memory_events", "vector_docs", "vector_docs_fts", "schema_meta"] {
        assert!(tables.contains(&table.to_string()), "{table} table missing");
    }

    let indexes: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(indexes.contains(&"idx_events_session_ts".to_string()));
    assert!(indexes.contains(&"idx_vector_docs_session".to_string()));

    let version = db::migrations::get_schema_version(&conn).unwrap();
    assert_eq!(version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert_eq!(
        db::migrations::get_meta(&conn, "indexer_cursor").unwrap().as_deref(),
        Some("0")
    );
}

#[test]
fn vec_distance_is_available_on_blobs() {
    let conn = fresh();
    let a: Vec<f32> = vec![1.0, 0.0, 0.0, 0.0];
    let b: Vec<f32> = vec![0.0, 1.0, 0.0, 0.0];

    let same: f64 = conn
        .query_row(
            "SELECT vec_distance_cosine(?1, ?1)",
            [embedding_to_bytes(&a)],
            |r| r.get(0),
        )
        .unwrap();
    assert!(same.abs() < 1e-6);

    let orthogonal: f64 = conn
        .query_row(
            "SELECT vec_distance_cosine(?1, ?2)",
            [embedding_to_bytes(&a), embedding_to_bytes(&b)],
            |r| r.get(0),
        )
        .unwrap();
    assert!((orthogonal - 1.0).abs() < 1e-6);
}

#[test]
fn event_checks_reject_bad_rows() {
    let conn = fresh();
    let bad_type = conn.execute(
        "INSERT INTO memory_events (id, session_id, agent_id, endpoint, event_type, timestamp, ts_epoch, success) \
         VALUES ('e1', 's1', 'a', 'ep', 'telemetry', '2026-01-01T00:00:00.000Z', 0, 1)",
        [],
    );
    assert!(bad_type.is_err(), "unknown event_type should be rejected by CHECK constraint");

    let long_text = "x".repeat(10_001);
    let too_long = conn.execute(
        "INSERT INTO memory_events (id, session_id, agent_id, endpoint, event_type, timestamp, ts_epoch, texto_semantico, success) \
         VALUES ('e2', 's1', 'a', 'ep', 'snapshot', '2026-01-01T00:00:00.000Z', 0, ?1, 1)",
        [long_text],
    );
    assert!(too_long.is_err(), "texto_semantico over 10000 chars should be rejected");
}

#[test]
fn health_check_counts_and_lag() {
    let conn = fresh();
    for (i, session) in ["s1", "s1", "s2"].iter().enumerate() {
        conn.execute(
            "INSERT INTO memory_events (id, session_id, agent_id, endpoint, event_type, timestamp, ts_epoch, success) \
             VALUES (?1, ?2, 'a', 'ep', 'endpoint_call', '2026-01-01T00:00:00.000Z', 0, 1)",
            [format!("e{i}"), session.to_string()],
        )
        .unwrap();
    }
    db::migrations::set_meta(&conn, "indexer_cursor", "1").unwrap();

    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.event_count, 3);
    assert_eq!(report.session_count, 2);
    assert_eq!(report.vector_doc_count, 0);
    assert_eq!(report.last_event_seq, 3);
    assert_eq!(report.indexer_lag(), 2);
}
