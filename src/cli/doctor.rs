//! `memoria doctor`: database diagnostics.

use anyhow::{Context, Result};

use crate::config::MemoriaConfig;
use crate::db::{self, migrations};

use super::format_bytes;

pub fn doctor(config: &MemoriaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `memoria serve` once to create it.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;
    let profile = migrations::get_meta(&conn, "vector_profile")?;

    println!("memoria health report");
    println!("=====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!("Vector profile:    {}", profile.as_deref().unwrap_or("(not set)"));
    println!();
    println!("Embedding model:");
    println!("  Provider:        {}", config.embedding.provider);
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {}", config.embedding.model);
    match report.embedding_model {
        Some(ref stored) if stored != &config.embedding.model => {
            println!("  WARNING: model mismatch. Run `memoria reindex` to rebuild the vector index.");
        }
        Some(_) => println!("  Status:          OK (match)"),
        None => {}
    }
    println!();
    println!("Counts:");
    println!("  Events:          {}", report.event_count);
    println!("  Sessions:        {}", report.session_count);
    println!("  Vector docs:     {}", report.vector_doc_count);
    println!("  Indexer lag:     {} events", report.indexer_lag());
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("The vector index can be rebuilt with `memoria reindex`; events must be");
        println!("restored from a backup of {}.", db_path.display());
    }

    Ok(())
}
