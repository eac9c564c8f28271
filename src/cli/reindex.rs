//! `memoria reindex`: rebuild the vector index from the event store.

use anyhow::{Context, Result};

use crate::config::MemoriaConfig;
use crate::db::migrations;
use crate::services::MemoryServices;

pub async fn reindex(config: MemoriaConfig) -> Result<()> {
    let services = MemoryServices::open(config)?;
    anyhow::ensure!(
        services.embedder.is_available(),
        "no embedding provider is configured (embedding.provider = \"{}\"); nothing to index",
        services.config.embedding.provider
    );

    let started = std::time::Instant::now();
    let report = services.indexer().reindex().await.context("reindex failed")?;

    if let (Some(db), Some(model)) = (services.db(), services.embedder.model()) {
        let conn = db.lock().map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        migrations::set_embedding_model(&conn, model, services.embedder.dimensions())?;
    }

    println!("Reindex complete in {:.1}s", started.elapsed().as_secs_f64());
    println!("  Scanned:               {}", report.scanned);
    println!("  Indexed:               {}", report.indexed);
    println!("  Skipped (too short):   {}", report.skipped_short);
    println!("  Skipped (no vector):   {}", report.skipped_no_embedding);
    println!("  Skipped (invalid):     {}", report.skipped_invalid);
    if report.skipped_no_embedding > 0 {
        println!();
        println!("Some events could not be embedded; run reindex again once the provider is reachable.");
    }
    Ok(())
}
