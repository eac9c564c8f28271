//! Background indexer: folds the event store's change feed into the vector index.
//!
//! Each pass reads events after the index checkpoint, skips those whose
//! `texto_semantico` is too short or cannot be embedded, projects the rest to
//! [`VectorDoc`]s, and uploads them a batch at a time. The checkpoint moves only
//! after a batch is uploaded, so a failed upload is retried on the next pass.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::IndexerConfig;
use crate::embedding::Embedder;
use crate::error::StoreError;
use crate::memory::index::VectorIndex;
use crate::memory::store::EventStore;
use crate::memory::types::VectorDoc;

/// Counters for one indexing pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped_short: usize,
    pub skipped_no_embedding: usize,
    pub skipped_invalid: usize,
}

impl IndexReport {
    fn absorb(&mut self, other: IndexReport) {
        self.scanned += other.scanned;
        self.indexed += other.indexed;
        self.skipped_short += other.skipped_short;
        self.skipped_no_embedding += other.skipped_no_embedding;
        self.skipped_invalid += other.skipped_invalid;
    }
}

pub struct Indexer {
    store: Arc<dyn EventStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<Embedder>,
    batch_size: usize,
    min_chars: usize,
    poll_interval: Duration,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn EventStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            batch_size: config.batch_size.max(1),
            min_chars: config.min_index_chars,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
        }
    }

    /// Drain the change feed from the current checkpoint.
    pub async fn run_once(&self) -> Result<IndexReport, StoreError> {
        let mut cursor = self.index.checkpoint().await?;
        let mut report = IndexReport::default();

        loop {
            let batch = self.store.changes_since(cursor, self.batch_size).await?;
            let Some(last) = batch.last().map(|c| c.seq) else {
                break;
            };
            let full = batch.len() == self.batch_size;

            let mut pass = IndexReport::default();
            let mut docs = Vec::new();
            for change in batch {
                pass.scanned += 1;
                let event = change.event;
                let texto = event.texto_semantico.trim();
                if texto.is_empty() || texto.chars().count() < self.min_chars {
                    pass.skipped_short += 1;
                    continue;
                }
                let Some(vector) = self.embedder.embed(texto).await else {
                    tracing::debug!(event_id = %event.id, "no embedding, left to filter-only queries");
                    pass.skipped_no_embedding += 1;
                    continue;
                };
                match VectorDoc::project(&event, vector) {
                    Some(doc) => docs.push(doc),
                    None => {
                        tracing::warn!(event_id = %event.id, timestamp = %event.timestamp, "unparseable timestamp, not indexed");
                        pass.skipped_invalid += 1;
                    }
                }
            }

            if !docs.is_empty() {
                pass.indexed = self.index.upload(&docs).await?;
            }
            self.index.set_checkpoint(last).await?;
            cursor = last;
            report.absorb(pass);

            if !full {
                break;
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                indexed = report.indexed,
                skipped_short = report.skipped_short,
                skipped_no_embedding = report.skipped_no_embedding,
                checkpoint = cursor,
                "indexer pass complete"
            );
        }
        Ok(report)
    }

    /// Rebuild the index from scratch by replaying the whole change feed.
    pub async fn reindex(&self) -> Result<IndexReport, StoreError> {
        tracing::info!("clearing vector index for rebuild");
        self.index.clear().await?;
        self.run_once().await
    }

    /// Run passes on every store notification or poll tick until `shutdown`
    /// becomes `true` (or its sender is dropped).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let notify = self.store.change_notifier();
        tracing::info!(poll_ms = self.poll_interval.as_millis() as u64, "indexer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                tracing::warn!(error = %e, "indexer pass failed, will retry");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wait_for(notify.as_deref()) => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("indexer stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

async fn wait_for(notify: Option<&Notify>) {
    match notify {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}
