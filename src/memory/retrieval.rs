//! Memory retrieval: builds the per-request [`WorkingContext`].
//!
//! Recent-by-time events come from the event store (warm from the cache when
//! possible), recent-by-relevance documents from the vector index. Vector hits
//! lead, time hits backfill, and the merged view is capped. When no embedding is
//! available the relevance step falls back to lexical search.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::StoreError;
use crate::memory::cache::{memoria_key, ContextCache};
use crate::memory::dedup_key;
use crate::memory::index::VectorIndex;
use crate::memory::query::{EventFilter, EventQuery, VectorFilter};
use crate::memory::store::EventStore;
use crate::memory::summarize::summarize_context;
use crate::memory::types::{Identity, MemoryEvent, VectorHit, WorkingContext};

/// What the retriever returns alongside the context.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub context: WorkingContext,
    /// A hint was given but could not be embedded; relevance used text search.
    pub embedding_unavailable: bool,
    /// The recent-by-time base came from the cache.
    pub cache_hit: bool,
    /// The relevance step failed; the context holds time-ordered events only.
    pub partial: bool,
}

/// Cached recent-by-time base for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedBase {
    recientes: Vec<MemoryEvent>,
    total: u64,
}

pub struct MemoryRetriever {
    store: Arc<dyn EventStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<Embedder>,
    cache: Arc<ContextCache>,
    config: RetrievalConfig,
}

impl MemoryRetriever {
    pub fn new(
        store: Arc<dyn EventStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        cache: Arc<ContextCache>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            cache,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        identity: &Identity,
        hint: Option<&str>,
    ) -> Result<RetrievalOutcome, StoreError> {
        let session_id = identity.session_id.as_str();
        let key = memoria_key(session_id);

        let cached = self
            .cache
            .get(&key)
            .and_then(|v| serde_json::from_value::<CachedBase>(v).ok());
        let cache_hit = cached.is_some();

        let base = match cached {
            Some(base) => base,
            None => {
                let query = EventQuery::new(EventFilter {
                    min_text_len: Some(self.config.min_text_len),
                    ..EventFilter::for_session(session_id)
                })
                .limit(self.config.recent_limit);
                let recientes = self.store.query(&query).await?;
                let total = self.store.count(&EventFilter::for_session(session_id)).await?;
                let base = CachedBase { recientes, total };
                if let Ok(value) = serde_json::to_value(&base) {
                    self.cache.set(&key, value);
                }
                base
            }
        };

        let mut embedding_unavailable = false;
        let mut partial = false;
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());
        let hits = match hint {
            None => Vec::new(),
            Some(text) => {
                let vector = self.embedder.embed(text).await;
                embedding_unavailable = vector.is_none();
                match self.relevant(identity, text, vector.as_deref()).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "relevance search failed, using time-ordered context");
                        partial = true;
                        Vec::new()
                    }
                }
            }
        };

        let (docs_vectoriales, interacciones_recientes) =
            merge(hits, base.recientes, self.config.max_context_items);

        let ultima_actividad = latest_timestamp(&interacciones_recientes, &docs_vectoriales);
        let resumen_conversacion = summarize_context(&interacciones_recientes, &docs_vectoriales);

        tracing::debug!(
            session_id,
            recientes = interacciones_recientes.len(),
            vectoriales = docs_vectoriales.len(),
            cache_hit,
            "working context built"
        );

        Ok(RetrievalOutcome {
            context: WorkingContext {
                session_id: identity.session_id.clone(),
                agent_id: identity.agent_id.clone(),
                interacciones_recientes,
                docs_vectoriales,
                resumen_conversacion,
                ultima_actividad,
                total_interacciones_sesion: base.total,
                memoria_aplicada: base.total > 0,
                fuente_identidad: identity.source,
            },
            embedding_unavailable,
            cache_hit,
            partial,
        })
    }

    /// Relevance-ranked documents for `text`. Trusted identities search their own
    /// session; others search globally with near-duplicate collapsing.
    async fn relevant(
        &self,
        identity: &Identity,
        text: &str,
        vector: Option<&[f32]>,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let k = self.config.vector_top_k;
        let trusted = identity.source.is_trusted();
        let filter = if trusted {
            VectorFilter::for_session(identity.session_id.clone())
        } else {
            VectorFilter::default()
        };
        let fetch = if trusted { k } else { k.saturating_mul(3) };

        let hits = match vector {
            Some(v) => self.index.vector_search(v, fetch, &filter).await?,
            None => self.index.text_search(text, fetch, &filter).await?,
        };

        Ok(if trusted {
            hits
        } else {
            dedup_by_prefix(hits, self.config.dedup_prefix_chars)
                .into_iter()
                .take(k)
                .collect()
        })
    }
}

/// Keep the first hit for each `texto_semantico` prefix.
pub fn dedup_by_prefix(hits: Vec<VectorHit>, prefix_chars: usize) -> Vec<VectorHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(dedup_key(&h.doc.texto_semantico, prefix_chars)))
        .collect()
}

/// Vector hits first (score desc, newer first on ties), then time hits not already
/// present, capped at `max_items` in total.
pub fn merge(
    mut hits: Vec<VectorHit>,
    recent: Vec<MemoryEvent>,
    max_items: usize,
) -> (Vec<VectorHit>, Vec<MemoryEvent>) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.doc.ts_epoch.cmp(&a.doc.ts_epoch))
    });

    let mut seen = HashSet::new();
    let hits: Vec<VectorHit> = hits
        .into_iter()
        .filter(|h| seen.insert(h.doc.id.clone()))
        .take(max_items)
        .collect();

    let room = max_items.saturating_sub(hits.len());
    let recent: Vec<MemoryEvent> = recent
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .take(room)
        .collect();

    (hits, recent)
}

fn latest_timestamp(events: &[MemoryEvent], hits: &[VectorHit]) -> Option<String> {
    events
        .iter()
        .map(|e| (e.ts_epoch, &e.timestamp))
        .chain(hits.iter().map(|h| (h.doc.ts_epoch, &h.doc.timestamp)))
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, t)| t.clone())
}
