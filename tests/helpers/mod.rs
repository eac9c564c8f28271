#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use memoria::config::MemoriaConfig;
use memoria::db::{self, Db};
use memoria::embedding::{Embedder, EmbeddingProvider};
use memoria::error::{EmbeddingError, StoreError};
use memoria::identity::ThreadSource;
use memoria::memory::index::{SqliteVectorIndex, VectorIndex};
use memoria::memory::query::{EventFilter, EventQuery};
use memoria::memory::store::{EventStore, SessionActivity, SqliteEventStore};
use memoria::memory::types::{ChangeRecord, EventType, MemoryEvent};
use memoria::services::MemoryServices;
use memoria::tools::memory_tools;
use memoria::wrapper::handler::{fn_handler, ToolHandler};
use memoria::wrapper::MemoryWrapper;

/// Dimension of the test embeddings.
pub const DIMS: usize = 64;

/// Fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Db {
    db::shared(db::open_memory_database().unwrap())
}

/// Deterministic bag-of-words embedding: each lowercase word bumps one hashed
/// bucket, and bucket 0 carries a constant bias so any two texts have positive
/// similarity.
pub struct KeywordEmbedder;

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[0] = 1.0;
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let digest = Sha256::digest(word.to_lowercase().as_bytes());
        let bucket = 1 + (digest[0] as usize) % (DIMS - 1);
        v[bucket] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / norm).collect()
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(keyword_vector(text))
    }
    fn dimensions(&self) -> usize {
        DIMS
    }
    fn model(&self) -> &str {
        "keyword-test"
    }
}

/// Provider that is always unreachable.
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed_raw(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Request("connection refused".into()))
    }
    fn dimensions(&self) -> usize {
        DIMS
    }
    fn model(&self) -> &str {
        "failing-test"
    }
}

/// Event store that sleeps before every operation, then delegates.
pub struct StallingStore {
    pub inner: SqliteEventStore,
    pub stall: Duration,
}

#[async_trait]
impl EventStore for StallingStore {
    async fn upsert(&self, event: &MemoryEvent) -> Result<bool, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.upsert(event).await
    }
    async fn get(&self, id: &str) -> Result<Option<MemoryEvent>, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.get(id).await
    }
    async fn query(&self, query: &EventQuery) -> Result<Vec<MemoryEvent>, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.query(query).await
    }
    async fn count(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.count(filter).await
    }
    async fn list_sessions(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionActivity>, StoreError> {
        tokio::time::sleep(self.stall).await;
        self.inner.list_sessions(since, until).await
    }
    async fn changes_since(&self, after: i64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.changes_since(after, limit).await
    }
    async fn latest_seq(&self) -> Result<i64, StoreError> {
        self.inner.latest_seq().await
    }
    fn change_notifier(&self) -> Option<Arc<Notify>> {
        self.inner.change_notifier()
    }
}

/// Thread API that never answers.
pub struct HangingThread;

#[async_trait]
impl ThreadSource for HangingThread {
    async fn latest_thread(&self) -> Option<String> {
        std::future::pending().await
    }
}

/// Config sized for the test embeddings, with the indexer loop off.
pub fn test_config() -> MemoriaConfig {
    let mut config = MemoriaConfig::default();
    config.embedding.provider = "none".into();
    config.embedding.dimensions = DIMS;
    config.indexer.enabled = false;
    config
}

/// Everything a test needs: services over an in-memory database.
pub struct Harness {
    pub db: Db,
    pub services: Arc<MemoryServices>,
}

impl Harness {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self::with_config(provider, test_config())
    }

    pub fn with_config(provider: Option<Arc<dyn EmbeddingProvider>>, config: MemoriaConfig) -> Self {
        let db = test_db();
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(db.clone()));
        Self::with_store(provider, config, db, store)
    }

    pub fn with_store(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: MemoriaConfig,
        db: Db,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let index: Arc<dyn VectorIndex> = Arc::new(
            SqliteVectorIndex::new(db.clone(), config.embedding.dimensions)
                .with_rrf_k(config.retrieval.rrf_k),
        );
        Self::build(provider, config, db, store, None)
    }

    /// Services whose identity resolver asks `thread_source` for the upstream thread.
    pub fn with_thread_source(config: MemoriaConfig, thread_source: Arc<dyn ThreadSource>) -> Self {
        let db = test_db();
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(db.clone()));
        Self::build(None, config, db, store, Some(thread_source))
    }

    fn build(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: MemoriaConfig,
        db: Db,
        store: Arc<dyn EventStore>,
        thread_source: Option<Arc<dyn ThreadSource>>,
    ) -> Self {
        let index: Arc<dyn VectorIndex> = Arc::new(
            SqliteVectorIndex::new(db.clone(), config.embedding.dimensions)
                .with_rrf_k(config.retrieval.rrf_k),
        );
        let embedder = Arc::new(Embedder::new(provider, &config.embedding));
        let services = Arc::new(
            MemoryServices::from_parts(config, store, index, embedder, thread_source).with_db(db.clone()),
        );
        Self { db, services }
    }

    /// Keyword embeddings, everything else default.
    pub fn keyword() -> Self {
        Self::new(Some(Arc::new(KeywordEmbedder)))
    }

    /// Wrapper with the built-in tools plus `extra` handlers.
    pub fn wrapper(&self, extra: Vec<Arc<dyn ToolHandler>>) -> MemoryWrapper {
        let mut registry = memory_tools(&self.services);
        for handler in extra {
            registry.register(handler);
        }
        MemoryWrapper::new(self.services.clone(), registry)
    }

    pub async fn index_pending(&self) {
        self.services.indexer().run_once().await.unwrap();
    }

    pub async fn session_events(&self, session_id: &str) -> Vec<MemoryEvent> {
        self.services
            .store
            .query(&EventQuery::new(EventFilter::for_session(session_id)).limit(100))
            .await
            .unwrap()
    }
}

/// A handler named `name` that answers with a fixed, summary-friendly message.
pub fn status_handler(name: &str) -> Arc<dyn ToolHandler> {
    fn_handler(name, |_req, _ctx| async move {
        Ok(json!({
            "success": true,
            "estado": "operativo",
            "mensaje": "Estado del servicio verificado: todos los componentes responden",
        }))
    })
}

/// A ready-made event for direct store writes.
pub fn make_event(id: &str, session_id: &str, texto: &str, ts_epoch: i64) -> MemoryEvent {
    let timestamp = DateTime::<Utc>::from_timestamp(ts_epoch, 0)
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    MemoryEvent {
        id: id.into(),
        session_id: session_id.into(),
        agent_id: "agente".into(),
        endpoint: "diagnostico-recursos".into(),
        event_type: EventType::EndpointCall,
        timestamp,
        ts_epoch,
        params: json!({}),
        response_data: json!({"ok": true}),
        texto_semantico: texto.into(),
        success: true,
        metadata: json!({"wrapper_aplicado": true}),
    }
}

pub fn metadata(body: &Value) -> &Value {
    &body["metadata"]
}
