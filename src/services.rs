//! Process-wide memory singletons.
//!
//! [`MemoryServices`] is built once at start-up and shared behind an `Arc` by the
//! request wrapper, the memory tools, the indexer, and the CLI.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::MemoriaConfig;
use crate::db::{self, migrations, Db};
use crate::embedding::{self, Embedder};
use crate::identity::{HttpThreadSource, IdentityResolver, ThreadSource};
use crate::memory::cache::ContextCache;
use crate::memory::index::{SqliteVectorIndex, VectorIndex};
use crate::memory::indexer::Indexer;
use crate::memory::retrieval::MemoryRetriever;
use crate::memory::store::{EventStore, SqliteEventStore};
use crate::memory::EventIdGenerator;

pub struct MemoryServices {
    pub config: MemoriaConfig,
    pub store: Arc<dyn EventStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<Embedder>,
    pub cache: Arc<ContextCache>,
    pub resolver: Arc<IdentityResolver>,
    pub retriever: Arc<MemoryRetriever>,
    pub ids: Arc<EventIdGenerator>,
    db: Option<Db>,
}

impl MemoryServices {
    /// Open the database named by the config and build every component on it.
    ///
    /// An embedding provider that cannot be constructed is not fatal: the
    /// embedder starts degraded and retrieval falls back to text search.
    pub fn open(config: MemoriaConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let conn = db::open_database(&db_path)
            .with_context(|| format!("failed to open memory database at {}", db_path.display()))?;

        let provider = match embedding::create_provider(&config.embedding) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(
                    provider = %config.embedding.provider,
                    error = %e,
                    "embedding provider unavailable, continuing without embeddings"
                );
                None
            }
        };

        if let Some(ref provider) = provider {
            match migrations::get_embedding_model(&conn)? {
                Some(stored) if stored != provider.model() => {
                    tracing::warn!(
                        stored = %stored,
                        configured = %provider.model(),
                        "embedding model changed, run `memoria reindex` to rebuild the vector index"
                    );
                }
                Some(_) => {}
                None => migrations::set_embedding_model(&conn, provider.model(), provider.dimensions())?,
            }
        }
        migrations::set_meta(&conn, "vector_profile", &config.indexer.vector_profile)?;

        let db = db::shared(conn);
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(db.clone()));
        let index: Arc<dyn VectorIndex> = Arc::new(
            SqliteVectorIndex::new(db.clone(), config.embedding.dimensions)
                .with_rrf_k(config.retrieval.rrf_k),
        );
        let embedder = Arc::new(Embedder::new(provider, &config.embedding));

        let thread_source: Option<Arc<dyn ThreadSource>> = if config.identity.upstream_enabled {
            HttpThreadSource::new(&config.identity).map(|s| Arc::new(s) as Arc<dyn ThreadSource>)
        } else {
            None
        };

        let mut services = Self::from_parts(config, store, index, embedder, thread_source);
        services.db = Some(db);
        Ok(services)
    }

    /// Assemble services from explicit components.
    pub fn from_parts(
        config: MemoriaConfig,
        store: Arc<dyn EventStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<Embedder>,
        thread_source: Option<Arc<dyn ThreadSource>>,
    ) -> Self {
        let cache = Arc::new(ContextCache::new(&config.cache));
        let resolver = Arc::new(IdentityResolver::new(
            config.identity.clone(),
            thread_source,
            cache.clone(),
        ));
        let retriever = Arc::new(MemoryRetriever::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            cache.clone(),
            config.retrieval.clone(),
        ));
        Self {
            config,
            store,
            index,
            embedder,
            cache,
            resolver,
            retriever,
            ids: Arc::new(EventIdGenerator::new()),
            db: None,
        }
    }

    /// Attach the shared database handle, for health checks.
    pub fn with_db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    pub fn db(&self) -> Option<&Db> {
        self.db.as_ref()
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(
            self.store.clone(),
            self.index.clone(),
            self.embedder.clone(),
            &self.config.indexer,
        )
    }
}
