//! Vector index: the rebuildable, searchable projection of memory events.
//!
//! [`SqliteVectorIndex`] keeps one row per [`VectorDoc`] in `vector_docs` (with an
//! f32 embedding blob) and mirrors the text into the `vector_docs_fts` FTS5 table.
//! Vector search ranks by sqlite-vec's `vec_distance_cosine` under a structured
//! filter; text search uses BM25; hybrid search fuses both with Reciprocal Rank
//! Fusion. The indexer checkpoint lives in `schema_meta` next to the index, so
//! clearing the index also rewinds the checkpoint.

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{migrations, Db};
use crate::error::StoreError;
use crate::memory::query::{apply_vector_filter, SqlBuilder, VectorFilter};
use crate::memory::types::{VectorDoc, VectorHit};
use crate::memory::{bytes_to_embedding, embedding_to_bytes};

const CHECKPOINT_KEY: &str = "indexer_cursor";

const DOC_COLUMNS: &str = "d.id, d.session_id, d.agent_id, d.endpoint, d.timestamp, d.ts_epoch, \
                           d.tipo, d.texto_semantico, d.exito";

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace documents by `id`. Returns the number written.
    async fn upload(&self, docs: &[VectorDoc]) -> Result<usize, StoreError>;

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<VectorDoc>, StoreError>;

    /// Top-`k` by cosine similarity under `filter`. Ties go to the newer document.
    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError>;

    /// Lexical search over `texto_semantico`.
    async fn text_search(
        &self,
        query: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError>;

    /// Vector and lexical results fused by reciprocal rank.
    async fn hybrid_search(
        &self,
        vector: &[f32],
        query: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// All document ids, sorted.
    async fn ids(&self) -> Result<Vec<String>, StoreError>;

    /// Last change-feed `seq` folded into the index.
    async fn checkpoint(&self) -> Result<i64, StoreError>;

    async fn set_checkpoint(&self, seq: i64) -> Result<(), StoreError>;

    /// Drop every document and rewind the checkpoint.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// SQLite + sqlite-vec backed [`VectorIndex`].
#[derive(Clone)]
pub struct SqliteVectorIndex {
    db: Db,
    dimensions: usize,
    rrf_k: usize,
}

impl SqliteVectorIndex {
    pub fn new(db: Db, dimensions: usize) -> Self {
        Self {
            db,
            dimensions,
            rrf_k: 60,
        }
    }

    pub fn with_rrf_k(mut self, rrf_k: usize) -> Self {
        self.rrf_k = rrf_k.max(1);
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::Dimension {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upload(&self, docs: &[VectorDoc]) -> Result<usize, StoreError> {
        for doc in docs {
            self.check_dimensions(&doc.vector)?;
        }
        let docs = docs.to_vec();
        self.with_conn(move |conn| upload_docs(conn, &docs)).await
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| delete_docs(conn, &ids)).await
    }

    async fn get(&self, id: &str) -> Result<Option<VectorDoc>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| get_doc(conn, &id)).await
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError> {
        self.check_dimensions(vector)?;
        let vector = vector.to_vec();
        let filter = filter.clone();
        self.with_conn(move |conn| vector_search(conn, &vector, k, &filter)).await
    }

    async fn text_search(
        &self,
        query: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError> {
        let query = query.to_string();
        let filter = filter.clone();
        self.with_conn(move |conn| text_search(conn, &query, k, &filter)).await
    }

    async fn hybrid_search(
        &self,
        vector: &[f32],
        query: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, StoreError> {
        self.check_dimensions(vector)?;
        let vector = vector.to_vec();
        let query = query.to_string();
        let filter = filter.clone();
        let rrf_k = self.rrf_k;
        self.with_conn(move |conn| {
            // Over-fetch both lists so fusion has room to reorder.
            let fetch = k.saturating_mul(2).max(k);
            let by_vector = vector_search(conn, &vector, fetch, &filter)?;
            let by_text = text_search(conn, &query, fetch, &filter)?;

            let vec_ranked: Vec<(String, f64)> =
                by_vector.iter().map(|h| (h.doc.id.clone(), h.score)).collect();
            let fts_ranked: Vec<(String, f64)> =
                by_text.iter().map(|h| (h.doc.id.clone(), h.score)).collect();

            let mut docs: HashMap<String, VectorDoc> = by_vector
                .into_iter()
                .chain(by_text)
                .map(|h| (h.doc.id.clone(), h.doc))
                .collect();

            Ok(rrf_merge(&vec_ranked, &fts_ranked, rrf_k)
                .into_iter()
                .filter_map(|(id, score)| docs.remove(&id).map(|doc| VectorHit { doc, score }))
                .take(k)
                .collect())
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM vector_docs", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM vector_docs ORDER BY id")?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn checkpoint(&self) -> Result<i64, StoreError> {
        self.with_conn(read_checkpoint).await
    }

    async fn set_checkpoint(&self, seq: i64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            migrations::set_meta(conn, CHECKPOINT_KEY, &seq.to_string())?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM vector_docs", [])?;
            tx.execute("DELETE FROM vector_docs_fts", [])?;
            migrations::set_meta(&tx, CHECKPOINT_KEY, "0")?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ── Synchronous core ──────────────────────────────────────────────────────────

fn read_checkpoint(conn: &Connection) -> Result<i64, StoreError> {
    let raw = migrations::get_meta(conn, CHECKPOINT_KEY)?;
    match raw {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("indexer checkpoint '{v}'"))),
    }
}

/// Upsert documents and keep the FTS mirror in sync, in one transaction.
pub fn upload_docs(conn: &Connection, docs: &[VectorDoc]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    for doc in docs {
        tx.execute(
            "INSERT OR REPLACE INTO vector_docs \
             (id, session_id, agent_id, endpoint, timestamp, ts_epoch, tipo, texto_semantico, exito, embedding) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                doc.id,
                doc.session_id,
                doc.agent_id,
                doc.endpoint,
                doc.timestamp,
                doc.ts_epoch,
                doc.tipo.as_str(),
                doc.texto_semantico,
                doc.exito,
                embedding_to_bytes(&doc.vector),
            ],
        )?;
        tx.execute("DELETE FROM vector_docs_fts WHERE id = ?1", [&doc.id])?;
        tx.execute(
            "INSERT INTO vector_docs_fts (texto_semantico, id) VALUES (?1, ?2)",
            params![doc.texto_semantico, doc.id],
        )?;
    }
    tx.commit()?;
    Ok(docs.len())
}

pub fn delete_docs(conn: &Connection, ids: &[String]) -> Result<usize, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let mut removed = 0;
    for id in ids {
        removed += tx.execute("DELETE FROM vector_docs WHERE id = ?1", [id])?;
        tx.execute("DELETE FROM vector_docs_fts WHERE id = ?1", [id])?;
    }
    tx.commit()?;
    Ok(removed)
}

pub fn get_doc(conn: &Connection, id: &str) -> Result<Option<VectorDoc>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {DOC_COLUMNS}, d.embedding FROM vector_docs d WHERE d.id = ?1"),
            [id],
            |row| {
                let blob: Vec<u8> = row.get(9)?;
                Ok((RawDoc::from_row(row)?, blob))
            },
        )
        .optional()?;
    row.map(|(raw, blob)| {
        let mut doc = raw.into_doc()?;
        doc.vector = bytes_to_embedding(&blob);
        Ok(doc)
    })
    .transpose()
}

/// Cosine-ranked search. Score is `1 - cosine distance`.
pub fn vector_search(
    conn: &Connection,
    vector: &[f32],
    k: usize,
    filter: &VectorFilter,
) -> Result<Vec<VectorHit>, StoreError> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let mut sql = SqlBuilder::starting_after(1);
    apply_vector_filter(&mut sql, filter, "d");
    let statement = format!(
        "SELECT {DOC_COLUMNS}, vec_distance_cosine(d.embedding, ?1) AS distance \
         FROM vector_docs d {} ORDER BY distance ASC, d.ts_epoch DESC LIMIT {k}",
        sql.where_clause()
    );

    let mut bound: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Blob(embedding_to_bytes(vector).to_vec())];
    bound.extend(sql.into_params());

    let mut stmt = conn.prepare(&statement)?;
    let rows = stmt
        .query_map(params_from_iter(bound), |row| {
            Ok((RawDoc::from_row(row)?, row.get::<_, f64>(9)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(raw, distance)| {
            Ok(VectorHit {
                doc: raw.into_doc()?,
                score: 1.0 - distance,
            })
        })
        .collect()
}

/// BM25-ranked search over the FTS mirror. Terms are OR-ed so partial matches
/// still surface; score is the negated BM25 rank (higher is better).
pub fn text_search(
    conn: &Connection,
    query: &str,
    k: usize,
    filter: &VectorFilter,
) -> Result<Vec<VectorHit>, StoreError> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    let mut sql = SqlBuilder::starting_after(1);
    sql.push("vector_docs_fts MATCH ?1".into());
    apply_vector_filter(&mut sql, filter, "d");
    let statement = format!(
        "SELECT {DOC_COLUMNS}, bm25(vector_docs_fts) AS rank \
         FROM vector_docs_fts JOIN vector_docs d ON d.id = vector_docs_fts.id \
         {} ORDER BY rank ASC, d.ts_epoch DESC LIMIT {k}",
        sql.where_clause()
    );

    let mut bound: Vec<rusqlite::types::Value> = vec![rusqlite::types::Value::Text(escaped)];
    bound.extend(sql.into_params());

    let mut stmt = conn.prepare(&statement)?;
    let rows = stmt
        .query_map(params_from_iter(bound), |row| {
            Ok((RawDoc::from_row(row)?, row.get::<_, f64>(9)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(raw, rank)| {
            Ok(VectorHit {
                doc: raw.into_doc()?,
                score: -rank,
            })
        })
        .collect()
}

/// Escape free text for FTS5 MATCH.
///
/// Each whitespace-delimited word is stripped of quotes and wrapped in fresh ones
/// so FTS5 operators in user text are treated as terms; words are OR-ed.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Reciprocal Rank Fusion.
///
/// Each list contributes `1 / (k + rank)` per document; documents in both lists
/// accumulate. Output is sorted by fused score, descending.
pub fn rrf_merge(
    vec_results: &[(String, f64)],
    fts_results: &[(String, f64)],
    k: usize,
) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for list in [vec_results, fts_results] {
        for (rank, (id, _)) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64 + 1.0);
        }
    }
    let mut merged: Vec<(String, f64)> = scores.into_iter().collect();
    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged
}

struct RawDoc {
    id: String,
    session_id: String,
    agent_id: String,
    endpoint: String,
    timestamp: String,
    ts_epoch: i64,
    tipo: String,
    texto_semantico: String,
    exito: bool,
}

impl RawDoc {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            agent_id: row.get(2)?,
            endpoint: row.get(3)?,
            timestamp: row.get(4)?,
            ts_epoch: row.get(5)?,
            tipo: row.get(6)?,
            texto_semantico: row.get(7)?,
            exito: row.get(8)?,
        })
    }

    fn into_doc(self) -> Result<VectorDoc, StoreError> {
        Ok(VectorDoc {
            tipo: self.tipo.parse().map_err(StoreError::Corrupt)?,
            id: self.id,
            session_id: self.session_id,
            agent_id: self.agent_id,
            endpoint: self.endpoint,
            timestamp: self.timestamp,
            ts_epoch: self.ts_epoch,
            texto_semantico: self.texto_semantico,
            exito: self.exito,
            vector: Vec::new(),
        })
    }
}
