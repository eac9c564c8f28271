//! `buscar-memoria`: relevance search over past interactions.
//!
//! With an embedding available the query runs as a hybrid (vector + lexical)
//! search on the vector index. Without one it degrades to a term match on the
//! event store, which holds every event whether or not it was ever indexed.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::HandlerError;
use crate::memory::query::{EventFilter, EventQuery, VectorFilter};
use crate::memory::retrieval::dedup_by_prefix;
use crate::memory::types::WorkingContext;
use crate::services::MemoryServices;
use crate::wrapper::handler::ToolHandler;
use crate::wrapper::request::ToolRequest;

use super::{event_view, group_by_prefix, hit_view, number_field, text_field, BUSCAR};

const MAX_TOP: usize = 50;
const MIN_TERM_CHARS: usize = 4;

pub struct BuscarTool {
    services: Arc<MemoryServices>,
}

impl BuscarTool {
    pub fn new(services: Arc<MemoryServices>) -> Self {
        Self { services }
    }
}

/// Distinct lowercase words worth matching on.
pub fn search_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if word.chars().count() >= MIN_TERM_CHARS && !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

#[async_trait]
impl ToolHandler for BuscarTool {
    fn name(&self) -> &str {
        BUSCAR
    }

    async fn handle(&self, request: &ToolRequest, _context: &WorkingContext) -> Result<Value, HandlerError> {
        let fields = request.fields();
        let query = text_field(&fields, &["query", "consulta", "q"])
            .ok_or_else(|| HandlerError::InvalidInput("se requiere 'query'".into()))?;
        let session_id = text_field(&fields, &["session_id"]);
        let retrieval = &self.services.config.retrieval;
        let top = number_field(&fields, &["top", "limit", "limite"])
            .unwrap_or(retrieval.vector_top_k)
            .clamp(1, MAX_TOP);
        let fetch = if session_id.is_some() { top } else { top * 3 };

        let (modo, resultados) = match self.services.embedder.embed(&query).await {
            Some(vector) => {
                let filter = VectorFilter {
                    session_id: session_id.clone(),
                    ..VectorFilter::default()
                };
                let mut hits = self
                    .services
                    .index
                    .hybrid_search(&vector, &query, fetch, &filter)
                    .await?;
                if session_id.is_none() {
                    hits = dedup_by_prefix(hits, retrieval.dedup_prefix_chars);
                }
                let views: Vec<Value> = hits.iter().take(top).map(hit_view).collect();
                ("vectorial", views)
            }
            None => {
                let terms = search_terms(&query);
                let filter = EventFilter {
                    session_id: session_id.clone(),
                    contains: terms.is_empty().then(|| query.clone()),
                    any_terms: terms,
                    cross_partition: session_id.is_none(),
                    ..EventFilter::default()
                };
                let events = self.services.store.query(&EventQuery::new(filter).limit(fetch)).await?;
                let views: Vec<Value> = if session_id.is_none() {
                    group_by_prefix(events, retrieval.dedup_prefix_chars)
                        .iter()
                        .take(top)
                        .map(|g| event_view(&g.representative))
                        .collect()
                } else {
                    events.iter().take(top).map(event_view).collect()
                };
                ("texto", views)
            }
        };

        let respuesta = match resultados.first() {
            None => format!("No encontré recuerdos relacionados con \"{query}\"."),
            Some(first) => format!(
                "Encontré {} recuerdos relacionados. El más relevante: {}",
                resultados.len(),
                first["texto_semantico"].as_str().unwrap_or_default()
            ),
        };

        Ok(json!({
            "success": true,
            "query": query,
            "modo": modo,
            "total": resultados.len(),
            "resultados": resultados,
            "mensaje": format!("Búsqueda {modo}: {} resultados", resultados.len()),
            "respuesta_usuario": respuesta,
        }))
    }
}
