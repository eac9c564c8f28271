//! `memoria-global`: cross-session, deduplicated view of what has been remembered.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::HandlerError;
use crate::memory::query::{EventFilter, EventQuery, MAX_LIMIT};
use crate::memory::types::WorkingContext;
use crate::services::MemoryServices;
use crate::wrapper::handler::ToolHandler;
use crate::wrapper::request::ToolRequest;

use super::{event_view, extend_groups, number_field, PrefixGroup, GLOBAL};

/// Upper bound on events read for one global view.
const MAX_SCAN: usize = 5_000;

pub struct GlobalTool {
    services: Arc<MemoryServices>,
}

impl GlobalTool {
    pub fn new(services: Arc<MemoryServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ToolHandler for GlobalTool {
    fn name(&self) -> &str {
        GLOBAL
    }

    async fn handle(&self, request: &ToolRequest, _context: &WorkingContext) -> Result<Value, HandlerError> {
        let fields = request.fields();
        let limit = number_field(&fields, &["limit", "limite"])
            .unwrap_or(MAX_LIMIT)
            .clamp(1, MAX_LIMIT);
        let retrieval = &self.services.config.retrieval;

        let filter = EventFilter {
            min_text_len: Some(retrieval.min_text_len),
            ..EventFilter::global()
        };

        // Page from newest to oldest until `limit` distinct topics are found.
        let mut groups: Vec<PrefixGroup> = Vec::new();
        let mut scanned = 0;
        let mut exhausted = false;
        while groups.len() < limit && scanned < MAX_SCAN {
            let page = self
                .services
                .store
                .query(&EventQuery::new(filter.clone()).limit(MAX_LIMIT).offset(scanned))
                .await?;
            let fetched = page.len();
            scanned += fetched;
            extend_groups(&mut groups, page, retrieval.dedup_prefix_chars);
            if fetched < MAX_LIMIT {
                exhausted = true;
                break;
            }
        }
        groups.truncate(limit);

        let total_eventos = self.services.store.count(&EventFilter::global()).await?;
        let sesiones = self.services.store.list_sessions(None, None).await?;
        let suprimidos: usize = groups.iter().map(|g| g.duplicates).sum();
        let cobertura = if exhausted {
            "todas las sesiones".to_string()
        } else {
            format!("los {scanned} eventos más recientes")
        };

        let representantes: Vec<Value> = groups
            .iter()
            .map(|g| {
                let mut view = event_view(&g.representative);
                view["duplicados"] = json!(g.duplicates);
                view["sesiones"] = json!(g.sessions);
                view
            })
            .collect();

        let respuesta = if representantes.is_empty() {
            "Todavía no hay recuerdos registrados en ninguna sesión.".to_string()
        } else {
            format!(
                "La memoria global reúne {} temas distintos de {} sesiones ({} duplicados omitidos), revisando {}.",
                representantes.len(),
                sesiones.len(),
                suprimidos,
                cobertura
            )
        };

        Ok(json!({
            "success": true,
            "representantes": representantes,
            "duplicados_suprimidos": suprimidos,
            "eventos_revisados": scanned,
            "revision_completa": exhausted,
            "query_used": {
                "orden": "ts_epoch DESC",
                "min_text_len": retrieval.min_text_len,
                "prefijo_dedup": retrieval.dedup_prefix_chars,
                "limite_temas": limit,
                "cobertura": cobertura,
            },
            "total_eventos": total_eventos,
            "sesiones": sesiones,
            "mensaje": format!("Memoria global: {} representantes", representantes.len()),
            "respuesta_usuario": respuesta,
        }))
    }
}
