//! `historial-interacciones`: structured and natural-language history queries.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::HandlerError;
use crate::memory::query::{build_query, HistoryParams};
use crate::memory::truncate_chars;
use crate::memory::types::WorkingContext;
use crate::services::MemoryServices;
use crate::wrapper::handler::ToolHandler;
use crate::wrapper::request::ToolRequest;

use super::{event_view, text_field, HISTORIAL};

pub struct HistorialTool {
    services: Arc<MemoryServices>,
}

impl HistorialTool {
    pub fn new(services: Arc<MemoryServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ToolHandler for HistorialTool {
    fn name(&self) -> &str {
        HISTORIAL
    }

    async fn handle(&self, request: &ToolRequest, context: &WorkingContext) -> Result<Value, HandlerError> {
        let fields = request.fields();
        let mut params = HistoryParams::from_fields(&fields);

        // Scoped to the caller's conversation unless explicitly asked for all sessions.
        let global = text_field(&fields, &["alcance", "scope"]).is_some_and(|s| s.eq_ignore_ascii_case("global"));
        if params.session_id.is_none() && !global {
            params.session_id = Some(context.session_id.clone());
        }

        let retrieval = &self.services.config.retrieval;
        let built = build_query(
            &params,
            Utc::now(),
            retrieval.default_history_limit,
            retrieval.max_history_limit,
        )?;

        let events = self.services.store.query(&built.query).await?;
        let total = self.services.store.count(&built.query.filter).await?;

        tracing::debug!(
            session_id = ?built.query.filter.session_id,
            returned = events.len(),
            total,
            "history query"
        );

        let respuesta = match events.first() {
            None => "No encontré interacciones que coincidan con la consulta.".to_string(),
            Some(latest) => format!(
                "Encontré {} de {} interacciones. La más reciente: {} ({}).",
                events.len(),
                total,
                truncate_chars(&latest.texto_semantico, 160),
                latest.timestamp
            ),
        };

        Ok(json!({
            "success": true,
            "events": events.iter().map(event_view).collect::<Vec<_>>(),
            "total": total,
            "query_used": built,
            "mensaje": format!("Historial: {} eventos devueltos de {} coincidentes", events.len(), total),
            "respuesta_usuario": respuesta,
        }))
    }
}
