//! `status`: health of the memory services as seen from a tool call.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::HandlerError;
use crate::memory::types::WorkingContext;
use crate::services::MemoryServices;
use crate::wrapper::handler::ToolHandler;
use crate::wrapper::request::ToolRequest;

use super::STATUS;

pub struct StatusTool {
    services: Arc<MemoryServices>,
}

impl StatusTool {
    pub fn new(services: Arc<MemoryServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl ToolHandler for StatusTool {
    fn name(&self) -> &str {
        STATUS
    }

    async fn handle(&self, _request: &ToolRequest, context: &WorkingContext) -> Result<Value, HandlerError> {
        let latest_seq = self.services.store.latest_seq().await?;
        let docs = self.services.index.count().await?;
        let checkpoint = self.services.index.checkpoint().await?;
        let embeddings = self.services.embedder.is_available() && !self.services.embedder.is_degraded();

        Ok(json!({
            "success": true,
            "estado": "operativo",
            "eventos": latest_seq,
            "documentos_vectoriales": docs,
            "indexador_pendiente": (latest_seq - checkpoint).max(0),
            "embeddings_disponibles": embeddings,
            "cache_disponible": self.services.cache.ping(),
            "mensaje": format!(
                "Servicio de memoria operativo: {} interacciones en esta sesión, {} documentos indexados",
                context.total_interacciones_sesion, docs
            ),
        }))
    }
}
