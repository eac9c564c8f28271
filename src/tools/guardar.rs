//! `guardar-memoria`: explicit, user-initiated memory.
//!
//! The tool validates the request and describes a `snapshot` event under
//! [`RECORD_KEY`]; the wrapper persists it in place of the usual `endpoint_call`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::memory::summarize::summarize_snapshot;
use crate::memory::types::{EventType, WorkingContext};
use crate::memory::{truncate_chars, MAX_TEXTO_CHARS};
use crate::wrapper::events::RECORD_KEY;
use crate::wrapper::handler::ToolHandler;
use crate::wrapper::request::ToolRequest;

use super::GUARDAR;

const DEFAULT_TIPO: &str = "nota";

/// Body of a `guardar-memoria` request.
#[derive(Debug, Deserialize)]
pub struct GuardarParams {
    #[serde(alias = "content", alias = "texto")]
    pub contenido: Option<String>,
    #[serde(alias = "type")]
    pub tipo: Option<String>,
    pub metadata: Option<Value>,
}

pub struct GuardarTool;

#[async_trait]
impl ToolHandler for GuardarTool {
    fn name(&self) -> &str {
        GUARDAR
    }

    async fn handle(&self, request: &ToolRequest, context: &WorkingContext) -> Result<Value, HandlerError> {
        let params: GuardarParams = serde_json::from_value(Value::Object(request.fields()))
            .map_err(|e| HandlerError::InvalidInput(format!("parámetros inválidos: {e}")))?;

        let contenido = params
            .contenido
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HandlerError::InvalidInput("se requiere 'contenido'".into()))?;
        if contenido.chars().count() > MAX_TEXTO_CHARS {
            return Err(HandlerError::InvalidInput(format!(
                "'contenido' supera {MAX_TEXTO_CHARS} caracteres"
            )));
        }
        let tipo = params
            .tipo
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TIPO);

        tracing::info!(
            session_id = %context.session_id,
            tipo,
            chars = contenido.chars().count(),
            "memory snapshot requested"
        );

        let mut registro = json!({ "tipo": tipo });
        if let Some(ref extra) = params.metadata {
            registro["metadata_usuario"] = extra.clone();
        }

        Ok(json!({
            "success": true,
            "guardado": {
                "tipo": tipo,
                "session_id": context.session_id,
                "caracteres": contenido.chars().count(),
                "metadata": params.metadata,
            },
            "mensaje": format!("Memoria guardada ({tipo}): {}", truncate_chars(contenido, 120)),
            RECORD_KEY: {
                "event_type": EventType::Snapshot.as_str(),
                "texto_semantico": summarize_snapshot(contenido, tipo),
                "metadata": registro,
            },
        }))
    }
}
