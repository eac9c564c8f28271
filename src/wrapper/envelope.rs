//! Response envelope.
//!
//! Every wrapped response leaves here as a JSON object carrying `success`,
//! `metadata` (identity, provenance, degradation flags) and a non-empty
//! `respuesta_usuario`. Building the envelope never fails: if augmentation hits
//! something it cannot merge, the original response goes out with
//! `metadata.memoria_error` instead.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::Degradation;
use crate::memory::types::{Identity, WorkingContext};

const GENERIC_RESPONSE: &str = "Solicitud procesada correctamente.";

/// Non-fatal conditions observed while serving one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub identity_degraded: bool,
    pub retrieval_unavailable: bool,
    pub embedding_unavailable: bool,
    pub persistence_failed: bool,
    pub persistence_deferred: bool,
    pub handler_error: bool,
    pub truncated: bool,
    pub cache_hit: bool,
}

impl Flags {
    fn degradations(&self) -> [(Degradation, bool); 5] {
        [
            (Degradation::IdentityDegraded, self.identity_degraded),
            (Degradation::RetrievalUnavailable, self.retrieval_unavailable),
            (Degradation::EmbeddingUnavailable, self.embedding_unavailable),
            (Degradation::PersistenceFailed, self.persistence_failed),
            (Degradation::HandlerError, self.handler_error),
        ]
    }

    /// Write every flag into `metadata`, `false` included, so clients can rely on the keys.
    pub fn write_to(&self, metadata: &mut Map<String, Value>) {
        for (degradation, on) in self.degradations() {
            metadata.insert(degradation.flag().into(), Value::Bool(on));
        }
        metadata.insert("persistence_deferred".into(), Value::Bool(self.persistence_deferred));
        metadata.insert("truncated".into(), Value::Bool(self.truncated));
        metadata.insert("cache_hit".into(), Value::Bool(self.cache_hit));
    }
}

/// Everything the envelope needs besides the handler's response.
pub struct EnvelopeContext<'a> {
    pub identity: &'a Identity,
    pub context: &'a WorkingContext,
    pub flags: Flags,
    pub request_id: &'a str,
}

/// Wrap `response` into the stable envelope. Never fails.
pub fn build_envelope(response: Value, ctx: &EnvelopeContext<'_>) -> Value {
    let response = match response {
        Value::Object(map) => Value::Object(map),
        other => json!({ "data": other }),
    };
    match augment(response.clone(), ctx) {
        Ok(enveloped) => enveloped,
        Err(reason) => {
            tracing::warn!(request_id = ctx.request_id, reason = %reason, "envelope augmentation failed");
            fallback(response, reason)
        }
    }
}

/// Overwrite the flags and bookkeeping fields of an already built envelope.
/// Called after persistence, whose outcome is only known then.
pub fn stamp(envelope: &mut Value, flags: &Flags, duration_ms: u64, eventos: &[String]) {
    let Some(metadata) = envelope.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    flags.write_to(metadata);
    metadata.insert("duration_ms".into(), json!(duration_ms));
    metadata.insert("eventos_persistidos".into(), json!(eventos));
}

fn augment(mut response: Value, ctx: &EnvelopeContext<'_>) -> Result<Value, String> {
    let body = response
        .as_object_mut()
        .ok_or_else(|| "response is not an object".to_string())?;

    let success = resolve_success(body);
    body.insert("success".into(), Value::Bool(success));

    let mut metadata = match body.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(existing)) => existing,
        Some(other) => {
            body.insert("metadata".into(), other);
            return Err("handler metadata is not an object".into());
        }
    };

    let memoria_aplicada = ctx.context.total_interacciones_sesion > 0;
    metadata.insert(
        "session_info".into(),
        json!({
            "session_id": ctx.identity.session_id,
            "agent_id": ctx.identity.agent_id,
            "source": ctx.identity.source,
        }),
    );
    metadata.insert("wrapper_aplicado".into(), Value::Bool(true));
    metadata.insert("memoria_aplicada".into(), Value::Bool(memoria_aplicada));
    metadata.insert(
        "timestamp".into(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    metadata.insert("request_id".into(), json!(ctx.request_id));
    metadata.insert(
        "contexto_items".into(),
        json!({
            "recientes": ctx.context.interacciones_recientes.len(),
            "vectoriales": ctx.context.docs_vectoriales.len(),
        }),
    );
    ctx.flags.write_to(&mut metadata);

    if memoria_aplicada {
        body.insert(
            "contexto_conversacion".into(),
            json!({
                "mensaje": continuity_message(ctx.context),
                "resumen": ctx.context.resumen_conversacion,
                "ultima_actividad": ctx.context.ultima_actividad,
            }),
        );
    }

    let has_answer = body
        .get("respuesta_usuario")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty());
    if !has_answer {
        let answer = synthesize_answer(body, success, ctx.context);
        body.insert("respuesta_usuario".into(), Value::String(answer));
    }

    body.insert("metadata".into(), Value::Object(metadata));
    Ok(response)
}

fn fallback(mut response: Value, reason: String) -> Value {
    if let Some(body) = response.as_object_mut() {
        let original = body.remove("metadata");
        let mut metadata = Map::new();
        metadata.insert("wrapper_aplicado".into(), Value::Bool(true));
        metadata.insert("memoria_error".into(), Value::String(reason));
        if let Some(original) = original {
            metadata.insert("original".into(), original);
        }
        body.insert("metadata".into(), Value::Object(metadata));
        if !body.contains_key("success") {
            body.insert("success".into(), Value::Bool(!body.contains_key("error")));
        }
    }
    response
}

/// `success` wins, then `exito`, then absence of `error`.
fn resolve_success(body: &Map<String, Value>) -> bool {
    body.get("success")
        .and_then(Value::as_bool)
        .or_else(|| body.get("exito").and_then(Value::as_bool))
        .unwrap_or_else(|| body.get("error").map_or(true, Value::is_null))
}

fn continuity_message(context: &WorkingContext) -> String {
    match context.total_interacciones_sesion {
        1 => "Continuando conversación con 1 interacción previa".to_string(),
        n => format!("Continuando conversación con {n} interacciones previas"),
    }
}

fn synthesize_answer(body: &Map<String, Value>, success: bool, context: &WorkingContext) -> String {
    let text = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if !success {
        let reason = text("error").unwrap_or_else(|| "error desconocido".into());
        return format!("No se pudo completar la solicitud: {reason}");
    }

    text("mensaje")
        .or_else(|| text("resumen_automatico"))
        .or_else(|| text("message"))
        .or_else(|| {
            let resumen = context.resumen_conversacion.trim();
            (!resumen.is_empty()).then(|| resumen.to_string())
        })
        .unwrap_or_else(|| GENERIC_RESPONSE.to_string())
}
