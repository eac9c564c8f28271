//! Turning one wrapped invocation into the events the wrapper persists.

use serde_json::{json, Map, Value};

use crate::memory::summarize::{summarize_event, summarize_user_input};
use crate::memory::types::{EventType, Identity, MemoryEvent, WorkingContext};
use crate::memory::{utc_now, EventIdGenerator};

/// Key fragments whose values never reach storage.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "connection_string",
    "credential",
];

const REDACTED: &str = "***";

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Recursively redact secret-looking keys.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive(k) {
                        Value::String(REDACTED.into())
                    } else {
                        sanitize(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Replace responses larger than `max_bytes` with a stub naming their top-level keys.
pub fn truncate_response(response: &Value, max_bytes: usize) -> Value {
    let size = serde_json::to_vec(response).map(|b| b.len()).unwrap_or(0);
    if size <= max_bytes {
        return response.clone();
    }
    let claves: Vec<&String> = response
        .as_object()
        .map(|m| m.keys().collect())
        .unwrap_or_default();
    json!({
        "_truncado": true,
        "bytes_originales": size,
        "claves": claves,
    })
}

/// Key under which a handler describes the event it wants recorded in place of
/// the default `endpoint_call`.
pub const RECORD_KEY: &str = "registro_memoria";

/// A handler's description of the event to persist for its call.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub event_type: EventType,
    pub texto_semantico: String,
    /// Handler-supplied fields, stored under `metadata.registro`.
    pub metadata: Map<String, Value>,
}

/// Remove and parse the handler's record request from its response.
pub fn take_record(response: &mut Value) -> Option<MemoryRecord> {
    let raw = response.as_object_mut()?.remove(RECORD_KEY)?;
    let event_type = raw.get("event_type")?.as_str()?.parse().ok()?;
    let texto_semantico = raw
        .get("texto_semantico")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let metadata = raw
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(MemoryRecord {
        event_type,
        texto_semantico,
        metadata,
    })
}

/// Inputs for the events of one invocation.
pub struct Invocation<'a> {
    pub identity: &'a Identity,
    pub context: &'a WorkingContext,
    pub endpoint: &'a str,
    pub request_id: &'a str,
    pub fields: Map<String, Value>,
    pub user_text: Option<&'a str>,
    /// Handler output, or the `{success:false, error}` stand-in when it failed.
    pub response: &'a Value,
    pub success: bool,
    pub record: Option<MemoryRecord>,
    pub max_response_bytes: usize,
}

/// A `user_input` event when the request carries user text, then the
/// `endpoint_call` (or `error`) event.
pub fn events_for(inv: &Invocation<'_>, ids: &EventIdGenerator) -> Vec<MemoryEvent> {
    let params = sanitize(&Value::Object(inv.fields.clone()));
    let mut events = Vec::with_capacity(2);

    let mut provenance = json!({
        "wrapper_aplicado": true,
        "memoria_aplicada": inv.context.total_interacciones_sesion > 0,
        "fuente_identidad": inv.identity.source,
        "request_id": inv.request_id,
    });
    if !inv.context.resumen_conversacion.is_empty() {
        provenance["resumen_contexto_previo"] = json!(inv.context.resumen_conversacion);
    }

    if let Some(text) = inv.user_text {
        let (timestamp, ts_epoch) = utc_now();
        events.push(MemoryEvent {
            id: ids.event_id(&inv.identity.session_id, inv.endpoint),
            session_id: inv.identity.session_id.clone(),
            agent_id: inv.identity.agent_id.clone(),
            endpoint: inv.endpoint.to_string(),
            event_type: EventType::UserInput,
            timestamp,
            ts_epoch,
            params: params.clone(),
            response_data: json!({}),
            texto_semantico: summarize_user_input(text),
            success: true,
            metadata: provenance.clone(),
        });
    }

    let (event_type, texto_semantico, registro) = match (&inv.record, inv.success) {
        (Some(record), true) => (record.event_type, record.texto_semantico.clone(), Some(&record.metadata)),
        (_, success) => (
            if success {
                EventType::EndpointCall
            } else {
                EventType::Error
            },
            summarize_event(inv.endpoint, &params, inv.response, success),
            None,
        ),
    };
    if let Some(registro) = registro.filter(|m| !m.is_empty()) {
        provenance["registro"] = sanitize(&Value::Object(registro.clone()));
    }
    let (timestamp, ts_epoch) = utc_now();
    events.push(MemoryEvent {
        id: ids.event_id(&inv.identity.session_id, inv.endpoint),
        session_id: inv.identity.session_id.clone(),
        agent_id: inv.identity.agent_id.clone(),
        endpoint: inv.endpoint.to_string(),
        event_type,
        timestamp,
        ts_epoch,
        texto_semantico,
        params,
        response_data: truncate_response(inv.response, inv.max_response_bytes),
        success: inv.success,
        metadata: provenance,
    });

    events
}
