//! Natural-language summaries.
//!
//! Event summaries become an event's `texto_semantico`, the only text that is ever
//! embedded. They are single Spanish sentences of at most 300 characters and never
//! a dump of the response. Context summaries describe a working context in at most
//! 500 characters.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::memory::truncate_chars;
use crate::memory::types::{MemoryEvent, VectorHit};

pub const MAX_EVENT_SUMMARY_CHARS: usize = 300;
pub const MAX_CONTEXT_SUMMARY_CHARS: usize = 500;

const MESSAGE_KEYS: &[&str] = &[
    "respuesta_usuario",
    "mensaje",
    "message",
    "resumen",
    "resumen_automatico",
    "resultado",
    "result",
    "estado",
    "status",
];

const ERROR_KEYS: &[&str] = &["error", "detalle", "detail", "mensaje", "message", "reason"];

const PATH_KEYS: &[&str] = &["ruta", "path", "archivo", "file", "blob", "nombre"];

/// Request fields that carry the user's own words.
pub const USER_TEXT_KEYS: &[&str] = &["query", "prompt", "mensaje", "pregunta", "consulta", "q"];

/// Whether `text` looks like serialized JSON rather than prose.
pub fn looks_like_json(text: &str) -> bool {
    let t = text.trim();
    let framed = (t.starts_with('{') && t.ends_with('}')) || (t.starts_with('[') && t.ends_with(']'));
    framed && serde_json::from_str::<Value>(t).is_ok()
}

/// Whether `texto` is a verbatim dump of `response` (or of any JSON at all).
pub fn is_raw_dump(texto: &str, response: &Value) -> bool {
    if looks_like_json(texto) {
        return true;
    }
    match serde_json::to_string(response) {
        Ok(serialized) if serialized.len() > 2 => texto.contains(&serialized),
        _ => false,
    }
}

fn clean_line(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    if looks_like_json(line) || line.starts_with('{') || line.starts_with('[') {
        return None;
    }
    Some(line.to_string())
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    let obj = value.as_object()?;
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => clean_line(s),
        Value::Object(inner) => inner
            .get("mensaje")
            .or_else(|| inner.get("message"))
            .and_then(Value::as_str)
            .and_then(clean_line),
        _ => None,
    })
}

/// First prose-like field in `value`, rendered as `clave: valor`.
fn any_scalar_field(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    obj.iter().find_map(|(k, v)| match v {
        Value::String(s) if s.chars().count() <= 200 => clean_line(s).map(|s| format!("{k}: {s}")),
        Value::Number(n) => Some(format!("{k}: {n}")),
        Value::Bool(b) => Some(format!("{k}: {}", if *b { "sí" } else { "no" })),
        _ => None,
    })
}

fn first_meaningful(params: &Value, response: &Value) -> String {
    string_field(response, MESSAGE_KEYS)
        .or_else(|| string_field(params, USER_TEXT_KEYS))
        .or_else(|| any_scalar_field(response))
        .or_else(|| describe_shape(response))
        .unwrap_or_else(|| "sin detalles".to_string())
}

fn describe_shape(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => Some(format!("{} elementos devueltos", items.len())),
        Value::Object(obj) if !obj.is_empty() => {
            let keys: Vec<&str> = obj.keys().take(4).map(String::as_str).collect();
            Some(format!("campos {}", keys.join(", ")))
        }
        _ => None,
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "éxito"
    } else {
        "error"
    }
}

fn is_file_endpoint(endpoint: &str) -> bool {
    let e = endpoint.to_lowercase();
    e.contains("archivo") || e.contains("file") || e.contains("blob")
}

fn is_diagnostic_endpoint(endpoint: &str) -> bool {
    let e = endpoint.to_lowercase();
    e.contains("diagnostico") || e.contains("diagnóstico") || e.contains("diagnostic")
}

/// One-sentence summary of a tool invocation.
pub fn summarize_event(endpoint: &str, params: &Value, response: &Value, success: bool) -> String {
    let sentence = if is_file_endpoint(endpoint) {
        let path = string_field(params, PATH_KEYS)
            .or_else(|| string_field(response, PATH_KEYS))
            .unwrap_or_else(|| "sin ruta".to_string());
        if success {
            let size = response
                .get("contenido")
                .or_else(|| response.get("content"))
                .and_then(Value::as_str)
                .map(|c| format!(" ({} caracteres)", c.chars().count()))
                .unwrap_or_default();
            format!("Se leyó el archivo {path}{size}")
        } else {
            let reason = string_field(response, ERROR_KEYS).unwrap_or_else(|| "motivo desconocido".into());
            format!("No se pudo leer el archivo {path}: {reason}")
        }
    } else if is_diagnostic_endpoint(endpoint) {
        let target = string_field(params, &["recurso", "resource", "nombre", "name"])
            .map(|r| format!(" de {r}"))
            .unwrap_or_default();
        let detail = string_field(response, MESSAGE_KEYS)
            .or_else(|| {
                response
                    .get("recursos")
                    .and_then(Value::as_array)
                    .map(|r| format!("{} recursos revisados", r.len()))
            })
            .unwrap_or_else(|| "sin hallazgos reportados".into());
        format!("Diagnóstico{target} completado con {}: {detail}", outcome(success))
    } else if !success {
        let reason = string_field(response, ERROR_KEYS).unwrap_or_else(|| "motivo desconocido".into());
        format!("{endpoint} falló: {reason}")
    } else {
        format!(
            "{endpoint} ejecutado con {}: {}",
            outcome(success),
            first_meaningful(params, response)
        )
    };

    guard(truncate_chars(&sentence, MAX_EVENT_SUMMARY_CHARS), endpoint, response, success)
}

/// Summary for the user's own request text.
pub fn summarize_user_input(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let sentence = if line.is_empty() || looks_like_json(&line) {
        "El usuario envió una solicitud sin texto legible".to_string()
    } else {
        format!("El usuario solicitó: {line}")
    };
    truncate_chars(&sentence, MAX_EVENT_SUMMARY_CHARS)
}

/// Summary for an explicitly saved memory. Saved content is the user's own
/// prose, so it is kept (capped) unless it is JSON.
pub fn summarize_snapshot(content: &str, tipo: &str) -> String {
    let line = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if looks_like_json(&line) {
        return format!("Memoria guardada de tipo {tipo} con datos estructurados");
    }
    truncate_chars(&line, crate::memory::MAX_TEXTO_CHARS)
}

/// Replace a summary that slipped through as a dump with the fixed template.
fn guard(sentence: String, endpoint: &str, response: &Value, success: bool) -> String {
    if sentence.trim().is_empty() || is_raw_dump(&sentence, response) {
        format!("{endpoint} ejecutado con {}", outcome(success))
    } else {
        sentence
    }
}

struct Item<'a> {
    endpoint: &'a str,
    timestamp: &'a str,
    ts_epoch: i64,
    success: bool,
}

/// Summary of a working context: dominant endpoints, last activity, and errors.
/// Empty when there is nothing to summarise.
pub fn summarize_context(events: &[MemoryEvent], hits: &[VectorHit]) -> String {
    let mut seen = HashSet::new();
    let items: Vec<Item<'_>> = hits
        .iter()
        .map(|h| (&h.doc.id, Item {
            endpoint: &h.doc.endpoint,
            timestamp: &h.doc.timestamp,
            ts_epoch: h.doc.ts_epoch,
            success: h.doc.exito,
        }))
        .chain(events.iter().map(|e| (&e.id, Item {
            endpoint: &e.endpoint,
            timestamp: &e.timestamp,
            ts_epoch: e.ts_epoch,
            success: e.success,
        })))
        .filter(|(id, _)| seen.insert(*id))
        .map(|(_, item)| item)
        .collect();

    if items.is_empty() {
        return String::new();
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in &items {
        *counts.entry(item.endpoint).or_insert(0) += 1;
    }
    let mut dominant: Vec<(&str, usize)> = counts.into_iter().collect();
    dominant.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let themes = dominant
        .iter()
        .take(3)
        .map(|(ep, n)| format!("{ep} ({n})"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut parts = vec![format!(
        "{} interacciones relevantes; temas dominantes: {themes}.",
        items.len()
    )];

    if let Some(last) = items.iter().max_by_key(|i| i.ts_epoch) {
        parts.push(format!(
            "Última actividad: {} ({}).",
            last.endpoint, last.timestamp
        ));
    }

    let failures: Vec<&Item<'_>> = items.iter().filter(|i| !i.success).collect();
    if !failures.is_empty() {
        let mut failing: Vec<&str> = failures.iter().map(|i| i.endpoint).collect();
        failing.sort_unstable();
        failing.dedup();
        parts.push(format!(
            "Se registraron {} errores recientes en {}.",
            failures.len(),
            failing.join(", ")
        ));
    }

    truncate_chars(&parts.join(" "), MAX_CONTEXT_SUMMARY_CHARS)
}
