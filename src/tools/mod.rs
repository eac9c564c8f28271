//! Built-in memory tools.
//!
//! Each tool is a [`ToolHandler`] reached through the request wrapper, so its own
//! calls are recorded like any other endpoint. Tools only read memory;
//! `guardar-memoria` describes the snapshot it wants and the wrapper writes it.

pub mod buscar;
pub mod global;
pub mod guardar;
pub mod historial;
pub mod status;

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::memory::dedup_key;
use crate::memory::types::{MemoryEvent, VectorHit};
use crate::services::MemoryServices;
use crate::wrapper::handler::ToolRegistry;

pub const HISTORIAL: &str = "historial-interacciones";
pub const BUSCAR: &str = "buscar-memoria";
pub const GUARDAR: &str = "guardar-memoria";
pub const GLOBAL: &str = "memoria-global";
pub const STATUS: &str = "status";

/// Registry with every built-in tool.
pub fn memory_tools(services: &Arc<MemoryServices>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(historial::HistorialTool::new(services.clone())));
    registry.register(Arc::new(buscar::BuscarTool::new(services.clone())));
    registry.register(Arc::new(guardar::GuardarTool));
    registry.register(Arc::new(global::GlobalTool::new(services.clone())));
    registry.register(Arc::new(status::StatusTool::new(services.clone())));
    registry
}

/// Compact event view returned by the tools (no params or response payloads).
pub fn event_view(event: &MemoryEvent) -> Value {
    json!({
        "id": event.id,
        "session_id": event.session_id,
        "endpoint": event.endpoint,
        "event_type": event.event_type,
        "timestamp": event.timestamp,
        "texto_semantico": event.texto_semantico,
        "success": event.success,
    })
}

pub fn hit_view(hit: &VectorHit) -> Value {
    json!({
        "id": hit.doc.id,
        "session_id": hit.doc.session_id,
        "endpoint": hit.doc.endpoint,
        "event_type": hit.doc.tipo,
        "timestamp": hit.doc.timestamp,
        "texto_semantico": hit.doc.texto_semantico,
        "success": hit.doc.exito,
        "score": hit.score,
    })
}

/// Non-blank string field, first of `keys` that is present.
pub(crate) fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match fields.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// Unsigned number given either as JSON number or numeric string.
pub(crate) fn number_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<usize> {
    keys.iter().find_map(|k| match fields.get(*k)? {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Events sharing a dedup prefix, newest representative first.
#[derive(Debug, Clone)]
pub struct PrefixGroup {
    pub representative: MemoryEvent,
    pub duplicates: usize,
    pub sessions: Vec<String>,
}

/// Collapse events whose `texto_semantico` prefixes coincide, keeping the first
/// (input order) as representative.
pub fn group_by_prefix(events: Vec<MemoryEvent>, prefix_chars: usize) -> Vec<PrefixGroup> {
    let mut groups = Vec::new();
    extend_groups(&mut groups, events, prefix_chars);
    groups
}

/// Fold more events into existing groups; new prefixes append groups at the end.
pub fn extend_groups(groups: &mut Vec<PrefixGroup>, events: Vec<MemoryEvent>, prefix_chars: usize) {
    let mut keys: Vec<String> = groups
        .iter()
        .map(|g| dedup_key(&g.representative.texto_semantico, prefix_chars))
        .collect();
    for event in events {
        let key = dedup_key(&event.texto_semantico, prefix_chars);
        match keys.iter().position(|k| *k == key) {
            Some(i) => {
                let group = &mut groups[i];
                group.duplicates += 1;
                if !group.sessions.contains(&event.session_id) {
                    group.sessions.push(event.session_id.clone());
                }
            }
            None => {
                keys.push(key);
                groups.push(PrefixGroup {
                    sessions: vec![event.session_id.clone()],
                    representative: event,
                    duplicates: 0,
                });
            }
        }
    }
}
