//! Core memory type definitions.
//!
//! Defines [`MemoryEvent`] (the append-only unit of memory), [`EventType`],
//! [`VectorDoc`] (its projection into the vector index), [`Identity`] and
//! [`IdentitySource`] (who is talking), and [`WorkingContext`] (the per-request
//! view handed to tool handlers).

use serde::{Deserialize, Serialize};

/// Kind of interaction a [`MemoryEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Text the user sent along with a tool call.
    UserInput,
    /// A tool handler ran to completion.
    EndpointCall,
    /// A user-visible answer produced by the agent.
    AssistantOutput,
    /// An explicitly saved memory.
    Snapshot,
    /// A tool handler failed.
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::EndpointCall => "endpoint_call",
            Self::AssistantOutput => "assistant_output",
            Self::Snapshot => "snapshot",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_input" => Ok(Self::UserInput),
            "endpoint_call" => Ok(Self::EndpointCall),
            "assistant_output" => Ok(Self::AssistantOutput),
            "snapshot" => Ok(Self::Snapshot),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// How the conversation identity was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    Header,
    Query,
    Body,
    UpstreamApi,
    Deterministic,
    Fallback,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Query => "query",
            Self::Body => "body",
            Self::UpstreamApi => "upstream_api",
            Self::Deterministic => "deterministic",
            Self::Fallback => "fallback",
        }
    }

    /// Client-supplied identities allow session-scoped vector searches.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Header | Self::Query | Self::Body)
    }

    /// The resolver had to invent the identity.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Deterministic | Self::Fallback)
    }
}

impl std::fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved conversation identity for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub session_id: String,
    pub agent_id: String,
    pub source: IdentitySource,
}

/// The append-only record of one interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// `{session_id}_{endpoint}_{monotonic_suffix}`.
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub endpoint: String,
    pub event_type: EventType,
    /// RFC 3339 UTC with milliseconds.
    pub timestamp: String,
    pub ts_epoch: i64,
    /// Sanitized request inputs.
    pub params: serde_json::Value,
    /// Handler result, truncated to the configured size.
    pub response_data: serde_json::Value,
    /// Short natural-language summary; the only text that gets embedded.
    pub texto_semantico: String,
    pub success: bool,
    /// Wrapper provenance (`wrapper_aplicado`, `fuente_identidad`, ...).
    pub metadata: serde_json::Value,
}

/// A change-feed entry: an event plus its store sequence number.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub seq: i64,
    pub event: MemoryEvent,
}

/// Projection of a [`MemoryEvent`] into the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDoc {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub endpoint: String,
    /// RFC 3339 with milliseconds and trailing `Z`.
    pub timestamp: String,
    pub ts_epoch: i64,
    pub tipo: EventType,
    pub texto_semantico: String,
    pub exito: bool,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

impl VectorDoc {
    /// Project an event and its embedding. Returns `None` if the event's timestamp
    /// cannot be normalized.
    pub fn project(event: &MemoryEvent, vector: Vec<f32>) -> Option<Self> {
        let timestamp = super::normalize_timestamp(&event.timestamp)?;
        Some(Self {
            id: event.id.clone(),
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            endpoint: event.endpoint.clone(),
            timestamp,
            ts_epoch: event.ts_epoch,
            tipo: event.event_type,
            texto_semantico: event.texto_semantico.clone(),
            exito: event.success,
            vector,
        })
    }
}

/// A vector index result with its similarity score (higher is better).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    #[serde(flatten)]
    pub doc: VectorDoc,
    pub score: f64,
}

/// Per-request view of the conversation, built by the retriever and read by handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingContext {
    pub session_id: String,
    pub agent_id: String,
    /// Newest-first events from the event store, minus those already in `docs_vectoriales`.
    pub interacciones_recientes: Vec<MemoryEvent>,
    /// Relevance-ranked documents from the vector index.
    pub docs_vectoriales: Vec<VectorHit>,
    pub resumen_conversacion: String,
    pub ultima_actividad: Option<String>,
    pub total_interacciones_sesion: u64,
    pub memoria_aplicada: bool,
    pub fuente_identidad: IdentitySource,
}

impl WorkingContext {
    /// A context with no memory, used when retrieval is skipped or fails.
    pub fn empty(identity: &Identity) -> Self {
        Self {
            session_id: identity.session_id.clone(),
            agent_id: identity.agent_id.clone(),
            interacciones_recientes: Vec::new(),
            docs_vectoriales: Vec::new(),
            resumen_conversacion: String::new(),
            ultima_actividad: None,
            total_interacciones_sesion: 0,
            memoria_aplicada: false,
            fuente_identidad: identity.source,
        }
    }

    pub fn len(&self) -> usize {
        self.interacciones_recientes.len() + self.docs_vectoriales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
