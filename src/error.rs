//! Error types and the degradation taxonomy.
//!
//! Component boundaries return typed errors ([`StoreError`], [`EmbeddingError`],
//! [`QueryError`], [`HandlerError`]). Only [`WrapperError`] escapes the request
//! wrapper; everything else is downgraded to a [`Degradation`] flag on the response.

use serde::Serialize;
use thiserror::Error;

/// Errors from the event store and the vector index.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("query spans partitions without the cross_partition flag")]
    CrossPartition,

    #[error("vector has {got} dimensions, index expects {expected}")]
    Dimension { expected: usize, got: usize },

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Errors from an embedding provider. Never surfaced to callers of the
/// [`Embedder`](crate::embedding::Embedder) façade, which returns `None` instead.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding provider returned HTTP {0}")]
    Status(u16),

    #[error("malformed embedding response: {0}")]
    Response(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("embedding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Validation errors from the semantic query builder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown event_type: {0}")]
    EventType(String),

    #[error("invalid date '{0}', expected RFC 3339 or YYYY-MM-DD")]
    Date(String),

    #[error("order must be 'asc' or 'desc', got '{0}'")]
    Order(String),

    #[error("date_start is after date_end")]
    EmptyWindow,
}

/// Failure reported by a tool handler. The wrapper turns it into
/// `{success: false, error: "<kind>: <message>"}` with HTTP 200.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Upstream(String),

    #[error("handler exceeded its deadline")]
    Timeout,

    #[error("{0}")]
    Panicked(String),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "entrada_invalida",
            Self::NotFound(_) => "no_encontrado",
            Self::Upstream(_) => "error_servicio_externo",
            Self::Timeout => "tiempo_agotado",
            Self::Panicked(_) => "handler_panic",
            Self::Internal(_) => "error_interno",
        }
    }

    /// Classified single-line description: `"<kind>: <first line of message>"`,
    /// capped at 200 characters. Never contains a backtrace.
    pub fn classified(&self) -> String {
        let message = self.to_string();
        let first_line = message.lines().next().unwrap_or_default().trim();
        let first_line: String = first_line.chars().take(200).collect();
        if first_line.is_empty() {
            self.kind().to_string()
        } else {
            format!("{}: {}", self.kind(), first_line)
        }
    }
}

impl From<QueryError> for HandlerError {
    fn from(e: QueryError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// The only errors that propagate past the request wrapper.
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("internal fault: {0}")]
    Fatal(String),
}

/// Non-fatal conditions that the wrapper records as metadata flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    IdentityDegraded,
    RetrievalUnavailable,
    EmbeddingUnavailable,
    PersistenceFailed,
    HandlerError,
}

impl Degradation {
    /// Metadata key set to `true` when this degradation occurs.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::IdentityDegraded => "identity_degraded",
            Self::RetrievalUnavailable => "retrieval_unavailable",
            Self::EmbeddingUnavailable => "embedding_unavailable",
            Self::PersistenceFailed => "persistence_failed",
            Self::HandlerError => "handler_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_uses_first_line_only() {
        let err = HandlerError::Internal("boom\n   at frame 1\n   at frame 2".into());
        assert_eq!(err.classified(), "error_interno: boom");
    }

    #[test]
    fn classified_is_capped() {
        let err = HandlerError::Upstream("x".repeat(500));
        let classified = err.classified();
        assert!(classified.starts_with("error_servicio_externo: "));
        assert!(classified.chars().count() <= "error_servicio_externo: ".len() + 200);
    }

    #[test]
    fn timeout_has_kind() {
        assert_eq!(
            HandlerError::Timeout.classified(),
            "tiempo_agotado: handler exceeded its deadline"
        );
    }

    #[test]
    fn query_error_maps_to_invalid_input() {
        let err: HandlerError = QueryError::Order("sideways".into()).into();
        assert_eq!(err.kind(), "entrada_invalida");
    }

    #[test]
    fn degradation_flags() {
        assert_eq!(Degradation::EmbeddingUnavailable.flag(), "embedding_unavailable");
        assert_eq!(Degradation::PersistenceFailed.flag(), "persistence_failed");
    }
}
