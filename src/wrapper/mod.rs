//! The request wrapper.
//!
//! [`MemoryWrapper::invoke`] runs one tool call through
//! identify → retrieve → handle → envelope → persist, each step under its own
//! deadline and the whole call under `wrapper.total_budget_ms`. Degraded steps
//! set metadata flags; only a malformed request or a fault in the wrapper itself
//! leaves as a non-200 status.

pub mod envelope;
pub mod events;
pub mod handler;
pub mod request;

use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::error::{HandlerError, StoreError, WrapperError};
use crate::memory::cache::memoria_key;
use crate::memory::types::{Identity, MemoryEvent, WorkingContext};
use crate::services::MemoryServices;

use envelope::{build_envelope, stamp, EnvelopeContext, Flags};
use events::{events_for, take_record, Invocation};
use handler::{ToolHandler, ToolRegistry};
use request::ToolRequest;

/// Status and JSON body handed back to the transport.
#[derive(Debug, Clone)]
pub struct WrappedResponse {
    pub status: u16,
    pub body: Value,
}

impl WrappedResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Minimal body for the errors that escape the wrapper.
    pub fn from_error(err: &WrapperError) -> Self {
        let status = match err {
            WrapperError::MalformedRequest(_) => 400,
            WrapperError::Fatal(_) => 500,
        };
        Self {
            status,
            body: json!({ "success": false, "error": err.to_string(), "metadata": {} }),
        }
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self {
            status: 404,
            body: json!({
                "success": false,
                "error": format!("herramienta desconocida: {name}"),
                "metadata": {},
            }),
        }
    }
}

#[derive(Clone)]
pub struct MemoryWrapper {
    services: Arc<MemoryServices>,
    registry: Arc<ToolRegistry>,
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// `success`, then `exito`; responses that say neither count as successful
/// unless they carry an `error`.
fn reported_success(response: &Value) -> bool {
    response
        .get("success")
        .and_then(Value::as_bool)
        .or_else(|| response.get("exito").and_then(Value::as_bool))
        .unwrap_or_else(|| response.get("error").map_or(true, Value::is_null))
}

impl MemoryWrapper {
    pub fn new(services: Arc<MemoryServices>, registry: ToolRegistry) -> Self {
        Self {
            services,
            registry: Arc::new(registry),
        }
    }

    pub fn services(&self) -> &Arc<MemoryServices> {
        &self.services
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Route to the handler registered under `request.endpoint`.
    pub async fn dispatch(&self, request: ToolRequest) -> WrappedResponse {
        match self.registry.get(&request.endpoint) {
            Some(handler) => self.invoke(request, handler).await,
            None => WrappedResponse::unknown_tool(&request.endpoint),
        }
    }

    pub async fn invoke(&self, request: ToolRequest, handler: Arc<dyn ToolHandler>) -> WrappedResponse {
        let started = Instant::now();
        let budgets = &self.services.config.wrapper;
        let deadline = started + budgets.total_budget();
        let request_id = Uuid::now_v7().to_string();
        let mut flags = Flags::default();

        let identity = self.identify(&request, &mut flags).await;
        let context = self.retrieve(&request, &identity, deadline, &mut flags).await;

        let (mut response, success) = match self.call_handler(handler, &request, &context, deadline, &mut flags).await {
            Ok(value) => {
                let success = reported_success(&value);
                (value, success)
            }
            Err(e) => {
                tracing::warn!(
                    endpoint = %request.endpoint,
                    session_id = %identity.session_id,
                    kind = e.kind(),
                    "handler failed"
                );
                flags.handler_error = true;
                (json!({ "success": false, "error": e.classified() }), false)
            }
        };
        let record = take_record(&mut response);
        flags.embedding_unavailable |= self.services.embedder.is_degraded();

        let mut body = build_envelope(
            response.clone(),
            &EnvelopeContext {
                identity: &identity,
                context: &context,
                flags,
                request_id: &request_id,
            },
        );

        let events = events_for(
            &Invocation {
                identity: &identity,
                context: &context,
                endpoint: &request.endpoint,
                request_id: &request_id,
                fields: request.fields(),
                user_text: request.user_text(),
                response: &response,
                success,
                record,
                max_response_bytes: budgets.max_response_bytes,
            },
            &self.services.ids,
        );
        let persisted = self.persist(events, &identity.session_id, deadline, &mut flags).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        stamp(&mut body, &flags, elapsed_ms, &persisted);

        tracing::info!(
            endpoint = %request.endpoint,
            session_id = %identity.session_id,
            source = %identity.source,
            elapsed_ms,
            success,
            truncated = flags.truncated,
            "tool invocation complete"
        );
        WrappedResponse::ok(body)
    }

    async fn identify(&self, request: &ToolRequest, flags: &mut Flags) -> Identity {
        let budget = self.services.config.wrapper.identity_budget();
        let resolver = &self.services.resolver;
        let identity = match timeout(budget, resolver.resolve_within(request, budget)).await {
            Ok(identity) => identity,
            Err(_) => {
                tracing::warn!(budget_ms = budget.as_millis() as u64, "identity resolution timed out");
                flags.truncated = true;
                resolver.resolve_local(request)
            }
        };
        flags.identity_degraded = identity.source.is_degraded();
        identity
    }

    async fn retrieve(
        &self,
        request: &ToolRequest,
        identity: &Identity,
        deadline: Instant,
        flags: &mut Flags,
    ) -> WorkingContext {
        let budgets = &self.services.config.wrapper;
        let budget = budgets
            .retrieval_budget()
            .min(remaining(deadline).saturating_sub(budgets.persist_budget()));

        match timeout(budget, self.services.retriever.retrieve(identity, request.user_text())).await {
            Ok(Ok(outcome)) => {
                flags.cache_hit = outcome.cache_hit;
                flags.embedding_unavailable |= outcome.embedding_unavailable;
                flags.retrieval_unavailable |= outcome.partial;
                outcome.context
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %identity.session_id, error = %e, "retrieval failed, continuing without memory");
                flags.retrieval_unavailable = true;
                WorkingContext::empty(identity)
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %identity.session_id,
                    budget_ms = budget.as_millis() as u64,
                    "retrieval timed out, continuing without memory"
                );
                flags.retrieval_unavailable = true;
                flags.truncated = true;
                WorkingContext::empty(identity)
            }
        }
    }

    /// Run the handler on its own task so a panic stays contained.
    async fn call_handler(
        &self,
        handler: Arc<dyn ToolHandler>,
        request: &ToolRequest,
        context: &WorkingContext,
        deadline: Instant,
        flags: &mut Flags,
    ) -> Result<Value, HandlerError> {
        let budget = remaining(deadline).saturating_sub(self.services.config.wrapper.persist_budget());
        let request = request.clone();
        let context = context.clone();
        let task = tokio::spawn(async move { handler.handle(&request, &context).await });
        let abort = task.abort_handle();

        match timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => Err(HandlerError::Panicked(panic_message(join.into_panic()))),
            Ok(Err(join)) => Err(HandlerError::Internal(join.to_string())),
            Err(_) => {
                abort.abort();
                flags.truncated = true;
                Err(HandlerError::Timeout)
            }
        }
    }

    /// Write the invocation's events and drop the session's cached context.
    /// Returns the ids that were written (or queued, with deferred writes).
    async fn persist(
        &self,
        events: Vec<MemoryEvent>,
        session_id: &str,
        deadline: Instant,
        flags: &mut Flags,
    ) -> Vec<String> {
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let store = self.services.store.clone();
        let cache = self.services.cache.clone();
        let key = memoria_key(session_id);
        let write = async move {
            for event in &events {
                store.upsert(event).await?;
            }
            cache.delete(&key);
            Ok::<usize, StoreError>(events.len())
        };

        let budgets = &self.services.config.wrapper;
        if budgets.deferred_writes {
            flags.persistence_deferred = true;
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = write.await {
                    tracing::warn!(session_id = %session_id, error = %e, "deferred persistence failed");
                }
            });
            return ids;
        }

        let budget = budgets.persist_budget().min(remaining(deadline));
        match timeout(budget, write).await {
            Ok(Ok(written)) => {
                tracing::debug!(session_id, written, "events persisted");
                ids
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id, error = %e, "persistence failed");
                flags.persistence_failed = true;
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(session_id, budget_ms = budget.as_millis() as u64, "persistence timed out");
                flags.persistence_failed = true;
                flags.truncated = true;
                Vec::new()
            }
        }
    }
}
