//! Tool handler seam and registry.
//!
//! Handlers read the [`WorkingContext`] and return a JSON value; they never write
//! memory themselves. The registry maps logical tool names to handlers so that
//! internal redirection is a function call, never an HTTP round-trip.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::memory::types::WorkingContext;
use crate::wrapper::request::ToolRequest;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Logical endpoint name, e.g. `historial-interacciones`.
    fn name(&self) -> &str;

    async fn handle(&self, request: &ToolRequest, context: &WorkingContext) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn fn_handler<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(ToolRequest, WorkingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolRequest, WorkingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, request: &ToolRequest, context: &WorkingContext) -> Result<Value, HandlerError> {
        (self.f)(request.clone(), context.clone()).await
    }
}

/// Name → handler lookup.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
