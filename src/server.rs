//! HTTP surface.
//!
//! Every tool route funnels into [`MemoryWrapper::dispatch`]; the router only
//! translates between axum extractors and [`ToolRequest`]/[`WrappedResponse`].
//! [`serve`] wires the services, the background indexer, and graceful shutdown.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::MemoriaConfig;
use crate::services::MemoryServices;
use crate::tools::{self, BUSCAR, GLOBAL, GUARDAR, HISTORIAL};
use crate::wrapper::request::ToolRequest;
use crate::wrapper::{MemoryWrapper, WrappedResponse};

type Params = Query<HashMap<String, String>>;

/// Routes for the memory endpoints, `/api/{tool}`, and `/health`.
pub fn router(wrapper: MemoryWrapper) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/memoria/historial", get(historial).post(historial))
        .route("/memoria/buscar", post(buscar))
        .route("/memoria/guardar", post(guardar))
        .route("/memoria/global", get(global))
        .route("/api/{tool}", get(api_tool).post(api_tool))
        .with_state(wrapper)
}

impl IntoResponse for WrappedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

async fn run_tool(
    wrapper: &MemoryWrapper,
    tool: &str,
    method: Method,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> WrappedResponse {
    let headers = headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    match ToolRequest::from_parts(tool, method.as_str(), headers, query, &body) {
        Ok(request) => wrapper.dispatch(request).await,
        Err(e) => {
            tracing::warn!(tool, error = %e, "rejected request");
            WrappedResponse::from_error(&e)
        }
    }
}

async fn historial(
    State(wrapper): State<MemoryWrapper>,
    method: Method,
    headers: HeaderMap,
    Query(query): Params,
    body: Bytes,
) -> WrappedResponse {
    run_tool(&wrapper, HISTORIAL, method, headers, query, body).await
}

async fn buscar(
    State(wrapper): State<MemoryWrapper>,
    method: Method,
    headers: HeaderMap,
    Query(query): Params,
    body: Bytes,
) -> WrappedResponse {
    run_tool(&wrapper, BUSCAR, method, headers, query, body).await
}

async fn guardar(
    State(wrapper): State<MemoryWrapper>,
    method: Method,
    headers: HeaderMap,
    Query(query): Params,
    body: Bytes,
) -> WrappedResponse {
    run_tool(&wrapper, GUARDAR, method, headers, query, body).await
}

async fn global(
    State(wrapper): State<MemoryWrapper>,
    method: Method,
    headers: HeaderMap,
    Query(query): Params,
    body: Bytes,
) -> WrappedResponse {
    run_tool(&wrapper, GLOBAL, method, headers, query, body).await
}

async fn api_tool(
    State(wrapper): State<MemoryWrapper>,
    Path(tool): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(query): Params,
    body: Bytes,
) -> WrappedResponse {
    run_tool(&wrapper, &tool, method, headers, query, body).await
}

async fn health(State(wrapper): State<MemoryWrapper>) -> Response {
    let services = wrapper.services();
    let store = services.store.latest_seq().await;
    let index = services.index.count().await;
    let cache = services.cache.ping();

    let healthy = store.is_ok() && index.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "store": store.as_ref().map(|_| "ok").unwrap_or("error"),
        "index": index.as_ref().map(|_| "ok").unwrap_or("error"),
        "cache": if cache { "ok" } else { "disabled" },
        "embeddings": if services.embedder.is_degraded() { "degraded" } else { "ok" },
        "eventos": store.ok(),
        "documentos": index.ok(),
        "herramientas": wrapper.registry().names(),
    });
    (status, Json(body)).into_response()
}

/// Run the HTTP server and the background indexer until Ctrl-C.
pub async fn serve(config: MemoriaConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let indexer_enabled = config.indexer.enabled;

    let services = Arc::new(MemoryServices::open(config)?);
    let registry = tools::memory_tools(&services);
    tracing::info!(tools = ?registry.names(), "tool registry ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let indexer = indexer_enabled.then(|| Arc::new(services.indexer()).spawn(shutdown_rx));

    let wrapper = MemoryWrapper::new(services.clone(), registry);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "memoria listening");

    axum::serve(listener, router(wrapper))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = indexer {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "indexer task ended abnormally");
        }
    }
    Ok(())
}
