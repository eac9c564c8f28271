//! Conversational memory for agent tool APIs.
//!
//! `memoria` sits in front of tool handlers and gives every call a stable
//! conversation identity, a working context recalled from earlier interactions,
//! and a uniform response envelope. Each call is then recorded as append-only
//! events that a background indexer folds into a vector index.
//!
//! # Architecture
//!
//! - **Storage**: one SQLite file. `memory_events` is the append-only event store
//!   and its change feed; `vector_docs` (with FTS5 and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec)) is the rebuildable index.
//! - **Embeddings**: an OpenAI-compatible HTTP endpoint or a local ONNX model; both
//!   optional, with lexical fallback.
//! - **Recall**: recent-by-time events backfilled behind relevance-ranked documents.
//! - **Transport**: an axum HTTP server; the wrapper itself is framework-agnostic.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: embedding providers and the failure-tolerant [`embedding::Embedder`]
//! - [`identity`]: conversation identity resolution
//! - [`memory`]: event store, vector index, indexer, cache, query builder, retriever, summaries
//! - [`wrapper`]: the request wrapper, envelope builder, and handler registry
//! - [`tools`]: built-in memory tools (history, search, save, global view, status)
//! - [`server`]: HTTP routes

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod identity;
pub mod memory;
pub mod server;
pub mod services;
pub mod tools;
pub mod wrapper;
