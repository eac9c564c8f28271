//! Conversation identity resolution.
//!
//! [`IdentityResolver::resolve`] always produces an [`Identity`]. It walks headers,
//! query, and body for a session id, optionally asks the agent host's thread API,
//! and otherwise derives a deterministic `auto_<hash>` from the caller's
//! fingerprint or settles on `fallback_session`. The chosen [`IdentitySource`]
//! travels with the identity so later stages can discount low-trust ids.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IdentityConfig;
use crate::memory::cache::{thread_key, ContextCache};
use crate::memory::types::{Identity, IdentitySource};
use crate::wrapper::request::ToolRequest;

/// Session id used when nothing at all identifies the caller.
pub const FALLBACK_SESSION: &str = "fallback_session";

/// Time reserved after the upstream lookup inside an identity budget.
pub const UPSTREAM_MARGIN: Duration = Duration::from_millis(250);

const SESSION_HEADERS: &[&str] = &["session-id", "x-session-id"];
const THREAD_HEADERS: &[&str] = &["thread-id", "x-thread-id"];
const AGENT_HEADERS: &[&str] = &["agent-id", "x-agent-id"];

/// The agent host's "latest thread" lookup.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    /// Id of the caller's active thread, or `None` if unknown or unreachable.
    async fn latest_thread(&self) -> Option<String>;
}

/// [`ThreadSource`] over an HTTP thread-list API.
///
/// Accepts `{"data": [{"id": ...}]}`, `{"threads": [{"id": ...}]}`, or
/// `{"id": ...}` and takes the first id.
pub struct HttpThreadSource {
    url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpThreadSource {
    pub fn new(config: &IdentityConfig) -> Option<Self> {
        let url = config.thread_api_url.clone().filter(|u| !u.trim().is_empty())?;
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .ok()?;
        Some(Self {
            url,
            api_key: config.thread_api_key.clone(),
            http_client,
        })
    }
}

fn first_thread_id(body: &Value) -> Option<String> {
    let from_list = |key: &str| {
        body.get(key)?
            .as_array()?
            .first()?
            .get("id")?
            .as_str()
            .map(str::to_string)
    };
    from_list("data")
        .or_else(|| from_list("threads"))
        .or_else(|| body.get("id")?.as_str().map(str::to_string))
        .filter(|id| !id.trim().is_empty())
}

#[async_trait]
impl ThreadSource for HttpThreadSource {
    async fn latest_thread(&self) -> Option<String> {
        let mut request = self.http_client.get(&self.url);
        if let Some(ref key) = self.api_key {
            request = request.header("api-key", key);
        }
        let response = match request.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = r.status().as_u16(), "thread API returned an error");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "thread API unreachable");
                return None;
            }
        };
        let body: Value = response.json().await.ok()?;
        first_thread_id(&body)
    }
}

pub struct IdentityResolver {
    config: IdentityConfig,
    thread_source: Option<Arc<dyn ThreadSource>>,
    cache: Arc<ContextCache>,
}

impl IdentityResolver {
    pub fn new(
        config: IdentityConfig,
        thread_source: Option<Arc<dyn ThreadSource>>,
        cache: Arc<ContextCache>,
    ) -> Self {
        Self {
            config,
            thread_source,
            cache,
        }
    }

    /// Resolve `(session_id, agent_id, source)`. Never fails.
    pub async fn resolve(&self, request: &ToolRequest) -> Identity {
        self.resolve_within(request, self.config.timeout() + UPSTREAM_MARGIN).await
    }

    /// Resolve inside an overall `budget`. The upstream lookup gives up at least
    /// [`UPSTREAM_MARGIN`] before the budget runs out, so a hanging thread API
    /// still leaves room for the deterministic id.
    pub async fn resolve_within(&self, request: &ToolRequest, budget: Duration) -> Identity {
        let upstream_limit = self.config.timeout().min(budget.saturating_sub(UPSTREAM_MARGIN));
        let agent_id = self.resolve_agent(request);
        let (session_id, source) = match explicit_session(request) {
            Some(found) => found,
            None => match self.upstream_session(request, upstream_limit).await {
                Some(id) => (id, IdentitySource::UpstreamApi),
                None => local_session(request),
            },
        };

        if source.is_degraded() {
            tracing::debug!(session_id = %session_id, %source, "identity derived without client hints");
        }

        Identity {
            session_id,
            agent_id,
            source,
        }
    }

    /// Identity from the request alone, skipping the upstream lookup.
    pub fn resolve_local(&self, request: &ToolRequest) -> Identity {
        let (session_id, source) = explicit_session(request).unwrap_or_else(|| local_session(request));
        Identity {
            session_id,
            agent_id: self.resolve_agent(request),
            source,
        }
    }

    fn resolve_agent(&self, request: &ToolRequest) -> String {
        AGENT_HEADERS
            .iter()
            .find_map(|h| request.header(h))
            .or_else(|| request.query_param("agent_id"))
            .or_else(|| request.body_str(&["agent_id"]))
            .or_else(|| request.body_str(&["metadata", "agent_id"]))
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_agent.clone())
    }

    async fn upstream_session(&self, request: &ToolRequest, limit: Duration) -> Option<String> {
        if !self.config.upstream_enabled || !self.config.is_hosted() {
            return None;
        }
        let source = self.thread_source.as_ref()?;

        let key = thread_key(&format!("latest:{}", fingerprint(request)));
        if let Some(id) = self.cache.get(&key).and_then(|v| v["thread_id"].as_str().map(str::to_string)) {
            return Some(id);
        }

        match tokio::time::timeout(limit, source.latest_thread()).await {
            Ok(Some(id)) => {
                self.cache.set(&key, json!({ "thread_id": id }));
                Some(id)
            }
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "thread API timed out");
                None
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}

/// Steps 1-5: headers, query, body.
fn explicit_session(request: &ToolRequest) -> Option<(String, IdentitySource)> {
    let header = SESSION_HEADERS
        .iter()
        .chain(THREAD_HEADERS)
        .find_map(|h| request.header(h));
    if let Some(id) = header {
        return Some((id.to_string(), IdentitySource::Header));
    }
    if let Some(id) = request.query_param("session_id") {
        return Some((id.to_string(), IdentitySource::Query));
    }
    let body_paths: &[&[&str]] = &[
        &["session_id"],
        &["thread_id"],
        &["metadata", "thread_id"],
        &["context", "conversation_id"],
    ];
    body_paths
        .iter()
        .find_map(|path| request.body_str(path))
        .map(|id| (id.to_string(), IdentitySource::Body))
}

fn fingerprint(request: &ToolRequest) -> String {
    let ua = request.header("user-agent").unwrap_or_default();
    let xff = request.header("x-forwarded-for").unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(ua.as_bytes());
    hasher.update(b"|");
    hasher.update(xff.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Steps 7-8: the deterministic id, else the shared fallback session.
fn local_session(request: &ToolRequest) -> (String, IdentitySource) {
    match deterministic_session(request) {
        Some(id) => (id, IdentitySource::Deterministic),
        None => (FALLBACK_SESSION.to_string(), IdentitySource::Fallback),
    }
}

/// Step 7: `auto_<16 hex>` from User-Agent and X-Forwarded-For, when either is present.
fn deterministic_session(request: &ToolRequest) -> Option<String> {
    if request.header("user-agent").is_none() && request.header("x-forwarded-for").is_none() {
        return None;
    }
    Some(format!("auto_{}", fingerprint(request)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_shapes() {
        assert_eq!(
            first_thread_id(&json!({"data": [{"id": "th_1"}, {"id": "th_2"}]})).as_deref(),
            Some("th_1")
        );
        assert_eq!(
            first_thread_id(&json!({"threads": [{"id": "th_9"}]})).as_deref(),
            Some("th_9")
        );
        assert_eq!(first_thread_id(&json!({"id": "th_3"})).as_deref(), Some("th_3"));
        assert_eq!(first_thread_id(&json!({"data": []})), None);
        assert_eq!(first_thread_id(&json!({"id": " "})), None);
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = ToolRequest::new("status").with_header("User-Agent", "curl/8");
        let b = ToolRequest::new("other").with_header("user-agent", "curl/8");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 16);
        assert_eq!(
            deterministic_session(&a).unwrap(),
            format!("auto_{}", fingerprint(&a))
        );
        assert_eq!(deterministic_session(&ToolRequest::new("status")), None);
    }

    #[test]
    fn http_thread_source_requires_url() {
        assert!(HttpThreadSource::new(&IdentityConfig::default()).is_none());
    }
}
