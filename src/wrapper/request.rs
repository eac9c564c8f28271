//! Framework-agnostic view of an incoming tool request.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::WrapperError;
use crate::memory::summarize::USER_TEXT_KEYS;

/// A tool invocation as seen by the wrapper: logical endpoint name, lowercased
/// headers, query parameters, and the parsed JSON body (`Null` when absent).
#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
    pub endpoint: String,
    pub method: String,
    headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
}

impl ToolRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: "POST".into(),
            ..Self::default()
        }
    }

    /// Build from raw transport parts. An empty body is `Null`; anything else
    /// must be valid JSON.
    pub fn from_parts(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        headers: impl IntoIterator<Item = (String, String)>,
        query: HashMap<String, String>,
        raw_body: &[u8],
    ) -> Result<Self, WrapperError> {
        let body = if raw_body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(raw_body)
                .map_err(|e| WrapperError::MalformedRequest(format!("body is not valid JSON: {e}")))?
        };
        Ok(Self {
            endpoint: endpoint.into(),
            method: method.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            query,
            body,
        })
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// Non-blank header value, case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Non-blank string at `path` inside the body object.
    pub fn body_str(&self, path: &[&str]) -> Option<&str> {
        let mut node = &self.body;
        for key in path {
            node = node.as_object()?.get(*key)?;
        }
        node.as_str().map(str::trim).filter(|s| !s.is_empty())
    }

    /// The user's own words, if the request carries any.
    pub fn user_text(&self) -> Option<&str> {
        USER_TEXT_KEYS
            .iter()
            .find_map(|k| self.body_str(&[*k]))
            .or_else(|| USER_TEXT_KEYS.iter().find_map(|k| self.query_param(k)))
    }

    /// Query parameters overlaid with body fields (body wins).
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields: Map<String, Value> = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        if let Value::Object(body) = &self.body {
            for (k, v) in body {
                fields.insert(k.clone(), v.clone());
            }
        }
        fields
    }
}
