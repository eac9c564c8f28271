pub mod cache;
pub mod index;
pub mod indexer;
pub mod query;
pub mod retrieval;
pub mod store;
pub mod summarize;
pub mod types;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum `texto_semantico` length for an event to be indexed or used as context.
pub const MIN_INDEX_CHARS: usize = 30;

/// Hard cap on `texto_semantico`.
pub const MAX_TEXTO_CHARS: usize = 10_000;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`] for little-endian f32 blobs.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Current time as (`RFC 3339 millis Z`, epoch seconds).
pub fn utc_now() -> (String, i64) {
    let now = Utc::now();
    (now.to_rfc3339_opts(SecondsFormat::Millis, true), now.timestamp())
}

/// Parse a timestamp in any of the accepted shapes: RFC 3339 with any offset,
/// naive `YYYY-MM-DDTHH:MM:SS[.fff]` (assumed UTC), or a bare date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Normalize a timestamp to RFC 3339 UTC with milliseconds and a trailing `Z`.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Truncate to `max_chars` characters, appending "..." if truncated.
pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let kept: String = content.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept.trim_end())
    }
}

/// Key used to collapse near-identical events in cross-session views:
/// the first `prefix_chars` characters of the trimmed, lowercased text.
pub fn dedup_key(texto: &str, prefix_chars: usize) -> String {
    texto.trim().to_lowercase().chars().take(prefix_chars).collect()
}

/// Slug an endpoint name for use inside event ids.
pub fn slug_endpoint(endpoint: &str) -> String {
    let slug: String = endpoint
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    if slug.is_empty() {
        "endpoint".into()
    } else {
        slug
    }
}

/// Process-wide generator of strictly increasing id suffixes.
///
/// Seeded from the wall clock in microseconds so suffixes also increase across
/// restarts, and bumped by one whenever two ids are requested in the same tick.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last: AtomicU64,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_suffix(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Build `{session_id}_{endpoint}_{suffix}`.
    pub fn event_id(&self, session_id: &str, endpoint: &str) -> String {
        format!("{session_id}_{}_{}", slug_endpoint(endpoint), self.next_suffix())
    }
}
