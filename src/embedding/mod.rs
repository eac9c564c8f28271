//! Text-to-vector embedding.
//!
//! [`EmbeddingProvider`] is the raw seam: one text in, one vector or an
//! [`EmbeddingError`] out. [`Embedder`] is what the rest of the crate uses. It
//! truncates input, applies the deadline, checks the dimension, and turns every
//! failure into `None` while remembering that embeddings are currently degraded.
//! Providers are built from configuration by [`create_provider`].

pub mod local;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Default input cap in characters.
pub const MAX_EMBED_CHARS: usize = 8_000;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single, already-truncated text.
    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Model identifier, recorded alongside the index.
    fn model(&self) -> &str;
}

/// Failure-tolerant embedding façade shared by the retriever, indexer, and tools.
pub struct Embedder {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    dimensions: usize,
    max_chars: usize,
    timeout: Duration,
    degraded: AtomicBool,
}

impl Embedder {
    pub fn new(provider: Option<Arc<dyn EmbeddingProvider>>, config: &EmbeddingConfig) -> Self {
        let degraded = provider.is_none();
        Self {
            provider,
            dimensions: config.dimensions,
            max_chars: config.max_chars.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            degraded: AtomicBool::new(degraded),
        }
    }

    /// An embedder without a provider; every call returns `None`.
    pub fn disabled(dimensions: usize) -> Self {
        Self::new(
            None,
            &EmbeddingConfig {
                dimensions,
                ..EmbeddingConfig::default()
            },
        )
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model(&self) -> Option<&str> {
        self.provider.as_deref().map(|p| p.model())
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// True when there is no provider or the most recent call failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Embed `text`, or `None` if the text is blank or the provider fails,
    /// times out, or returns the wrong dimension.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let provider = self.provider.as_ref()?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let input: String = text.chars().take(self.max_chars).collect();

        let outcome = match tokio::time::timeout(self.timeout, provider.embed_raw(&input)).await {
            Ok(Ok(vector)) if vector.len() == self.dimensions => Ok(vector),
            Ok(Ok(vector)) => Err(format!(
                "provider returned {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", self.timeout.as_millis())),
        };

        match outcome {
            Ok(vector) => {
                self.degraded.store(false, Ordering::Relaxed);
                Some(vector)
            }
            Err(reason) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(model = provider.model(), %reason, "embedding unavailable");
                } else {
                    tracing::debug!(%reason, "embedding still unavailable");
                }
                None
            }
        }
    }
}

/// Build the configured provider. `provider = "none"` yields `Ok(None)`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "http" => Ok(Some(Arc::new(remote::HttpEmbeddingProvider::new(config)?))),
        "local" => Ok(Some(Arc::new(local::LocalEmbeddingProvider::new(config)?))),
        "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: http, local, none"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Fixed {
        dims: usize,
        seen_len: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.seen_len.store(text.chars().count(), Ordering::Relaxed);
            Ok(vec![1.0; self.dims])
        }
        fn dimensions(&self) -> usize {
            self.dims
        }
        fn model(&self) -> &str {
            "fixed"
        }
    }

    struct Slow;

    #[async_trait]
    impl EmbeddingProvider for Slow {
        async fn embed_raw(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![0.0; 4])
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn model(&self) -> &str {
            "slow"
        }
    }

    fn config(dims: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions: dims,
            max_chars: 10,
            timeout_ms: 50,
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn truncates_input_and_checks_dimensions() {
        let fixed = Arc::new(Fixed {
            dims: 4,
            seen_len: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(Some(fixed.clone()), &config(4));
        assert!(embedder.embed(&"x".repeat(100)).await.is_some());
        assert_eq!(fixed.seen_len.load(Ordering::Relaxed), 10);
        assert!(!embedder.is_degraded());

        let mismatched = Embedder::new(Some(fixed), &config(8));
        assert!(mismatched.embed("hola").await.is_none());
        assert!(mismatched.is_degraded());
    }

    #[tokio::test]
    async fn blank_text_is_not_a_failure() {
        let fixed = Arc::new(Fixed {
            dims: 4,
            seen_len: AtomicUsize::new(0),
        });
        let embedder = Embedder::new(Some(fixed), &config(4));
        assert!(embedder.embed("   ").await.is_none());
        assert!(!embedder.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_none() {
        let embedder = Embedder::new(Some(Arc::new(Slow)), &config(4));
        assert!(embedder.embed("hola").await.is_none());
        assert!(embedder.is_degraded());
    }

    #[tokio::test]
    async fn disabled_embedder() {
        let embedder = Embedder::disabled(4);
        assert!(!embedder.is_available());
        assert!(embedder.is_degraded());
        assert!(embedder.embed("hola").await.is_none());
    }

    #[test]
    fn none_provider_builds() {
        let cfg = EmbeddingConfig {
            provider: "none".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&cfg).unwrap().is_none());
        let bad = EmbeddingConfig {
            provider: "magic".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&bad).is_err());
    }
}
