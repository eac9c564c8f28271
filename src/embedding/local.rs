//! Local ONNX Runtime embedding provider.
//!
//! Runs a sentence-transformers export (default layout: `model.onnx` +
//! `tokenizer.json` under `embedding.cache_dir`) through `ort`, then mean-pools
//! the token embeddings under the attention mask and L2-normalizes the result.
//! Inference is CPU-bound and runs on the blocking pool.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Maximum token sequence length fed to the model.
const MAX_SEQ_LEN: usize = 256;

struct LocalModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
}

// Safety: Tokenizer is Send+Sync and the Session is only reached through the Mutex.
unsafe impl Send for LocalModel {}
unsafe impl Sync for LocalModel {}

/// Local ONNX-based embedding provider.
pub struct LocalEmbeddingProvider {
    inner: Arc<LocalModel>,
    model: String,
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Run `memoria model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}. Run `memoria model download` first.",
            tokenizer_path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        Ok(Self {
            inner: Arc::new(LocalModel {
                session: Mutex::new(session),
                tokenizer,
                dimensions: config.dimensions,
            }),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || model.embed(&text)).await?
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}

impl LocalModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let inference = |e: &dyn std::fmt::Display| EmbeddingError::Inference(e.to_string());

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| inference(&e))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let seq_len = ids.len();
        let shape = vec![1i64, seq_len as i64];

        let input_ids = Tensor::from_array((shape.clone(), ids.into_boxed_slice()))
            .map_err(|e| inference(&e))?;
        let attention_mask = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))
            .map_err(|e| inference(&e))?;
        let token_type_ids = Tensor::from_array((shape, vec![0i64; seq_len].into_boxed_slice()))
            .map_err(|e| inference(&e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbeddingError::Inference("session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs! {
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            })
            .map_err(|e| inference(&e))?;

        // Output name varies by export; fall back to the first output.
        let token_embeddings = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = token_embeddings
            .try_extract_tensor::<f32>()
            .map_err(|e| inference(&e))?;

        let dims: &[i64] = &dims;
        if dims.len() != 3 || dims[2] as usize != self.dimensions {
            return Err(EmbeddingError::Response(format!(
                "unexpected token embedding shape {dims:?}, expected [1, seq, {}]",
                self.dimensions
            )));
        }
        let hidden = dims[2] as usize;
        let out_seq = dims[1] as usize;

        let mut pooled = vec![0.0f32; hidden];
        let mut count = 0.0f32;
        for s in 0..out_seq.min(seq_len) {
            if mask[s] > 0 {
                let offset = s * hidden;
                for (d, acc) in pooled.iter_mut().enumerate() {
                    *acc += data[offset + d];
                }
                count += 1.0;
            }
        }
        if count > 0.0 {
            pooled.iter_mut().for_each(|x| *x /= count);
        }
        Ok(l2_normalize(&pooled))
    }
}

/// L2-normalize a vector. Zero vectors are returned unchanged.
fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
