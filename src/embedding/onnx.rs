//! Local ONNX Runtime embedding provider (all-MiniLM-L6-v2)
//!
//! Handles tokenization, inference, mean pooling, and L2 normalization.
//! Missing model files leave the provider constructed but not ready, so
//! the engine still starts and fills embeddings in lazily once the files
//! appear and the process restarts.

use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::embedding::EmbeddingProvider;
use crate::error::{MnemoError, Result};

/// all-MiniLM-L6-v2 output width
const MODEL_DIM: usize = 384;

/// Maximum sequence length the model was trained at
const MAX_SEQ_LEN: usize = 256;

struct LoadedModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

/// Local ONNX-based embedding provider
pub struct OnnxEmbedder {
    model: Option<LoadedModel>,
}

impl OnnxEmbedder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    ///
    /// Missing files are not an error: the provider reports not-ready and
    /// the engine degrades per the late-embedding policy.
    pub fn new(model_dir: &Path) -> Result<Self> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            tracing::warn!(
                dir = %model_dir.display(),
                "embedding model files not found; provider starts not-ready"
            );
            return Ok(Self { model: None });
        }

        let session = Session::builder()
            .map_err(|e| MnemoError::Embedding(format!("onnx session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| MnemoError::Embedding(format!("onnx optimization level: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| MnemoError::Embedding(format!("onnx thread config: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| MnemoError::Embedding(format!("failed to load ONNX model: {e}")))?;

        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| MnemoError::Embedding(format!("failed to load tokenizer: {e}")))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| MnemoError::Embedding(format!("failed to set truncation: {e}")))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            model: Some(LoadedModel {
                session: Mutex::new(session),
                tokenizer,
            }),
        })
    }
}

impl EmbeddingProvider for OnnxEmbedder {
    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    fn dimension(&self) -> usize {
        MODEL_DIM
    }

    fn ready(&self) -> bool {
        self.model.is_some()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed_batch(&[text])?;
        results
            .pop()
            .ok_or_else(|| MnemoError::Embedding("batch had one input".into()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| MnemoError::Embedding("model files not available".into()))?;

        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = model
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| MnemoError::Embedding(format!("tokenization failed: {e}")))?;

        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        let mut input_ids_flat = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask_flat = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            for &id in encoding.get_ids() {
                input_ids_flat.push(id as i64);
            }
            for &mask in encoding.get_attention_mask() {
                attention_mask_flat.push(mask as i64);
            }
        }

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids_tensor =
            Tensor::from_array((shape.clone(), input_ids_flat.into_boxed_slice()))
                .map_err(|e| MnemoError::Embedding(format!("input tensor: {e}")))?;
        let attention_mask_tensor = Tensor::from_array((
            shape.clone(),
            attention_mask_flat.clone().into_boxed_slice(),
        ))
        .map_err(|e| MnemoError::Embedding(format!("mask tensor: {e}")))?;
        // Single sentence, no segment B
        let token_type_ids = vec![0i64; batch_size * seq_len];
        let token_type_ids_tensor =
            Tensor::from_array((shape, token_type_ids.into_boxed_slice()))
                .map_err(|e| MnemoError::Embedding(format!("type tensor: {e}")))?;

        let mut session = model
            .session
            .lock()
            .map_err(|e| MnemoError::Embedding(format!("session lock poisoned: {e}")))?;

        let outputs = session
            .run(ort::inputs! {
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor,
            })
            .map_err(|e| MnemoError::Embedding(format!("inference failed: {e}")))?;

        // Output name varies by export; try common names, fall back to index 0
        let token_emb_value = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);

        let (out_shape, data) = token_emb_value
            .try_extract_tensor::<f32>()
            .map_err(|e| MnemoError::Embedding(format!("output tensor: {e}")))?;

        let dims: &[i64] = &out_shape;
        if dims.len() != 3 || dims[2] != MODEL_DIM as i64 {
            return Err(MnemoError::Embedding(format!(
                "unexpected output shape {dims:?}, expected [batch, seq, {MODEL_DIM}]"
            )));
        }
        let hidden_dim = dims[2] as usize;
        let actual_seq_len = dims[1] as usize;

        // Mean pooling over the attention mask, then L2 normalize
        let mut results = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;

            for s in 0..actual_seq_len {
                let mask = attention_mask_flat[b * seq_len + s] as f32;
                if mask > 0.0 {
                    let offset = (b * actual_seq_len + s) * hidden_dim;
                    for d in 0..hidden_dim {
                        sum[d] += data[offset + d] * mask;
                    }
                    count += mask;
                }
            }

            if count > 0.0 {
                for value in &mut sum {
                    *value /= count;
                }
            }

            results.push(l2_normalize(&sum));
        }

        Ok(results)
    }
}

/// L2-normalize a vector. Zero input stays zero.
fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_mean_not_ready() {
        let embedder = OnnxEmbedder::new(Path::new("/nonexistent/model/dir")).unwrap();
        assert!(!embedder.ready());
        assert_eq!(embedder.dimension(), 384);
        let err = embedder.embed("hello").unwrap_err();
        assert!(err.to_string().contains("model files"));
    }

    #[test]
    fn normalize_helper() {
        let v = vec![3.0, 4.0];
        let n = l2_normalize(&v);
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
