//! # ONNX Embedding Engine
//!
//! Sentence embeddings through ONNX Runtime and a HuggingFace tokenizer.
//!
//! ## Features
//!
//! - CUDA execution provider when built with `cuda` and usable, CPU otherwise
//! - Whole batches encoded in one padded inference call
//! - Uses the graph's pooled `sentence_embedding` output when it has one,
//!   mean pooling over `last_hidden_state` otherwise
//! - L2-normalized output
//! - Output dimension measured on the model, not hard-coded
//!
//! ## Usage
//!
//! ```ignore
//! let engine = OnnxEmbeddingEngine::new("model.onnx", "tokenizer.json", &OnnxConfig::default())?;
//! let embeddings = engine.embed_texts(&["Hello world".to_string()])?;
//! ```

use std::path::Path;
use std::sync::Mutex;

use ndarray::{ArrayView2, ArrayView3, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer, TruncationParams};
use tracing::{debug, info, instrument, warn};

use crate::models::{Device, DevicePreference, Embedding, EmbeddingError, EmbeddingResult};

/// Sentinel input used to discover the output dimension after load
const DIMENSION_SAMPLE_TEXT: &str = "test";

/// Graph output that already holds pooled sentence vectors
const POOLED_OUTPUT: &str = "sentence_embedding";
/// Token-level output that needs mean pooling
const TOKEN_OUTPUT: &str = "last_hidden_state";

/// Configuration for ONNX Runtime
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    /// Requested compute device
    pub device: DevicePreference,
    /// Thread pool size for inference on CPU
    pub thread_pool_size: usize,
    /// Token sequences are truncated to this length
    pub max_sequence_length: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            thread_pool_size: 4,
            max_sequence_length: 512,
        }
    }
}

/// How the sentence vector is read from the graph outputs
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pooling {
    /// Graph already pools; take the named `[batch, hidden]` output
    Pooled(String),
    /// Mean over the named `[batch, seq, hidden]` output, masked
    Mean(String),
}

/// ONNX-based embedding engine for generating text embeddings
pub struct OnnxEmbeddingEngine {
    /// `Session::run` needs exclusive access
    session: Mutex<Session>,
    /// HuggingFace tokenizer for text preprocessing
    tokenizer: Tokenizer,
    /// Device the session was committed on
    device: Device,
    /// Whether the graph declares a `token_type_ids` input
    uses_token_type_ids: bool,
    pooling: Pooling,
}

impl std::fmt::Debug for OnnxEmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingEngine")
            .field("device", &self.device)
            .field("uses_token_type_ids", &self.uses_token_type_ids)
            .field("pooling", &self.pooling)
            .finish_non_exhaustive()
    }
}

impl OnnxEmbeddingEngine {
    /// Create a new ONNX embedding engine
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file (model.onnx)
    /// * `tokenizer_path` - Path to the tokenizer configuration file (tokenizer.json)
    /// * `onnx_config` - Device, threading and truncation settings
    pub fn new(
        model_path: &Path,
        tokenizer_path: &Path,
        onnx_config: &OnnxConfig,
    ) -> EmbeddingResult<Self> {
        info!("Initializing ONNX embedding engine with model: {}", model_path.display());

        let (session, device) = Self::build_session(model_path, onnx_config)?;

        let input_names: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
        for required in ["input_ids", "attention_mask"] {
            if !input_names.contains(&required) {
                return Err(EmbeddingError::ModelLoadFailed {
                    error: format!("Model has no '{}' input (inputs: {:?})", required, input_names),
                });
            }
        }
        let uses_token_type_ids = input_names.contains(&"token_type_ids");

        let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        let pooling = if output_names.contains(&POOLED_OUTPUT) {
            Pooling::Pooled(POOLED_OUTPUT.to_string())
        } else if output_names.contains(&TOKEN_OUTPUT) {
            Pooling::Mean(TOKEN_OUTPUT.to_string())
        } else {
            let first = output_names.first().ok_or_else(|| EmbeddingError::ModelLoadFailed {
                error: "Model declares no outputs".to_string(),
            })?;
            warn!("No known embedding output, mean pooling over '{}'", first);
            Pooling::Mean(first.to_string())
        };
        debug!("Inputs: {:?}, outputs: {:?}, pooling: {:?}", input_names, output_names, pooling);

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EmbeddingError::ModelLoadFailed {
                error: format!("Failed to load tokenizer: {}", e),
            })?;
        configure_tokenizer(&mut tokenizer, onnx_config.max_sequence_length)?;

        info!("ONNX embedding engine initialized on {}", device);
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            device,
            uses_token_type_ids,
            pooling,
        })
    }

    fn build_session(model_path: &Path, onnx_config: &OnnxConfig) -> EmbeddingResult<(Session, Device)> {
        match onnx_config.device {
            DevicePreference::Cpu => Ok((Self::cpu_session(model_path, onnx_config)?, Device::Cpu)),
            DevicePreference::Cuda => Ok((Self::cuda_session(model_path)?, Device::Cuda)),
            DevicePreference::Auto => {
                if Self::cuda_available() {
                    match Self::cuda_session(model_path) {
                        Ok(session) => {
                            info!("✅ CUDA execution provider initialized");
                            return Ok((session, Device::Cuda));
                        }
                        Err(e) => {
                            warn!("⚠️  CUDA execution provider failed: {}", e);
                            warn!("   Falling back to CPU execution provider");
                        }
                    }
                }
                Ok((Self::cpu_session(model_path, onnx_config)?, Device::Cpu))
            }
        }
    }

    fn cpu_session(model_path: &Path, onnx_config: &OnnxConfig) -> EmbeddingResult<Session> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(onnx_config.thread_pool_size)?
            .commit_from_file(model_path)
            .map_err(|e| EmbeddingError::ModelLoadFailed {
                error: format!("Failed to load ONNX model: {}", e),
            })
    }

    #[cfg(feature = "cuda")]
    fn cuda_available() -> bool {
        use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
        CUDAExecutionProvider::default().is_available().unwrap_or(false)
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda_available() -> bool {
        false
    }

    #[cfg(feature = "cuda")]
    fn cuda_session(model_path: &Path) -> EmbeddingResult<Session> {
        use ort::execution_providers::CUDAExecutionProvider;
        Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)? // CUDA doesn't benefit from multiple threads
            .commit_from_file(model_path)
            .map_err(|e| EmbeddingError::ModelLoadFailed {
                error: format!("Failed to load ONNX model on CUDA: {}", e),
            })
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda_session(_model_path: &Path) -> EmbeddingResult<Session> {
        Err(EmbeddingError::ModelLoadFailed {
            error: "CUDA requested but the binary was built without the `cuda` feature".to_string(),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Encode the sentinel input and report the vector length
    pub fn detect_dimension(&self) -> EmbeddingResult<usize> {
        let sample = self.embed_texts(&[DIMENSION_SAMPLE_TEXT.to_string()])?;
        match sample.first() {
            Some(v) if !v.is_empty() => Ok(v.len()),
            _ => Err(EmbeddingError::ModelLoadFailed {
                error: "Dimension check returned no embedding".to_string(),
            }),
        }
    }

    /// Generate embeddings for a batch of texts in one inference call
    ///
    /// Returns one L2-normalized vector per input, in input order. An empty
    /// input yields an empty output without touching the session.
    #[instrument(skip(self, texts), fields(text_count = texts.len()))]
    pub fn embed_texts(&self, texts: &[String]) -> EmbeddingResult<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbeddingError::EmbeddingFailed {
                error: format!("Tokenization failed: {}", e),
            })?;

        let padded = PaddedBatch::from_encodings(&encodings)?;
        let batch = padded.batch;
        let shape = padded.shape();
        let mask_for_pooling = padded.attention_mask.clone();

        let inputs = padded
            .into_inputs(self.uses_token_type_ids)
            .into_iter()
            .map(|(name, data)| {
                Tensor::from_array((shape, data))
                    .map(|tensor| (name, tensor))
                    .map_err(|e| EmbeddingError::EmbeddingFailed {
                        error: format!("Failed to create {} tensor: {}", name, e),
                    })
            })
            .collect::<EmbeddingResult<Vec<_>>>()?;

        let mut session = self.session.lock().map_err(|_| EmbeddingError::EmbeddingFailed {
            error: "ONNX session lock poisoned".to_string(),
        })?;
        let outputs = session.run(inputs).map_err(|e| EmbeddingError::EmbeddingFailed {
            error: format!("ONNX inference failed: {}", e),
        })?;

        let output_name = match &self.pooling {
            Pooling::Pooled(name) | Pooling::Mean(name) => name.as_str(),
        };
        let (out_shape, data) = outputs[output_name]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::EmbeddingFailed {
                error: format!("Failed to extract output tensor: {}", e),
            })?;
        let dims: Vec<usize> = out_shape.iter().map(|&x| x as usize).collect();

        let pooled = match &self.pooling {
            Pooling::Pooled(_) => pooled_rows(&dims, data)?,
            Pooling::Mean(_) => mean_pooled_rows(&dims, data, &mask_for_pooling)?,
        };

        debug!("Generated {} embeddings", pooled.len());
        normalize_batch(pooled, batch)
    }
}

/// Batches are padded by [`PaddedBatch`], not by whatever the tokenizer file
/// configures. Sequences are cut at `max_sequence_length` tokens.
fn configure_tokenizer(tokenizer: &mut Tokenizer, max_sequence_length: usize) -> EmbeddingResult<()> {
    tokenizer.with_padding(None);
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_sequence_length,
            ..Default::default()
        }))
        .map_err(|e| EmbeddingError::ModelLoadFailed {
            error: format!("Failed to configure truncation: {}", e),
        })?;
    Ok(())
}

/// Token ids, attention mask and type ids of a batch, right-padded with
/// zeros to the longest sequence. All three are row-major `[batch, max_len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PaddedBatch {
    batch: usize,
    max_len: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
}

impl PaddedBatch {
    fn from_encodings(encodings: &[Encoding]) -> EmbeddingResult<Self> {
        let batch = encodings.len();
        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
        if max_len == 0 {
            return Err(EmbeddingError::EmbeddingFailed {
                error: "Tokenizer produced no tokens".to_string(),
            });
        }

        let mut input_ids = Vec::with_capacity(batch * max_len);
        let mut attention_mask = Vec::with_capacity(batch * max_len);
        let mut token_type_ids = Vec::with_capacity(batch * max_len);
        for encoding in encodings {
            let padding = max_len - encoding.get_ids().len();
            pad_into(&mut input_ids, encoding.get_ids(), padding);
            pad_into(&mut attention_mask, encoding.get_attention_mask(), padding);
            pad_into(&mut token_type_ids, encoding.get_type_ids(), padding);
        }

        Ok(Self {
            batch,
            max_len,
            input_ids,
            attention_mask,
            token_type_ids,
        })
    }

    fn shape(&self) -> [i64; 2] {
        [self.batch as i64, self.max_len as i64]
    }

    /// Named graph inputs; `token_type_ids` only when the graph declares it
    fn into_inputs(self, with_token_type_ids: bool) -> Vec<(&'static str, Vec<i64>)> {
        let mut inputs = vec![
            ("input_ids", self.input_ids),
            ("attention_mask", self.attention_mask),
        ];
        if with_token_type_ids {
            inputs.push(("token_type_ids", self.token_type_ids));
        }
        inputs
    }
}

fn pad_into(target: &mut Vec<i64>, values: &[u32], padding: usize) {
    target.extend(values.iter().map(|&v| v as i64));
    target.extend(std::iter::repeat(0i64).take(padding));
}

/// Rows of an already pooled `[batch, hidden]` output
fn pooled_rows(dims: &[usize], data: &[f32]) -> EmbeddingResult<Vec<Embedding>> {
    let view = match dims {
        [b, h] => ArrayView2::from_shape((*b, *h), data),
        _ => {
            return Err(EmbeddingError::EmbeddingFailed {
                error: format!("Expected 2D pooled output, got shape {:?}", dims),
            })
        }
    }
    .map_err(|e| EmbeddingError::EmbeddingFailed {
        error: format!("Failed to create output array view: {:?}", e),
    })?;
    Ok(view.outer_iter().map(|row| row.to_vec()).collect())
}

fn mean_pooled_rows(dims: &[usize], data: &[f32], attention_mask: &[i64]) -> EmbeddingResult<Vec<Embedding>> {
    let view = match dims {
        [b, s, h] => ArrayView3::from_shape((*b, *s, *h), data),
        _ => {
            return Err(EmbeddingError::EmbeddingFailed {
                error: format!("Expected 3D output tensor, got shape {:?}", dims),
            })
        }
    }
    .map_err(|e| EmbeddingError::EmbeddingFailed {
        error: format!("Failed to create output array view: {:?}", e),
    })?;
    mean_pooling(&view, attention_mask)
}

/// Check one vector per input, then L2-normalize each
fn normalize_batch(pooled: Vec<Embedding>, expected: usize) -> EmbeddingResult<Vec<Embedding>> {
    if pooled.len() != expected {
        return Err(EmbeddingError::EmbeddingFailed {
            error: format!("Model returned {} vectors for {} inputs", pooled.len(), expected),
        });
    }
    pooled.iter().map(|v| normalize_embedding(v)).collect()
}

/// Mask-weighted mean over the sequence axis of a `[batch, seq, hidden]`
/// tensor. `attention_mask` is row-major `[batch, seq]`.
fn mean_pooling(hidden: &ArrayView3<f32>, attention_mask: &[i64]) -> EmbeddingResult<Vec<Embedding>> {
    let (batch, seq_len, hidden_size) = hidden.dim();
    if attention_mask.len() != batch * seq_len {
        return Err(EmbeddingError::EmbeddingFailed {
            error: format!(
                "Attention mask length {} doesn't match output shape [{}, {}]",
                attention_mask.len(),
                batch,
                seq_len
            ),
        });
    }

    let mut pooled = Vec::with_capacity(batch);
    for (row, tokens) in hidden.axis_iter(Axis(0)).enumerate() {
        let mask = &attention_mask[row * seq_len..(row + 1) * seq_len];
        let mut sum = vec![0.0f32; hidden_size];
        let mut valid_tokens = 0usize;
        for (token, &m) in tokens.axis_iter(Axis(0)).zip(mask) {
            if m == 1 {
                sum.iter_mut().zip(token.iter()).for_each(|(s, v)| *s += v);
                valid_tokens += 1;
            }
        }
        if valid_tokens == 0 {
            return Err(EmbeddingError::EmbeddingFailed {
                error: "No valid tokens found in attention mask".to_string(),
            });
        }
        sum.iter_mut().for_each(|s| *s /= valid_tokens as f32);
        pooled.push(sum);
    }
    Ok(pooled)
}

/// Normalize embedding using L2 normalization
fn normalize_embedding(embedding: &[f32]) -> EmbeddingResult<Embedding> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbeddingError::EmbeddingFailed {
            error: "Cannot normalize zero or non-finite vector".to_string(),
        });
    }

    Ok(embedding.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Whitespace-split word-level tokenizer, no special tokens
    fn word_tokenizer(max_sequence_length: usize) -> Tokenizer {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"[UNK]": 0, "hello": 1, "world": 2, "again": 3},
                "unk_token": "[UNK]"
            }
        }"#;
        let mut tokenizer: Tokenizer = json.parse().unwrap();
        configure_tokenizer(&mut tokenizer, max_sequence_length).unwrap();
        tokenizer
    }

    fn encode(tokenizer: &Tokenizer, texts: &[&str]) -> Vec<Encoding> {
        let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        tokenizer.encode_batch(texts, true).unwrap()
    }

    #[test]
    fn test_padded_batch_right_pads_to_longest() {
        let tokenizer = word_tokenizer(16);
        let encodings = encode(&tokenizer, &["hello", "hello world again", "world unknown"]);
        let padded = PaddedBatch::from_encodings(&encodings).unwrap();

        assert_eq!(padded.batch, 3);
        assert_eq!(padded.max_len, 3);
        assert_eq!(padded.shape(), [3, 3]);
        assert_eq!(padded.input_ids, vec![1, 0, 0, 1, 2, 3, 2, 0, 0]);
        assert_eq!(padded.attention_mask, vec![1, 0, 0, 1, 1, 1, 1, 1, 0]);
        assert_eq!(padded.token_type_ids, vec![0; 9]);
    }

    #[test]
    fn test_padded_batch_respects_truncation() {
        let tokenizer = word_tokenizer(2);
        let encodings = encode(&tokenizer, &["hello world again hello", "again"]);
        let padded = PaddedBatch::from_encodings(&encodings).unwrap();

        assert_eq!(padded.max_len, 2);
        assert_eq!(padded.input_ids, vec![1, 2, 3, 0]);
        assert_eq!(padded.attention_mask, vec![1, 1, 1, 0]);
    }

    #[test]
    fn test_padded_batch_rejects_tokenless_batch() {
        let tokenizer = word_tokenizer(8);
        let encodings = encode(&tokenizer, &["", "   "]);
        assert!(PaddedBatch::from_encodings(&encodings).is_err());
    }

    #[test]
    fn test_token_type_ids_fed_only_when_declared() {
        let tokenizer = word_tokenizer(8);
        let encodings = encode(&tokenizer, &["hello world"]);
        let padded = PaddedBatch::from_encodings(&encodings).unwrap();

        let names = |inputs: Vec<(&'static str, Vec<i64>)>| -> Vec<&'static str> {
            inputs.into_iter().map(|(name, _)| name).collect()
        };
        assert_eq!(
            names(padded.clone().into_inputs(false)),
            vec!["input_ids", "attention_mask"]
        );
        assert_eq!(
            names(padded.into_inputs(true)),
            vec!["input_ids", "attention_mask", "token_type_ids"]
        );
    }

    #[test]
    fn test_pooled_rows_from_2d_output() {
        let rows = pooled_rows(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);

        assert!(pooled_rows(&[2, 3, 1], &[0.0; 6]).is_err());
        assert!(pooled_rows(&[2, 4], &[0.0; 6]).is_err());
    }

    #[test]
    fn test_mean_pooled_rows_uses_padded_mask() {
        let tokenizer = word_tokenizer(8);
        let encodings = encode(&tokenizer, &["hello world", "again"]);
        let padded = PaddedBatch::from_encodings(&encodings).unwrap();

        // [batch 2, seq 2, hidden 2]; the padded slot holds junk
        let data = [1.0, 1.0, 3.0, 3.0, 5.0, 7.0, 100.0, 100.0];
        let rows = mean_pooled_rows(&[2, 2, 2], &data, &padded.attention_mask).unwrap();
        assert_eq!(rows, vec![vec![2.0, 2.0], vec![5.0, 7.0]]);

        assert!(mean_pooled_rows(&[2, 4], &data, &padded.attention_mask).is_err());
    }

    #[test]
    fn test_normalize_batch_checks_count() {
        let rows = vec![vec![3.0, 4.0], vec![0.0, 2.0]];
        let normalized = normalize_batch(rows.clone(), 2).unwrap();
        assert_eq!(normalized.len(), 2);
        for v in &normalized {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
        assert_eq!(normalized[1], vec![0.0, 1.0]);

        let err = normalize_batch(rows, 3).unwrap_err();
        assert!(err.to_string().contains("2 vectors for 3 inputs"));
    }

    #[test]
    fn test_mean_pooling_ignores_padding() {
        // batch 2, seq 3, hidden 2; second row has one padding token
        let hidden = Array3::from_shape_vec(
            (2, 3, 2),
            vec![
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0, //
                2.0, 2.0, 4.0, 4.0, 100.0, 100.0,
            ],
        )
        .unwrap();
        let mask = vec![1, 1, 1, 1, 1, 0];

        let pooled = mean_pooling(&hidden.view(), &mask).unwrap();
        assert_eq!(pooled, vec![vec![3.0, 4.0], vec![3.0, 3.0]]);
    }

    #[test]
    fn test_mean_pooling_rejects_mask_mismatch() {
        let hidden = Array3::<f32>::zeros((1, 3, 2));
        assert!(mean_pooling(&hidden.view(), &[1, 1]).is_err());
    }

    #[test]
    fn test_mean_pooling_rejects_fully_masked_row() {
        let hidden = Array3::<f32>::ones((1, 2, 2));
        assert!(mean_pooling(&hidden.view(), &[0, 0]).is_err());
    }

    #[test]
    fn test_normalize_embedding() {
        let v = normalize_embedding(&[3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        assert!(normalize_embedding(&[0.0, 0.0]).is_err());
    }
}
