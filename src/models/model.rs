//! Model definitions and traits
//!
//! This module defines the embedding model trait the server talks to and the
//! ONNX-backed implementation of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::{Embedding, EmbeddingError, EmbeddingResult};

/// Compute device a loaded model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda => f.write_str("cuda"),
        }
    }
}

/// Requested device; `Auto` picks the accelerator when one is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

impl FromStr for DevicePreference {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            other => Err(EmbeddingError::ConfigError {
                message: format!("Unknown device '{}' (expected auto, cpu or cuda)", other),
            }),
        }
    }
}

/// Information about a loaded model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier as configured
    pub name: String,
    /// Embedding dimension, measured after load
    pub dimension: usize,
    /// Maximum token sequence length fed to the model
    pub max_sequence_length: usize,
    /// Device the inference session runs on
    pub device: Device,
}

/// Core embedding model trait
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Get model information
    fn info(&self) -> &ModelInfo;

    /// Encode texts in one model invocation. Output is L2-normalized and in
    /// input order.
    async fn embed_batch(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Embedding>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize {
        self.info().dimension
    }

    /// Get the compute device
    fn device(&self) -> Device {
        self.info().device
    }
}

/// ONNX-based embedding model implementation
#[cfg(feature = "onnx")]
pub mod onnx {
    use super::*;
    use std::sync::Arc;

    use crate::models::files::ModelFiles;
    use crate::onnx::{OnnxConfig, OnnxEmbeddingEngine};

    /// ONNX embedding model
    pub struct OnnxEmbeddingModel {
        info: ModelInfo,
        engine: Arc<OnnxEmbeddingEngine>,
    }

    impl OnnxEmbeddingModel {
        /// Build the session and measure the output dimension. Blocking.
        pub fn load(
            name: &str,
            files: &ModelFiles,
            onnx_config: &OnnxConfig,
        ) -> EmbeddingResult<Self> {
            let engine = OnnxEmbeddingEngine::new(&files.model_path, &files.tokenizer_path, onnx_config)?;
            let dimension = engine.detect_dimension()?;

            let info = ModelInfo {
                name: name.to_string(),
                dimension,
                max_sequence_length: onnx_config.max_sequence_length,
                device: engine.device(),
            };

            Ok(Self {
                info,
                engine: Arc::new(engine),
            })
        }
    }

    #[async_trait]
    impl EmbeddingModel for OnnxEmbeddingModel {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        async fn embed_batch(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Embedding>> {
            let engine = Arc::clone(&self.engine);
            tokio::task::spawn_blocking(move || engine.embed_texts(&texts))
                .await
                .map_err(|e| EmbeddingError::InferenceError {
                    model_name: self.info.name.clone(),
                    error: format!("Inference task failed: {}", e),
                })?
                .map_err(|e| EmbeddingError::InferenceError {
                    model_name: self.info.name.clone(),
                    error: e.to_string(),
                })
        }
    }
}

/// Deterministic in-process model used by the unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct HashingModel {
        info: ModelInfo,
        pub calls: AtomicUsize,
        pub fail_with: Option<String>,
    }

    impl HashingModel {
        pub fn new(dimension: usize) -> Self {
            Self {
                info: ModelInfo {
                    name: "test/hashing-model".to_string(),
                    dimension,
                    max_sequence_length: 128,
                    device: Device::Cpu,
                },
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::new(8)
            }
        }

        fn encode(&self, text: &str) -> Embedding {
            let mut v = vec![0.0f32; self.info.dimension];
            for (i, b) in text.bytes().enumerate() {
                let slot = (b as usize).wrapping_mul(31).wrapping_add(i) % v.len();
                v[slot] += 1.0 + (b % 7) as f32;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                v.iter_mut().for_each(|x| *x /= norm);
            } else {
                v[0] = 1.0;
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingModel for HashingModel {
        fn info(&self) -> &ModelInfo {
            &self.info
        }

        async fn embed_batch(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Embedding>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.fail_with {
                return Err(EmbeddingError::InferenceError {
                    model_name: self.info.name.clone(),
                    error: message.clone(),
                });
            }
            Ok(texts.iter().map(|t| self.encode(t)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!(" CPU ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_device_serialization() {
        assert_eq!(serde_json::to_string(&Device::Cuda).unwrap(), "\"cuda\"");
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert!(Device::Cuda.is_accelerator());
        assert!(!Device::Cpu.is_accelerator());
    }

    #[tokio::test]
    async fn test_hashing_model_is_normalized() {
        let model = testing::HashingModel::new(16);
        let out = model
            .embed_batch(vec!["hello world".to_string(), "another".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        for v in &out {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(model.dimension(), 16);
    }
}
