//! Embedding Models Manager
//!
//! Owns the single model slot of the process. The slot is filled once by
//! [`EmbeddingModelsManager::load`] and read by every request afterwards;
//! until then the manager reports [`ModelStatus::Loading`] and refuses to
//! encode.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::model::{Device, DevicePreference, EmbeddingModel, ModelInfo};
use crate::models::preprocess::preprocess_text;
use crate::models::{Embedding, EmbeddingError, EmbeddingResult};

/// Settings the manager needs to load and feed the model
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// HuggingFace repository id or local directory
    pub model_name: String,
    /// Download/cache directory for hub models
    pub cache_dir: PathBuf,
    pub device: DevicePreference,
    pub intra_threads: usize,
    /// Token budget per sequence
    pub max_sequence_length: usize,
    /// Character budget per input text
    pub max_length: usize,
}

/// Lifecycle state reported by `/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Loading,
    Ready,
}

/// The model once it is ready to serve
pub struct LoadedModel {
    model: Arc<dyn EmbeddingModel>,
    loaded_at: Instant,
}

impl LoadedModel {
    pub fn info(&self) -> &ModelInfo {
        self.model.info()
    }

    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    pub fn device(&self) -> Device {
        self.model.device()
    }

    /// Time since the model became ready
    pub fn uptime(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

/// Main manager for the embedding model
pub struct EmbeddingModelsManager {
    settings: ModelSettings,
    loaded: OnceLock<LoadedModel>,
    load_attempted: AtomicBool,
}

impl EmbeddingModelsManager {
    /// Create a manager in the Loading state
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings,
            loaded: OnceLock::new(),
            load_attempted: AtomicBool::new(false),
        }
    }

    /// Create a manager that is Ready with an already constructed model
    pub fn with_model(settings: ModelSettings, model: Arc<dyn EmbeddingModel>) -> Self {
        let manager = Self::new(settings);
        manager.load_attempted.store(true, Ordering::SeqCst);
        let _ = manager.loaded.set(LoadedModel {
            model,
            loaded_at: Instant::now(),
        });
        manager
    }

    /// Get the settings
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Configured model identifier
    pub fn model_name(&self) -> &str {
        &self.settings.model_name
    }

    pub fn status(&self) -> ModelStatus {
        if self.loaded.get().is_some() {
            ModelStatus::Ready
        } else {
            ModelStatus::Loading
        }
    }

    /// The loaded model, or `NotLoaded`
    pub fn ready(&self) -> EmbeddingResult<&LoadedModel> {
        self.loaded.get().ok_or_else(|| EmbeddingError::NotLoaded {
            model_name: self.settings.model_name.clone(),
        })
    }

    /// Load the configured model. Only one attempt is ever made; a second
    /// call fails without touching the slot.
    pub async fn load(&self) -> EmbeddingResult<()> {
        if self.load_attempted.swap(true, Ordering::SeqCst) {
            return Err(EmbeddingError::ModelLoadFailed {
                error: "Model load was already attempted".to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.settings.cache_dir).await?;

        info!("🔄 Loading embedding model {}", self.settings.model_name);
        let started = Instant::now();
        let settings = self.settings.clone();
        let model = tokio::task::spawn_blocking(move || load_model(&settings))
            .await
            .map_err(|e| EmbeddingError::ModelLoadFailed {
                error: format!("Model load task failed: {}", e),
            })??;

        info!(
            "✅ Model {} ready on {} ({} dimensions) in {:?}",
            model.info().name,
            model.device(),
            model.dimension(),
            started.elapsed()
        );

        self.loaded
            .set(LoadedModel {
                model,
                loaded_at: Instant::now(),
            })
            .map_err(|_| EmbeddingError::ModelLoadFailed {
                error: "Model slot already filled".to_string(),
            })
    }

    fn prepare(&self, texts: &[String]) -> Vec<String> {
        texts
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let prepared = preprocess_text(raw, self.settings.max_length);
                if prepared.truncated {
                    warn!(
                        "Input {} truncated from {} to {} characters",
                        index,
                        raw.trim().chars().count(),
                        self.settings.max_length
                    );
                }
                prepared.text
            })
            .collect()
    }

    /// Embed one text
    pub async fn embed_text(&self, text: &str) -> EmbeddingResult<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed {
                error: "No embedding returned".to_string(),
            })
    }

    /// Embed a batch of texts in one model call, preserving order
    pub async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Embedding>> {
        let loaded = self.ready()?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = self.prepare(texts);
        let started = Instant::now();
        let embeddings = loaded.model.embed_batch(prepared).await?;
        debug!("Encoded {} texts in {:?}", texts.len(), started.elapsed());

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::InferenceError {
                model_name: self.settings.model_name.clone(),
                error: format!("Expected {} embeddings, got {}", texts.len(), embeddings.len()),
            });
        }
        Ok(embeddings)
    }

    /// Pairwise cosine similarity of at least two texts
    pub async fn similarity(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        self.ready()?;
        if texts.len() < 2 {
            return Err(EmbeddingError::InvalidInput {
                message: "At least 2 texts required for similarity".to_string(),
            });
        }
        let embeddings = self.embed_batch(texts).await?;
        Ok(similarity_matrix(&embeddings))
    }
}

/// Square matrix of dot products. Inputs are unit vectors, so this is the
/// cosine similarity.
pub fn similarity_matrix(embeddings: &[Embedding]) -> Vec<Vec<f32>> {
    embeddings
        .iter()
        .map(|a| {
            embeddings
                .iter()
                .map(|b| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>())
                .collect()
        })
        .collect()
}

#[cfg(feature = "onnx")]
fn load_model(settings: &ModelSettings) -> EmbeddingResult<Arc<dyn EmbeddingModel>> {
    use crate::models::files::ModelSource;
    use crate::models::model::onnx::OnnxEmbeddingModel;
    use crate::onnx::OnnxConfig;

    let files = ModelSource::from_identifier(&settings.model_name).resolve(&settings.cache_dir)?;
    debug!("Model files: {:?}", files);

    let onnx_config = OnnxConfig {
        device: settings.device,
        thread_pool_size: settings.intra_threads,
        max_sequence_length: settings.max_sequence_length,
    };
    let model = OnnxEmbeddingModel::load(&settings.model_name, &files, &onnx_config)?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "onnx"))]
fn load_model(_settings: &ModelSettings) -> EmbeddingResult<Arc<dyn EmbeddingModel>> {
    Err(EmbeddingError::ModelLoadFailed {
        error: "built without the `onnx` feature, no inference backend available".to_string(),
    })
}
