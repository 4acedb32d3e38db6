//! Embedding model layer
//!
//! Model trait, lifecycle manager, preprocessing and model file resolution.

pub mod files;
pub mod manager;
pub mod model;
pub mod preprocess;

// Re-exports
pub use files::{ModelFiles, ModelSource};
pub use manager::{EmbeddingModelsManager, LoadedModel, ModelSettings, ModelStatus};
pub use model::{Device, DevicePreference, EmbeddingModel, ModelInfo};
pub use preprocess::{preprocess_text, PreparedText, EMPTY_TEXT_PLACEHOLDER};

/// Embedding vector type
pub type Embedding = Vec<f32>;

/// Result type for embedding models operations
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Errors that can occur in embedding models operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Model not loaded: {model_name}")]
    NotLoaded { model_name: String },

    #[error("Model files not found for {model_name}: {error}")]
    ModelNotFound { model_name: String, error: String },

    #[error("Model load failed: {error}")]
    ModelLoadFailed { error: String },

    #[error("Inference failed: {model_name} - {error}")]
    InferenceError { model_name: String, error: String },

    #[error("Embedding failed: {error}")]
    EmbeddingFailed { error: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("IO error: {error}")]
    IoError { error: std::io::Error },

    #[error("TOML parsing error: {error}")]
    TomlError { error: toml::de::Error },
}

impl From<std::io::Error> for EmbeddingError {
    fn from(error: std::io::Error) -> Self {
        EmbeddingError::IoError { error }
    }
}

impl From<toml::de::Error> for EmbeddingError {
    fn from(error: toml::de::Error) -> Self {
        EmbeddingError::TomlError { error }
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for EmbeddingError {
    fn from(error: ort::Error) -> Self {
        EmbeddingError::ModelLoadFailed { error: error.to_string() }
    }
}

impl From<hf_hub::api::sync::ApiError> for EmbeddingError {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        EmbeddingError::ModelLoadFailed { error: error.to_string() }
    }
}
