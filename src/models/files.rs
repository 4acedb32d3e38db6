//! Model file resolution
//!
//! A model identifier is either a local directory holding the exported ONNX
//! graph and `tokenizer.json`, or a HuggingFace Hub repository id. Hub files
//! are served from the cache directory when present and downloaded into it
//! otherwise.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use hf_hub::Cache;
use tracing::{debug, info};

use crate::models::{EmbeddingError, EmbeddingResult};

/// Candidate locations of the ONNX graph inside a model repository
const MODEL_FILE_CANDIDATES: [&str; 2] = ["onnx/model.onnx", "model.onnx"];
const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Resolved on-disk paths of a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
}

/// Where a model identifier points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Directory on the local filesystem
    LocalDir(PathBuf),
    /// HuggingFace Hub repository id
    Hub(String),
}

impl ModelSource {
    pub fn from_identifier(identifier: &str) -> Self {
        let path = Path::new(identifier);
        if path.is_dir() {
            ModelSource::LocalDir(path.to_path_buf())
        } else {
            ModelSource::Hub(identifier.to_string())
        }
    }

    /// Resolve the model files, downloading into `cache_dir` when needed.
    /// Blocking.
    pub fn resolve(&self, cache_dir: &Path) -> EmbeddingResult<ModelFiles> {
        match self {
            ModelSource::LocalDir(dir) => Self::resolve_local(dir),
            ModelSource::Hub(repo_id) => Self::resolve_hub(repo_id, cache_dir),
        }
    }

    fn resolve_local(dir: &Path) -> EmbeddingResult<ModelFiles> {
        let model_path = MODEL_FILE_CANDIDATES
            .iter()
            .map(|candidate| dir.join(candidate))
            .find(|path| path.is_file())
            .ok_or_else(|| EmbeddingError::ModelNotFound {
                model_name: dir.display().to_string(),
                error: format!("none of {:?} present", MODEL_FILE_CANDIDATES),
            })?;

        let tokenizer_path = dir.join(TOKENIZER_FILENAME);
        if !tokenizer_path.is_file() {
            return Err(EmbeddingError::ModelNotFound {
                model_name: dir.display().to_string(),
                error: format!("{} not present", TOKENIZER_FILENAME),
            });
        }

        debug!("Using local model files from {}", dir.display());
        Ok(ModelFiles { model_path, tokenizer_path })
    }

    fn resolve_hub(repo_id: &str, cache_dir: &Path) -> EmbeddingResult<ModelFiles> {
        // Cached copies first so an offline restart still works
        let cache = Cache::new(cache_dir.to_path_buf()).model(repo_id.to_string());
        let cached_model = MODEL_FILE_CANDIDATES.iter().find_map(|candidate| cache.get(candidate));
        if let (Some(model_path), Some(tokenizer_path)) = (cached_model, cache.get(TOKENIZER_FILENAME)) {
            info!("📦 Using cached model files for {}", repo_id);
            return Ok(ModelFiles { model_path, tokenizer_path });
        }

        info!("⬇️  Fetching {} from the HuggingFace Hub into {}", repo_id, cache_dir.display());
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false)
            .build()?;
        let repo = api.model(repo_id.to_string());

        let mut last_error = None;
        let mut model_path = None;
        for candidate in MODEL_FILE_CANDIDATES {
            match repo.get(candidate) {
                Ok(path) => {
                    model_path = Some(path);
                    break;
                }
                Err(e) => {
                    debug!("{} not available in {}: {}", candidate, repo_id, e);
                    last_error = Some(e.to_string());
                }
            }
        }
        let model_path = model_path.ok_or_else(|| EmbeddingError::ModelNotFound {
            model_name: repo_id.to_string(),
            error: last_error.unwrap_or_else(|| "no ONNX export found".to_string()),
        })?;

        let tokenizer_path = repo.get(TOKENIZER_FILENAME).map_err(|e| EmbeddingError::ModelNotFound {
            model_name: repo_id.to_string(),
            error: format!("{}: {}", TOKENIZER_FILENAME, e),
        })?;

        Ok(ModelFiles { model_path, tokenizer_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("embedding-service-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_identifier_classification() {
        let dir = scratch_dir("classify");
        assert_eq!(
            ModelSource::from_identifier(dir.to_str().unwrap()),
            ModelSource::LocalDir(dir.clone())
        );
        assert_eq!(
            ModelSource::from_identifier("sentence-transformers/all-MiniLM-L6-v2"),
            ModelSource::Hub("sentence-transformers/all-MiniLM-L6-v2".to_string())
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_local_dir_prefers_onnx_subdir() {
        let dir = scratch_dir("local");
        fs::create_dir_all(dir.join("onnx")).unwrap();
        fs::write(dir.join("onnx/model.onnx"), b"graph").unwrap();
        fs::write(dir.join("model.onnx"), b"graph").unwrap();
        fs::write(dir.join("tokenizer.json"), b"{}").unwrap();

        let files = ModelSource::LocalDir(dir.clone()).resolve(&dir).unwrap();
        assert_eq!(files.model_path, dir.join("onnx/model.onnx"));
        assert_eq!(files.tokenizer_path, dir.join("tokenizer.json"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_local_dir_missing_tokenizer() {
        let dir = scratch_dir("missing");
        fs::write(dir.join("model.onnx"), b"graph").unwrap();

        let err = ModelSource::LocalDir(dir.clone()).resolve(&dir).unwrap_err();
        assert!(matches!(err, EmbeddingError::ModelNotFound { .. }));
        assert!(err.to_string().contains("tokenizer.json"));
        fs::remove_dir_all(dir).unwrap();
    }
}
