//! HTTP REST API Protocol
//!
//! JSON bodies of every endpoint:
//! - `POST /embed`                 `{"texts": [...]}` -> `{"embeddings": [[...]]}`
//! - `POST /v1/embeddings`         `{"text": "...", "model"?: "..."}`
//! - `POST /v1/embeddings/batch`   `{"texts": [...], "model"?: "..."}`
//! - `POST /v1/similarity`         `["...", "..."]`
//! - `GET /`, `/health`, `/models`, `/stats`
//!
//! The optional `model` field is accepted for client compatibility and
//! ignored: requests are always served by the loaded model.

use serde::{Deserialize, Serialize};

use crate::models::{Embedding, ModelStatus};

/// Legacy embedding request for `POST /embed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEmbedRequest {
    pub texts: Vec<String>,
}

impl HttpEmbedRequest {
    /// Validate the request
    pub fn validate(&self) -> Result<(), String> {
        if self.texts.is_empty() {
            return Err("No texts provided".to_string());
        }
        Ok(())
    }
}

/// Legacy embedding response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEmbedResponse {
    pub embeddings: Vec<Embedding>,
}

/// Single text request for `POST /v1/embeddings`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Text to embed
    pub text: String,

    /// Accepted, not used for routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Embedding,
    pub model: String,
    pub dimensions: usize,
}

/// Batch request for `POST /v1/embeddings/batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmbeddingRequest {
    pub texts: Vec<String>,

    /// Accepted, not used for routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BatchEmbeddingRequest {
    /// Validate the batch size against the configured maximum
    pub fn validate(&self, max_batch_size: usize) -> Result<(), String> {
        if self.texts.len() > max_batch_size {
            return Err(format!(
                "Batch size {} exceeds maximum of {}",
                self.texts.len(),
                max_batch_size
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmbeddingResponse {
    pub embeddings: Vec<Embedding>,
    pub model: String,
    pub dimensions: usize,
    pub count: usize,
}

/// Similarity request: a bare JSON array, or `{"texts": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SimilarityRequest {
    Texts(Vec<String>),
    Wrapped { texts: Vec<String> },
}

impl SimilarityRequest {
    pub fn texts(&self) -> &[String] {
        match self {
            SimilarityRequest::Texts(texts) => texts,
            SimilarityRequest::Wrapped { texts } => texts,
        }
    }

    pub fn into_texts(self) -> Vec<String> {
        match self {
            SimilarityRequest::Texts(texts) => texts,
            SimilarityRequest::Wrapped { texts } => texts,
        }
    }

    /// Validate the request
    pub fn validate(&self) -> Result<(), String> {
        if self.texts().len() < 2 {
            return Err("At least 2 texts required for similarity".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityResponse {
    pub similarity_matrix: Vec<Vec<f32>>,
    pub texts: Vec<String>,
    pub model: String,
}

/// `GET /`
#[derive(Debug, Clone, Serialize)]
pub struct RootResponse {
    pub status: ModelStatus,
    pub model: String,
    pub version: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub device: String,
    pub dimensions: usize,
    pub uptime_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

/// One entry of `GET /models`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    /// Unknown until the model has loaded
    pub dimensions: Option<usize>,
    pub max_batch_size: usize,
    pub max_length: usize,
    pub loaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelEntry>,
}

/// Accelerator memory counters, in MiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorMemory {
    pub name: String,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

/// `GET /stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub model: String,
    pub device: String,
    pub dimensions: usize,
    pub uptime_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    pub max_batch_size: usize,
    pub max_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<AcceleratorMemory>,
}

/// HTTP Error Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    /// Error message
    pub detail: String,
}

impl HttpErrorResponse {
    /// Create a new error response
    pub fn new(detail: impl Into<String>) -> Self {
        Self { detail: detail.into() }
    }

    /// Create model not ready error
    pub fn model_not_ready() -> Self {
        Self::new("Model not loaded")
    }

    /// Create not found error
    pub fn not_found() -> Self {
        Self::new("Not Found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_embed_request_validation() {
        let req: HttpEmbedRequest = serde_json::from_str(r#"{"texts": ["Hello world"]}"#).unwrap();
        assert!(req.validate().is_ok());

        let req: HttpEmbedRequest = serde_json::from_str(r#"{"texts": []}"#).unwrap();
        assert_eq!(req.validate().unwrap_err(), "No texts provided");
    }

    #[test]
    fn test_model_field_is_optional() {
        let req: EmbeddingRequest = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert!(req.model.is_none());

        let req: BatchEmbeddingRequest =
            serde_json::from_str(r#"{"texts": ["a"], "model": "some/other-model"}"#).unwrap();
        assert_eq!(req.model.as_deref(), Some("some/other-model"));
    }

    #[test]
    fn test_batch_limit_names_the_limit() {
        let req = BatchEmbeddingRequest {
            texts: vec!["x".to_string(); 5],
            model: None,
        };
        assert!(req.validate(5).is_ok());
        let err = req.validate(4).unwrap_err();
        assert!(err.contains("maximum of 4"));

        let empty = BatchEmbeddingRequest { texts: vec![], model: None };
        assert!(empty.validate(4).is_ok());
    }

    #[test]
    fn test_similarity_request_forms() {
        let bare: SimilarityRequest = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(bare.texts(), ["a".to_string(), "b".to_string()]);
        assert!(bare.validate().is_ok());

        let wrapped: SimilarityRequest = serde_json::from_str(r#"{"texts": ["a"]}"#).unwrap();
        assert!(wrapped.validate().is_err());
        assert_eq!(wrapped.into_texts(), vec!["a".to_string()]);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let health = HealthResponse {
            status: "healthy".to_string(),
            model: "m".to_string(),
            device: "cpu".to_string(),
            dimensions: 384,
            uptime_seconds: 1.5,
            memory_mb: None,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert!(json.get("memory_mb").is_none());
        assert_eq!(json["dimensions"], 384);
    }

    #[test]
    fn test_error_response() {
        let err = HttpErrorResponse::new("Test error");
        assert_eq!(serde_json::to_string(&err).unwrap(), r#"{"detail":"Test error"}"#);
    }
}
