//! Embedding Service Library
//!
//! HTTP service that loads one sentence-embedding model at startup and
//! serves embedding and similarity requests

pub mod models;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod protocol;
pub mod server;

// Re-exports
pub use models::{Embedding, EmbeddingError, EmbeddingModelsManager};
pub use server::{EmbeddingServer, ServiceConfig};
