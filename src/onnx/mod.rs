//! ONNX Runtime inference backend

pub mod onnx_engine;
pub use onnx_engine::{OnnxConfig, OnnxEmbeddingEngine};
