//! Wire protocol of the embedding service

pub mod http;

pub use http::{
    AcceleratorMemory, BatchEmbeddingRequest, BatchEmbeddingResponse, EmbeddingRequest,
    EmbeddingResponse, HealthResponse, HttpEmbedRequest, HttpEmbedResponse, HttpErrorResponse,
    ModelEntry, ModelsResponse, RootResponse, SimilarityRequest, SimilarityResponse,
    StatsResponse,
};
