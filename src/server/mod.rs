//! Server module

pub mod config;
pub mod hyper_server;
pub mod server;
pub mod system;

pub use config::ServiceConfig;
pub use server::EmbeddingServer;
