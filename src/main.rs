//! Embedding Service Main
//!
//! Entry point for the HTTP embedding service

use embedding_service::{EmbeddingServer, ServiceConfig};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = ServiceConfig::load()?;

    // Initialize tracing
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        match config.monitoring.log_level.to_lowercase().as_str() {
            level @ ("trace" | "debug" | "info" | "warn" | "error") => {
                format!("embedding_service={},{}", level, level)
            }
            _ => "embedding_service=info,info".to_string(),
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .init();

    println!("🚀 Embedding Service v{}", env!("CARGO_PKG_VERSION"));
    println!("🧠 Model: {}", config.model.name);
    println!("🖥️  Device: {:?}", config.model.device);
    println!("📡 Address: {}", config.bind_address());
    println!("📊 Log Level: {}", config.monitoring.log_level);
    println!("===============================");
    println!("🛑 Press Ctrl+C to stop");

    // Binds, loads the model, serves until Ctrl+C. An unfinished model load
    // does not hold the process open after shutdown.
    EmbeddingServer::new(config).run()
}
