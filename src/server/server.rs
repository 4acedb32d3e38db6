//! Embedding Server
//!
//! Binds the HTTP listener first so `/` can report `loading`, then loads the
//! model alongside the running server. A failed load stops the process.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::EmbeddingModelsManager;
use crate::server::config::ServiceConfig;
use crate::server::hyper_server::{self, ServerState};

type ServerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// How long blocking work (a model load or download) may keep the process
/// alive after the server has stopped
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct EmbeddingServer {
    config: Arc<ServiceConfig>,
    manager: Arc<EmbeddingModelsManager>,
    server_id: Uuid,
}

impl EmbeddingServer {
    /// Create a new embedding server. Nothing is loaded or bound yet.
    pub fn new(config: ServiceConfig) -> Self {
        let manager = EmbeddingModelsManager::new(config.model_settings());
        let server_id = Uuid::new_v4();
        info!("🆔 Server ID: {}", server_id);

        Self {
            config: Arc::new(config),
            manager: Arc::new(manager),
            server_id,
        }
    }

    pub fn manager(&self) -> Arc<EmbeddingModelsManager> {
        self.manager.clone()
    }

    /// Build the runtime, serve until Ctrl+C and tear the runtime down
    /// within [`SHUTDOWN_GRACE`]
    pub fn run(self) -> ServerResult {
        run_on_runtime(self.start(), SHUTDOWN_GRACE)
    }

    /// Serve until Ctrl+C. Returns an error if binding or model loading fails.
    pub async fn start(self) -> ServerResult {
        info!("🚀 Starting embedding server {}", self.server_id);

        let listener = hyper_server::bind_listener(&self.config).await?;
        let state = ServerState {
            manager: self.manager.clone(),
            config: self.config.clone(),
        };

        let mut server = tokio::spawn(hyper_server::serve(listener, state, shutdown_signal()));

        tokio::select! {
            loaded = self.manager.load() => {
                if let Err(e) = loaded {
                    error!("❌ Failed to load model {}: {}", self.manager.model_name(), e);
                    server.abort();
                    return Err(e.into());
                }
            }
            finished = &mut server => {
                // Server stopped (Ctrl+C or error) before the model was ready
                finished??;
                info!("🛑 Server stopped before the model finished loading");
                return Ok(());
            }
        }

        info!("📡 Ready to accept embedding requests");
        server.await??;
        info!("🛑 Server stopped");
        Ok(())
    }
}

/// Drive `service` on a fresh multi-threaded runtime. Blocking tasks still
/// running afterwards (an unfinished model load) get `grace` to finish and
/// are then abandoned.
pub fn run_on_runtime<F>(service: F, grace: Duration) -> ServerResult
where
    F: Future<Output = ServerResult>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(service);

    let started = Instant::now();
    runtime.shutdown_timeout(grace);
    if started.elapsed() >= grace {
        warn!("⚠️  Abandoned unfinished background work after {:?}", grace);
    }
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfinished_load_does_not_hold_the_process() {
        let started = Instant::now();
        let result = run_on_runtime(
            async {
                // Same shape as `start`: the server stops while the load is
                // still running on the blocking pool
                let load = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(10)));
                let server = tokio::spawn(tokio::time::sleep(Duration::from_millis(20)));
                let outcome: ServerResult = tokio::select! {
                    _ = load => Err("load finished first".into()),
                    _ = server => Ok(()),
                };
                outcome
            },
            Duration::from_millis(200),
        );

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_service_error_is_returned() {
        let service = async {
            let failed: ServerResult = Err("bind failed".into());
            failed
        };
        let result = run_on_runtime(service, Duration::from_millis(10));
        assert_eq!(result.unwrap_err().to_string(), "bind failed");
    }
}
