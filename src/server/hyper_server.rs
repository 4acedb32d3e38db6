//! Hyper-based HTTP Server
//!
//! Plain Hyper with manual routing: one match on method and path, JSON in,
//! JSON out. Every response carries CORS headers and an `x-request-id`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpSocket;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::models::{EmbeddingError, EmbeddingModelsManager};
use crate::protocol::http::{
    BatchEmbeddingRequest, BatchEmbeddingResponse, EmbeddingRequest, EmbeddingResponse,
    HealthResponse, HttpEmbedRequest, HttpEmbedResponse, HttpErrorResponse, ModelEntry,
    ModelsResponse, RootResponse, SimilarityRequest, SimilarityResponse, StatsResponse,
};
use crate::server::config::ServiceConfig;
use crate::server::system;

/// Paths the router knows, for 405 vs 404
const ROUTES: [&str; 8] = [
    "/",
    "/health",
    "/models",
    "/stats",
    "/embed",
    "/v1/embeddings",
    "/v1/embeddings/batch",
    "/v1/similarity",
];

/// Shared state handed to every request
#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<EmbeddingModelsManager>,
    pub config: Arc<ServiceConfig>,
}

/// Resolve the configured host and open a listening socket
pub async fn bind_listener(
    config: &ServiceConfig,
) -> Result<std::net::TcpListener, Box<dyn std::error::Error + Send + Sync>> {
    let bind_address = config.bind_address();
    let addr: SocketAddr = tokio::net::lookup_host(&bind_address)
        .await?
        .next()
        .ok_or_else(|| format!("Could not resolve bind address {}", bind_address))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    // Nagle buffers small packets causing 40-200ms delays
    socket.set_nodelay(true)?;
    // Enable SO_REUSEADDR for faster restart
    socket.set_reuseaddr(true)?;

    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    info!("📡 Bound to {}", addr);

    Ok(listener.into_std()?)
}

/// Serve HTTP on `listener` until `shutdown` resolves
pub async fn serve<F>(
    listener: std::net::TcpListener,
    state: ServerState,
    shutdown: F,
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            }))
        }
    });

    let server = Server::from_tcp(listener)?
        .http1_keepalive(true)
        .http1_half_close(false)
        .tcp_nodelay(true)
        .tcp_sleep_on_accept_errors(true)
        .serve(make_svc);

    info!("📍 Endpoints:");
    info!("   POST /v1/embeddings        - Embed one text");
    info!("   POST /v1/embeddings/batch  - Embed a batch of texts");
    info!("   POST /v1/similarity        - Pairwise cosine similarity");
    info!("   POST /embed                - Embed texts (legacy)");
    info!("   GET  /health /stats /models /");

    server.with_graceful_shutdown(shutdown).await
}

/// Main request handler
pub async fn handle_request(
    req: Request<Body>,
    state: ServerState,
) -> Result<Response<Body>, Infallible> {
    let request_id = Uuid::new_v4();
    let origin = req
        .headers()
        .get("origin")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = info_span!("request", id = %request_id, method = %method, path = %path);

    let started = Instant::now();
    let mut response = route(req, &state, &method, &path).instrument(span).await;
    debug!(
        "{} {} -> {} in {:?} ({})",
        method,
        path,
        response.status(),
        started.elapsed(),
        request_id
    );

    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", origin);
    // The allowed origin depends on the request
    headers.insert(VARY, HeaderValue::from_static("origin"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type"),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-request-id", value);
    }

    Ok(response)
}

async fn route(req: Request<Body>, state: &ServerState, method: &Method, path: &str) -> Response<Body> {
    match (method, path) {
        (&Method::GET, "/") => handle_root(state),
        (&Method::GET, "/health") => handle_health(state),
        (&Method::GET, "/models") => handle_models(state),
        (&Method::GET, "/stats") => handle_stats(state),
        (&Method::POST, "/embed") => handle_embed(req, state).await,
        (&Method::POST, "/v1/embeddings") => handle_embedding(req, state).await,
        (&Method::POST, "/v1/embeddings/batch") => handle_batch(req, state).await,
        (&Method::POST, "/v1/similarity") => handle_similarity(req, state).await,
        (&Method::OPTIONS, _) => empty_response(StatusCode::NO_CONTENT),
        (_, p) if ROUTES.contains(&p) => error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            HttpErrorResponse::new("Method Not Allowed"),
        ),
        _ => error_response(StatusCode::NOT_FOUND, HttpErrorResponse::not_found()),
    }
}

/// Root endpoint - load status
fn handle_root(state: &ServerState) -> Response<Body> {
    let response = RootResponse {
        status: state.manager.status(),
        model: state.manager.model_name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    json_response(StatusCode::OK, &response)
}

/// Health check endpoint
fn handle_health(state: &ServerState) -> Response<Body> {
    let loaded = match state.manager.ready() {
        Ok(loaded) => loaded,
        Err(e) => return embedding_error_response(e),
    };

    let response = HealthResponse {
        status: "healthy".to_string(),
        model: state.manager.model_name().to_string(),
        device: loaded.device().to_string(),
        dimensions: loaded.dimension(),
        uptime_seconds: loaded.uptime().as_secs_f64(),
        memory_mb: system::resident_memory_mb(),
    };
    json_response(StatusCode::OK, &response)
}

fn handle_models(state: &ServerState) -> Response<Body> {
    let loaded = state.manager.ready().ok();
    let response = ModelsResponse {
        models: vec![ModelEntry {
            id: state.manager.model_name().to_string(),
            dimensions: loaded.map(|l| l.dimension()),
            max_batch_size: state.config.limits.max_batch_size,
            max_length: state.config.limits.max_length,
            loaded: loaded.is_some(),
        }],
    };
    json_response(StatusCode::OK, &response)
}

fn handle_stats(state: &ServerState) -> Response<Body> {
    let loaded = match state.manager.ready() {
        Ok(loaded) => loaded,
        Err(e) => return embedding_error_response(e),
    };

    let accelerator = if loaded.device().is_accelerator() {
        system::accelerator_memory()
    } else {
        None
    };

    let response = StatsResponse {
        model: state.manager.model_name().to_string(),
        device: loaded.device().to_string(),
        dimensions: loaded.dimension(),
        uptime_seconds: loaded.uptime().as_secs_f64(),
        memory_mb: system::resident_memory_mb(),
        max_batch_size: state.config.limits.max_batch_size,
        max_length: state.config.limits.max_length,
        accelerator,
    };
    json_response(StatusCode::OK, &response)
}

/// Legacy endpoint: `{texts}` -> `{embeddings}`
async fn handle_embed(req: Request<Body>, state: &ServerState) -> Response<Body> {
    let request: HttpEmbedRequest = match read_json(req, state.config.max_body_bytes()).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(e) = state.manager.ready() {
        return embedding_error_response(e);
    }
    if let Err(msg) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, HttpErrorResponse::new(msg));
    }

    match state.manager.embed_batch(&request.texts).await {
        Ok(embeddings) => json_response(StatusCode::OK, &HttpEmbedResponse { embeddings }),
        Err(e) => embedding_error_response(e),
    }
}

async fn handle_embedding(req: Request<Body>, state: &ServerState) -> Response<Body> {
    let request: EmbeddingRequest = match read_json(req, state.config.max_body_bytes()).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(e) = state.manager.ready() {
        return embedding_error_response(e);
    }
    ignores_requested_model(request.model.as_deref(), state.manager.model_name());

    match state.manager.embed_text(&request.text).await {
        Ok(embedding) => {
            let response = EmbeddingResponse {
                dimensions: embedding.len(),
                embedding,
                model: state.manager.model_name().to_string(),
            };
            json_response(StatusCode::OK, &response)
        }
        Err(e) => embedding_error_response(e),
    }
}

async fn handle_batch(req: Request<Body>, state: &ServerState) -> Response<Body> {
    let request: BatchEmbeddingRequest = match read_json(req, state.config.max_body_bytes()).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let loaded = match state.manager.ready() {
        Ok(loaded) => loaded,
        Err(e) => return embedding_error_response(e),
    };
    if let Err(msg) = request.validate(state.config.limits.max_batch_size) {
        return error_response(StatusCode::BAD_REQUEST, HttpErrorResponse::new(msg));
    }
    ignores_requested_model(request.model.as_deref(), state.manager.model_name());

    match state.manager.embed_batch(&request.texts).await {
        Ok(embeddings) => {
            let dimensions = embeddings.first().map_or(loaded.dimension(), |e| e.len());
            let response = BatchEmbeddingResponse {
                count: embeddings.len(),
                embeddings,
                model: state.manager.model_name().to_string(),
                dimensions,
            };
            json_response(StatusCode::OK, &response)
        }
        Err(e) => embedding_error_response(e),
    }
}

async fn handle_similarity(req: Request<Body>, state: &ServerState) -> Response<Body> {
    let request: SimilarityRequest = match read_json(req, state.config.max_body_bytes()).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(e) = state.manager.ready() {
        return embedding_error_response(e);
    }
    if let Err(msg) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, HttpErrorResponse::new(msg));
    }

    let texts = request.into_texts();
    match state.manager.similarity(&texts).await {
        Ok(similarity_matrix) => {
            let response = SimilarityResponse {
                similarity_matrix,
                texts,
                model: state.manager.model_name().to_string(),
            };
            json_response(StatusCode::OK, &response)
        }
        Err(e) => embedding_error_response(e),
    }
}

/// Requests are always served by the loaded model. Returns whether a
/// different model was asked for.
fn ignores_requested_model(requested: Option<&str>, served: &str) -> bool {
    match requested {
        Some(requested) if requested != served => {
            debug!("Ignoring requested model '{}', serving '{}'", requested, served);
            true
        }
        _ => false,
    }
}

/// Read and parse a JSON body of at most `limit` bytes. The error side is a
/// ready 400 or 413 response.
async fn read_json<T: DeserializeOwned>(req: Request<Body>, limit: usize) -> Result<T, Response<Body>> {
    let too_large = || {
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            HttpErrorResponse::new(format!("Request body exceeds {} bytes", limit)),
        )
    };

    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.map_or(false, |length| length > limit) {
        return Err(too_large());
    }

    let mut body = req.into_body();
    let mut body_bytes = Vec::with_capacity(declared.unwrap_or(0));
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| {
            warn!("Failed to read request body: {}", e);
            error_response(
                StatusCode::BAD_REQUEST,
                HttpErrorResponse::new("Failed to read request body"),
            )
        })?;
        if body_bytes.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body_bytes.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&body_bytes).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            HttpErrorResponse::new(format!("Invalid JSON: {}", e)),
        )
    })
}

/// Map a model-layer error onto its status code. The raw message is kept in
/// the body.
fn embedding_error_response(err: EmbeddingError) -> Response<Body> {
    match err {
        EmbeddingError::NotLoaded { .. } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, HttpErrorResponse::model_not_ready())
        }
        EmbeddingError::InvalidInput { message } => {
            error_response(StatusCode::BAD_REQUEST, HttpErrorResponse::new(message))
        }
        other => {
            error!("❌ Request failed: {}", other);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                HttpErrorResponse::new(other.to_string()),
            )
        }
    }
}

/// Helper to create error responses
fn error_response(status: StatusCode, error: HttpErrorResponse) -> Response<Body> {
    json_response(status, &error)
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            error!("❌ Response serialization failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"detail":"Response serialization failed"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
