//! Hyper-based HTTP Server
//!
//! Direct Hyper implementation with manual routing. A thin adapter: every
//! embedding decision lives in [`EmbeddingService`].

use hyper::body::to_bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpSocket;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::models::{EmbeddingError, ErrorKind};
use crate::protocol::http::{
    EmbedInput, HealthResponse, HttpBatchEmbedResponse, HttpEmbedRequest, HttpEmbedResponse,
    HttpErrorResponse, StatsResponse,
};
use crate::server::config::ServerConfig;
use crate::service::EmbeddingService;

/// Shared state for Hyper server
#[derive(Clone)]
struct ServerState {
    service: Arc<EmbeddingService>,
    config: Arc<ServerConfig>,
}

/// Serve HTTP until `shutdown` resolves, then stop accepting connections
/// and let in-flight requests finish.
pub async fn start_hyper_http_server<F>(
    config: Arc<ServerConfig>,
    service: Arc<EmbeddingService>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind_address = config.network.bind_address.clone();
    info!("🚀 Starting Hyper HTTP Server on {}", bind_address);

    let state = ServerState { service, config };

    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            }))
        }
    });

    let addr: std::net::SocketAddr = bind_address.parse()?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    // Disable Nagle buffering, small JSON replies would otherwise stall
    socket.set_nodelay(true)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;

    let server = Server::from_tcp(listener.into_std()?)?
        .http1_keepalive(true)
        .http1_half_close(false)
        .tcp_nodelay(true)
        .tcp_sleep_on_accept_errors(true)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown);

    info!("✅ HTTP server listening on {}", bind_address);
    info!("   POST /embed      - Generate embeddings");
    info!("   GET  /health     - Health check");
    info!("   GET  /stats      - Cache, queue and worker statistics");
    info!("   GET  /           - Server info");

    server.await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Route one request, tagging it with a request id
async fn handle_request(
    req: Request<Body>,
    state: ServerState,
) -> Result<Response<Body>, Infallible> {
    let origin = req
        .headers()
        .get("origin")
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        "http_request",
        request_id = %Uuid::new_v4(),
        method = %method,
        path = %path
    );

    async move {
        let started = Instant::now();
        let mut response = match (&method, path.as_str()) {
            (&Method::POST, "/embed") => handle_embed(req, &state).await,
            (&Method::GET, "/health") => handle_health(&state),
            (&Method::GET, "/stats") => handle_stats(&state),
            (&Method::GET, "/") => handle_root(&state),
            (&Method::OPTIONS, _) => handle_options(),
            _ => json_response(StatusCode::NOT_FOUND, &HttpErrorResponse::not_found()),
        };

        let headers = response.headers_mut();
        headers.insert("access-control-allow-origin", origin);
        headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            "access-control-allow-headers",
            HeaderValue::from_static("content-type"),
        );

        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request complete"
        );
        Ok(response)
    }
    .instrument(span)
    .await
}

/// OPTIONS handler for CORS preflight
fn handle_options() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

/// Root endpoint - server info
fn handle_root(state: &ServerState) -> Response<Body> {
    let model = state.service.config().model();
    let info = serde_json::json!({
        "name": "MRL Embedding Server",
        "version": env!("CARGO_PKG_VERSION"),
        "model": model.name,
        "description": model.description,
        "dimension": state.service.dimension(),
        "native_dimension": model.native_dim,
        "supports_mrl": model.supports_mrl,
        "endpoints": {
            "embed": {
                "method": "POST",
                "path": "/embed",
                "description": "Embed {\"text\": ...} or {\"texts\": [...]}"
            },
            "health": {
                "method": "GET",
                "path": "/health",
                "description": "Health check endpoint"
            },
            "stats": {
                "method": "GET",
                "path": "/stats",
                "description": "Cache, queue and worker statistics"
            }
        },
        "bind_address": state.config.network.bind_address,
    });

    json_response(StatusCode::OK, &info)
}

/// Health check endpoint. Never triggers a model load.
fn handle_health(state: &ServerState) -> Response<Body> {
    let service = &state.service;
    let health = HealthResponse::new(
        service.health(),
        service.config().model().name,
        service.dimension(),
        service.status(),
        service.stats().metrics.queue_depth,
        service.config().queue_capacity(),
    );

    let status = if health.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &health)
}

fn handle_stats(state: &ServerState) -> Response<Body> {
    json_response(StatusCode::OK, &StatsResponse::new(state.service.stats()))
}

/// Embedding endpoint
async fn handle_embed(req: Request<Body>, state: &ServerState) -> Response<Body> {
    let body_bytes = match to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &HttpErrorResponse::new("Failed to read request body").with_details(e.to_string()),
            );
        }
    };

    let request: HttpEmbedRequest = match serde_json::from_slice(&body_bytes) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &HttpErrorResponse::invalid_json(e.to_string()),
            );
        }
    };

    let input = match request.into_input() {
        Ok(input) => input,
        Err(error) => return json_response(StatusCode::BAD_REQUEST, &error),
    };

    match input {
        EmbedInput::Single(text) => match state.service.embed(&text).await {
            Ok(embedding) => json_response(StatusCode::OK, &HttpEmbedResponse::new(embedding)),
            Err(e) => error_response(&e),
        },
        EmbedInput::Batch(texts) => {
            let results = state.service.embed_batch(&texts).await;
            let response = HttpBatchEmbedResponse::new(results, state.service.dimension());
            if response.failed() > 0 {
                warn!(
                    failed = response.failed(),
                    total = texts.len(),
                    "Batch embedding had failures"
                );
            }
            json_response(StatusCode::OK, &response)
        }
    }
}

/// HTTP status for a service error
pub fn status_for(error: &EmbeddingError) -> StatusCode {
    match error.kind() {
        ErrorKind::EmptyInput => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Compute | ErrorKind::ModelLoad | ErrorKind::Configuration => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: &EmbeddingError) -> Response<Body> {
    let status = status_for(error);
    if status.is_server_error() {
        error!("Embedding generation failed: {}", error);
    }
    json_response(status, &HttpErrorResponse::from_error(error))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, Body::from(bytes)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from(r#"{"error":"Failed to serialize response"}"#),
            )
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
