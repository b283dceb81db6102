//! HTTP server for stream proxy endpoints
//!
//! Provides /, /health, /mint and /stream/{token}.

use crate::error::ApiError;
use crate::types::{HealthResponse, MintRequest, MintResponse};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use stream_token_cache::{StreamError, StreamService, StreamToken};
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

/// Shared state for the HTTP server
pub struct ServerState {
    pub service: StreamService,
    pub public_url: String,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(service: StreamService, public_url: impl Into<String>) -> Self {
        Self {
            service,
            public_url: public_url.into(),
            started_at: Utc::now(),
        }
    }

    fn stream_url(&self, token: &StreamToken) -> String {
        format!(
            "{}/stream/{}",
            self.public_url.trim_end_matches('/'),
            token
        )
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/mint", post(mint))
        .route("/stream/{token}", get(stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

async fn banner() -> &'static str {
    "Media stream proxy is running"
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state.service.stats().await;
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache,
    })
}

/// Mint (or reuse) a stream token for a backing-store reference
async fn mint(
    State(state): State<SharedState>,
    body: Result<Json<MintRequest>, JsonRejection>,
) -> Result<Json<MintResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let minted = state.service.mint(request.reference).await?;
    let expires_in_secs = (minted.expires_at - Utc::now()).num_seconds().max(0) as u64;

    info!(
        reference = %request.reference,
        token = %minted.token,
        reused = minted.reused,
        "Minted stream token"
    );

    Ok(Json(MintResponse {
        stream_url: state.stream_url(&minted.token),
        token: minted.token,
        expires_at: minted.expires_at,
        expires_in_secs,
        reused: minted.reused,
    }))
}

/// Stream the cached object behind a token, honouring a single byte range
async fn stream(
    State(state): State<SharedState>,
    Path(raw_token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = StreamToken::parse(&raw_token).ok_or(StreamError::NotFound)?;

    // A header that is not visible ASCII can never be a valid range
    let range = headers
        .get(header::RANGE)
        .map(|value| value.to_str().unwrap_or_default());

    let served = state.service.serve(&token, range).await?;

    debug!(
        token = %token,
        range = ?range,
        status = served.status_code(),
        length = served.content_length(),
        "Serving stream request"
    );

    let status = if served.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            state.service.settings().accepted_media_type.as_str(),
        )
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, served.content_length());
    if let Some(content_range) = served.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder
        .body(Body::from_stream(served.body))
        .map_err(|e| ApiError::Stream(StreamError::Internal(e.to_string())))
}
