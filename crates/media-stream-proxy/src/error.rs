//! Error types for the media stream proxy

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::fmt;
use stream_token_cache::StreamError;

#[derive(Debug)]
pub enum ProxyError {
    Origin(media_origin_client::OriginError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Origin(err) => write!(f, "Origin client error: {}", err),
            ProxyError::Io(err) => write!(f, "IO error: {}", err),
            ProxyError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Origin(err) => Some(err),
            ProxyError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<media_origin_client::OriginError> for ProxyError {
    fn from(err: media_origin_client::OriginError) -> Self {
        ProxyError::Origin(err)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ProxyError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Request failure that renders as a JSON error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Stream(StreamError),
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        ApiError::Stream(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(msg) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response();
            }
            ApiError::Stream(err) => err,
        };

        let (status, message) = match &err {
            StreamError::NotFound => (StatusCode::NOT_FOUND, "Stream not found".to_string()),
            StreamError::Gone => (StatusCode::GONE, "Stream expired".to_string()),
            StreamError::UnsupportedMedia(kind) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("Unsupported media type: {}", kind),
            ),
            StreamError::RangeNotSatisfiable { size } => {
                let body = Json(json!({ "error": "Range not satisfiable" }));
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                    body,
                )
                    .into_response();
            }
            StreamError::BackingStoreTransient(msg) => {
                tracing::error!(error = %msg, "Backing store retrieval failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            StreamError::Internal(_) | StreamError::Io(_) => {
                tracing::error!(error = %err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
