use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use stream_token_cache::{BackingStore, BackingStoreError, RetrievedMedia, SourceRef};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{OriginError, Result};

const REFERENCE_PLACEHOLDER: &str = "{reference}";
const DEFAULT_USER_AGENT: &str = "media-origin-client-rs/0.1";
const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// Settings for [`OriginClient`]
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Object URL with a `{reference}` placeholder
    pub url_template: String,
    /// Session credential obtained elsewhere, sent as a bearer token
    pub auth_token: Option<String>,
    /// Retrievals allowed to run at once, bodies included
    pub max_concurrent: usize,
    /// Minimum spacing between the start of two retrievals
    pub min_interval: Duration,
    pub connect_timeout: Duration,
    /// Longest silence tolerated while reading a response
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            url_template: String::new(),
            auth_token: None,
            max_concurrent: 1,
            min_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Backing store over the media origin's HTTP API
pub struct OriginClient {
    client: reqwest::Client,
    url_template: String,
    auth_token: Option<String>,
    /// Bounds concurrent retrievals; a permit lives as long as the body
    limiter: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl OriginClient {
    pub fn new(config: OriginConfig) -> Result<Self> {
        validate_template(&config.url_template)?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            url_template: config.url_template,
            auth_token: config.auth_token,
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            min_interval: config.min_interval,
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// URL of the object behind `reference`
    pub fn object_url(&self, reference: SourceRef) -> String {
        self.url_template
            .replace(REFERENCE_PLACEHOLDER, &reference.to_string())
    }

    /// Reserve the next start slot and return how long to wait for it
    async fn reserve_slot(&self) -> Duration {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let start = (*next).max(now);
        *next = start + self.min_interval;
        start - now
    }
}

#[async_trait]
impl BackingStore for OriginClient {
    async fn retrieve(&self, reference: SourceRef) -> std::result::Result<RetrievedMedia, BackingStoreError> {
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackingStoreError::Fatal("origin client shut down".to_string()))?;

        let wait = self.reserve_slot().await;
        if !wait.is_zero() {
            debug!(reference = %reference, wait_ms = wait.as_millis() as u64, "Rate limiting origin request");
            tokio::time::sleep(wait).await;
        }

        let url = self.object_url(reference);
        debug!(url = %url, "Fetching object from origin");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport_error)?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(FALLBACK_MEDIA_TYPE)
            .to_string();

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Origin refused object");
            return Err(classify_status(response.status(), &media_type));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        debug!(
            reference = %reference,
            content_type = %media_type,
            content_length,
            "Origin object opened"
        );

        let body = response
            .bytes_stream()
            .map(move |chunk| {
                let _held = &permit;
                chunk.map_err(std::io::Error::other)
            })
            .boxed();

        Ok(RetrievedMedia {
            media_type,
            content_length,
            body,
        })
    }
}

fn validate_template(template: &str) -> Result<()> {
    if !template.contains(REFERENCE_PLACEHOLDER) {
        return Err(OriginError::InvalidTemplate(format!(
            "{} has no {} placeholder",
            template, REFERENCE_PLACEHOLDER
        )));
    }
    url::Url::parse(&template.replace(REFERENCE_PLACEHOLDER, "0"))
        .map_err(|e| OriginError::InvalidTemplate(format!("{}: {}", template, e)))?;
    Ok(())
}

/// Map a non-success origin status onto the backing-store taxonomy
fn classify_status(status: StatusCode, media_type: &str) -> BackingStoreError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => BackingStoreError::NotFound,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => BackingStoreError::WrongType(media_type.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            BackingStoreError::Transient(format!("origin returned status {}", status))
        }
        s if s.is_server_error() => {
            BackingStoreError::Transient(format!("origin returned status {}", status))
        }
        s => BackingStoreError::Fatal(format!("origin returned status {}", s)),
    }
}

fn classify_transport_error(err: reqwest::Error) -> BackingStoreError {
    if err.is_builder() {
        BackingStoreError::Fatal(err.to_string())
    } else {
        BackingStoreError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use futures::TryStreamExt;

    fn config(template: &str) -> OriginConfig {
        OriginConfig {
            url_template: template.to_string(),
            min_interval: Duration::ZERO,
            ..OriginConfig::default()
        }
    }

    async fn media(Path(id): Path<u64>) -> axum::response::Response {
        match id {
            1 => ([(header::CONTENT_TYPE, "audio/mpeg")], vec![9u8; 1000]).into_response(),
            2 => ([(header::CONTENT_TYPE, "image/png")], vec![0u8; 10]).into_response(),
            429 => AxumStatus::TOO_MANY_REQUESTS.into_response(),
            500 => AxumStatus::BAD_GATEWAY.into_response(),
            403 => AxumStatus::FORBIDDEN.into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_origin() -> String {
        let router = Router::new().route("/media/{id}", get(media));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/media/{{reference}}", addr)
    }

    #[test]
    fn test_template_validation() {
        assert!(OriginClient::new(config("https://origin.example/media/{reference}")).is_ok());

        let err = OriginClient::new(config("https://origin.example/media"))
            .err()
            .unwrap();
        assert!(matches!(err, OriginError::InvalidTemplate(_)));

        assert!(OriginClient::new(config("not a url {reference}")).is_err());
    }

    #[test]
    fn test_object_url() {
        let client =
            OriginClient::new(config("https://origin.example/c/radio/{reference}?dl=1")).unwrap();
        assert_eq!(
            client.object_url(SourceRef(1234)),
            "https://origin.example/c/radio/1234?dl=1"
        );
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "text/html"),
            BackingStoreError::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "video/mp4"),
            BackingStoreError::WrongType("video/mp4".to_string())
        );
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackingStoreError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            BackingStoreError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            BackingStoreError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_reserve_slot_spaces_requests() {
        let client = OriginClient::new(OriginConfig {
            url_template: "http://localhost/{reference}".to_string(),
            min_interval: Duration::from_millis(200),
            ..OriginConfig::default()
        })
        .unwrap();

        let first = client.reserve_slot().await;
        let second = client.reserve_slot().await;
        let third = client.reserve_slot().await;

        assert!(first.is_zero());
        assert!(second > Duration::from_millis(150));
        assert!(third > Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retrieve_streams_body() {
        let template = spawn_origin().await;
        let client = OriginClient::new(config(&template)).unwrap();

        let media = client.retrieve(SourceRef(1)).await.unwrap();
        assert_eq!(media.media_type, "audio/mpeg");
        assert_eq!(media.content_length, Some(1000));

        let chunks: Vec<Bytes> = media.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), vec![9u8; 1000]);
    }

    #[tokio::test]
    async fn test_retrieve_reports_declared_type() {
        let template = spawn_origin().await;
        let client = OriginClient::new(config(&template)).unwrap();

        let media = client.retrieve(SourceRef(2)).await.unwrap();
        assert_eq!(media.media_type, "image/png");
    }

    #[tokio::test]
    async fn test_retrieve_maps_statuses() {
        let template = spawn_origin().await;
        let client = OriginClient::new(config(&template)).unwrap();

        assert_eq!(
            client.retrieve(SourceRef(404)).await.unwrap_err(),
            BackingStoreError::NotFound
        );
        assert!(matches!(
            client.retrieve(SourceRef(429)).await.unwrap_err(),
            BackingStoreError::Transient(_)
        ));
        assert!(matches!(
            client.retrieve(SourceRef(500)).await.unwrap_err(),
            BackingStoreError::Transient(_)
        ));
        assert!(matches!(
            client.retrieve(SourceRef(403)).await.unwrap_err(),
            BackingStoreError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transient() {
        // Bind and drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            OriginClient::new(config(&format!("http://{}/media/{{reference}}", addr))).unwrap();
        assert!(matches!(
            client.retrieve(SourceRef(1)).await.unwrap_err(),
            BackingStoreError::Transient(_)
        ));
    }
}
