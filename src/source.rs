use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde::Serialize;
use thiserror::Error;

use crate::domain::CollectionId;
use crate::error::HarvestError;
use crate::geometry::BoundingBox;
use crate::window::TimeWindow;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Failure reported by an imagery source for a single tile request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("rate limited by imagery source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("imagery source unavailable: {0}")]
    Unavailable(String),

    #[error("no data for tile/window: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Auth(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. } | SourceError::Timeout(_) | SourceError::Unavailable(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Handle to a remote imagery catalog. Owned by the caller and passed in.
pub trait ImagerySource: Send + Sync {
    fn fetch_tile(
        &self,
        bbox: &BoundingBox,
        window: &TimeWindow,
        collection: &CollectionId,
        channels: &[String],
    ) -> Result<Vec<u8>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub scale_m: f64,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct TileRequestBody<'a> {
    collection: &'a str,
    channels: &'a [String],
    bbox: [f64; 4],
    date_start: String,
    date_end: String,
    crs: &'static str,
    scale: f64,
    format: &'static str,
}

/// Download-endpoint client: POSTs a JSON tile description, receives a zip.
#[derive(Clone)]
pub struct HttpImagerySource {
    client: Client,
    endpoint: String,
    scale_m: f64,
}

impl HttpImagerySource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("geoharvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::SourceHttp(err.to_string()))?,
        );
        if let Some(token) = config.token.as_deref().map(str::trim) {
            if !token.is_empty() {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| HarvestError::SourceHttp(err.to_string()))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| HarvestError::SourceHttp(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            scale_m: config.scale_m,
        })
    }
}

impl ImagerySource for HttpImagerySource {
    fn fetch_tile(
        &self,
        bbox: &BoundingBox,
        window: &TimeWindow,
        collection: &CollectionId,
        channels: &[String],
    ) -> Result<Vec<u8>, SourceError> {
        let body = TileRequestBody {
            collection: collection.as_str(),
            channels,
            bbox: [bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat],
            date_start: window.start.to_string(),
            date_end: window.end.to_string(),
            crs: "EPSG:4326",
            scale: self.scale_m,
            format: "zip",
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = response
                .text()
                .unwrap_or_else(|_| "imagery request failed".to_string());
            return Err(classify_status(status, retry_after, message));
        }
        if status == StatusCode::NO_CONTENT {
            return Err(SourceError::NotFound("empty response".to_string()));
        }

        let bytes = response.bytes().map_err(classify_transport_error)?;
        if bytes.is_empty() {
            return Err(SourceError::NotFound("empty response".to_string()));
        }
        if !bytes.starts_with(ZIP_MAGIC) {
            return Err(SourceError::Malformed(
                "response body is not a zip archive".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    message: String,
) -> SourceError {
    match status.as_u16() {
        429 => SourceError::RateLimited { retry_after },
        408 | 504 => SourceError::Timeout(format!("{status}: {message}")),
        401 | 403 => SourceError::Auth(format!("{status}: {message}")),
        404 | 410 => SourceError::NotFound(format!("{status}: {message}")),
        500..=599 => SourceError::Unavailable(format!("{status}: {message}")),
        _ => SourceError::Malformed(format!("{status}: {message}")),
    }
}

fn classify_transport_error(err: reqwest::Error) -> SourceError {
    if err.is_builder() {
        SourceError::Malformed(err.to_string())
    } else if err.is_timeout() {
        SourceError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        SourceError::Unavailable(err.to_string())
    } else {
        SourceError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let limited = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            String::new(),
        );
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new()).is_transient());
        assert!(classify_status(StatusCode::GATEWAY_TIMEOUT, None, String::new()).is_transient());

        for permanent in [
            StatusCode::NOT_FOUND,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::BAD_REQUEST,
        ] {
            assert!(!classify_status(permanent, None, String::new()).is_transient());
        }
    }

    #[test]
    fn builds_client_with_token() {
        let source = HttpImagerySource::new(HttpSourceConfig {
            endpoint: "http://localhost:9/tiles".to_string(),
            token: Some("secret".to_string()),
            scale_m: 10.0,
            timeout: Duration::from_secs(5),
        });
        assert!(source.is_ok());
    }

    #[test]
    fn bad_endpoint_is_not_retried() {
        let source = HttpImagerySource::new(HttpSourceConfig {
            endpoint: "not a url".to_string(),
            token: None,
            scale_m: 10.0,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let window = TimeWindow::new(
            chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
        )
        .unwrap();
        let err = source
            .fetch_tile(
                &BoundingBox::new(0.0, 0.0, 0.1, 0.1),
                &window,
                &"COPERNICUS/S2".parse().unwrap(),
                &["B2".to_string()],
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)), "{err:?}");
        assert!(!err.is_transient());
    }
}
