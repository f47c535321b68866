use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::traits::VisionClassifier;
use crate::types::{Classification, ImageRef, VisionError};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_b64: Option<String>,
}

/// Raw HTTP client for the vision service. One POST per classification,
/// timeout-bound so a stuck call cannot pin a worker. The timeout rides on
/// each request, so construction cannot fail and the bound always applies.
pub struct HttpVisionClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
    call_timeout: Duration,
}

impl HttpVisionClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self::with_timeout(base_url, api_key, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, api_key: &str, call_timeout: Duration) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            call_timeout,
        }
    }

    fn headers(&self) -> Result<HeaderMap, VisionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| VisionError::Permanent {
                status: 0,
                message: format!("invalid api key header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl VisionClassifier for HttpVisionClient {
    async fn classify(&self, image: &ImageRef) -> Result<Classification, VisionError> {
        let url = format!("{}/v1/classify", self.base_url);
        let body = match image {
            ImageRef::Url(u) => ClassifyRequest { image_url: Some(u), image_b64: None },
            ImageRef::Bytes(bytes) => ClassifyRequest {
                image_url: None,
                image_b64: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            },
        };

        debug!(url = %url, "vision classify request");

        let response = self
            .http
            .post(&url)
            .timeout(self.call_timeout)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    VisionError::Transient(e.to_string())
                } else {
                    VisionError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            // 429 and 5xx are service-side conditions worth retrying;
            // any other 4xx means the request itself is wrong.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(VisionError::Transient(format!("{status}: {message}")))
            } else {
                Err(VisionError::Permanent { status: status.as_u16(), message })
            };
        }

        let classification: Classification =
            response.json().await.map_err(|e| VisionError::Permanent {
                status: status.as_u16(),
                message: format!("undecodable classification body: {e}"),
            })?;

        Ok(classification.normalized())
    }
}
