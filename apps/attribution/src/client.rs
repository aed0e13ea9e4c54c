//! HTTP client for a separately deployed landing page or operator tooling
//! talking to the attribution service.

use std::time::Duration;

use reqwest::Url;

use crate::attribution::types::{DeferDeepLinkRequest, RecordVisitResponse, ResolveVisitResponse};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("attribution service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Clone)]
pub struct AttributionClient {
    base_url: Url,
    http: reqwest::Client,
}

impl AttributionClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base_url = Url::parse(&format!("{trimmed}/"))
            .map_err(|error| ClientError::InvalidBaseUrl(format!("{trimmed}: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(trimmed.to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    pub async fn record_visit(
        &self,
        request: &DeferDeepLinkRequest,
    ) -> Result<RecordVisitResponse, ClientError> {
        let url = self.endpoint(&["deferDeepLink"])?;
        let response = self.http.post(url).json(request).send().await?;
        decode(response).await
    }

    pub async fn resolve_visit(&self, device_key: &str) -> Result<ResolveVisitResponse, ClientError> {
        let url = self.endpoint(&["queryDeferredDeepLinks", device_key])?;
        let response = self.http.get(url).send().await?;
        decode(response).await
    }

    // Segments are percent-encoded, so device keys never alter the route.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ClientError::InvalidBaseUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<T>().await?)
}
