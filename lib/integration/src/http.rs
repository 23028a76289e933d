//! Provider backed by an HTTP scraper service.
//!
//! Portal scraping runs in a separate service; this adapter only speaks its
//! two-endpoint JSON protocol:
//!
//! - `POST {base}/validate` with `{"credentials": ..}` answers `{"valid": bool}`
//! - `POST {base}/schedule` with `{"credentials": .., "from": .., "to": ..}`
//!   answers a JSON array of events

use crate::error::{ProviderError, RegistryError};
use crate::provider::{Provider, ProviderInfo, RawCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classync_store::FetchedEvent;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct ValidateRequest<'a> {
    credentials: &'a RawCredentials,
}

#[derive(Deserialize)]
struct ValidateResponse {
    valid: bool,
}

#[derive(Serialize)]
struct ScheduleRequest<'a> {
    credentials: &'a RawCredentials,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

/// A [`Provider`] that forwards to a scraper service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    info: ProviderInfo,
    base_url: Url,
    client: reqwest::Client,
}

impl HttpProvider {
    /// Creates a provider for the scraper at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidEndpoint`] if the URL does not parse or
    /// the HTTP client cannot be built.
    pub fn new(info: ProviderInfo, base_url: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidEndpoint {
            provider_id: info.id.clone(),
            reason,
        };

        // A trailing slash keeps `join` from replacing the last path segment.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base_url.scheme())));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            info,
            base_url,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::ProtocolError {
                reason: e.to_string(),
            })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.endpoint(path)?;
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            provider = %self.info.id,
            endpoint = %url,
            status = %status,
            "scraper returned an error status"
        );
        Err(status_error(status, body))
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else if e.is_decode() {
        ProviderError::ProtocolError {
            reason: e.to_string(),
        }
    } else {
        ProviderError::Unavailable {
            reason: e.to_string(),
        }
    }
}

fn status_error(status: StatusCode, body: String) -> ProviderError {
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::InvalidCredentials { reason }
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Unavailable { reason },
        s if s.is_server_error() => ProviderError::Unavailable { reason },
        _ => ProviderError::ProtocolError { reason },
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn info(&self) -> ProviderInfo {
        self.info.clone()
    }

    #[instrument(skip(self, credentials), fields(provider = %self.info.id))]
    async fn validate_credentials(
        &self,
        credentials: &RawCredentials,
    ) -> Result<bool, ProviderError> {
        let response = match self
            .post("validate", &ValidateRequest { credentials })
            .await
        {
            Ok(response) => response,
            Err(ProviderError::InvalidCredentials { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let body: ValidateResponse = response.json().await.map_err(request_error)?;
        Ok(body.valid)
    }

    #[instrument(skip(self, credentials), fields(provider = %self.info.id))]
    async fn get_schedule(
        &self,
        credentials: &RawCredentials,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FetchedEvent>, ProviderError> {
        let response = self
            .post(
                "schedule",
                &ScheduleRequest {
                    credentials,
                    from,
                    to,
                },
            )
            .await?;

        let events: Vec<FetchedEvent> = response.json().await.map_err(request_error)?;
        debug!(count = events.len(), "scraper returned events");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(base: &str) -> HttpProvider {
        HttpProvider::new(ProviderInfo::new("pronote", "Pronote"), base).expect("provider")
    }

    #[test]
    fn endpoints_keep_base_path() {
        let p = provider("http://scraper.local/pronote");
        assert_eq!(
            p.endpoint("schedule").expect("url").as_str(),
            "http://scraper.local/pronote/schedule"
        );

        let p = provider("http://scraper.local/pronote/");
        assert_eq!(
            p.endpoint("validate").expect("url").as_str(),
            "http://scraper.local/pronote/validate"
        );
    }

    #[test]
    fn rejects_bad_urls() {
        let info = ProviderInfo::new("pronote", "Pronote");
        assert!(matches!(
            HttpProvider::new(info.clone(), "not a url"),
            Err(RegistryError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            HttpProvider::new(info, "ftp://scraper.local"),
            Err(RegistryError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            ProviderError::InvalidCredentials { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "down".to_string()),
            ProviderError::Unavailable { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::Unavailable { .. }
        ));
        assert_eq!(
            status_error(StatusCode::GATEWAY_TIMEOUT, String::new()),
            ProviderError::Timeout
        );
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad body".to_string()),
            ProviderError::ProtocolError { reason } if reason.contains("bad body")
        ));
    }

    #[test]
    fn schedule_request_shape() {
        let credentials = RawCredentials::new(serde_json::json!({"token": "t"}));
        let from = DateTime::parse_from_rfc3339("2024-09-01T00:00:00Z")
            .expect("date")
            .with_timezone(&Utc);
        let body = serde_json::to_value(ScheduleRequest {
            credentials: &credentials,
            from,
            to: from,
        })
        .expect("serialize");

        assert_eq!(body["credentials"]["token"], "t");
        assert_eq!(body["from"], "2024-09-01T00:00:00Z");
    }
}
