//! Shared HTTP plumbing for the paged fetchers.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use super::wire::{FeaturePage, RawGeometryRecord, describe_error};
use super::{FetchError, FetcherBuildError, HttpFetcherConfig};

/// Response bodies are logged up to this many bytes.
const MAX_LOGGED_BODY_BYTES: usize = 2048;

/// A decoded response with its raw body kept for diagnostics.
pub(crate) struct Fetched<T> {
    pub(crate) value: T,
    pub(crate) body: String,
    pub(crate) url: String,
}

/// HTTP client applying the configured timeout and user agent.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    pub(crate) fn new(config: &HttpFetcherConfig) -> Result<Self, FetcherBuildError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(FetcherBuildError::HttpClient)?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    /// GET `url` with `query` appended and decode the JSON body.
    pub(crate) async fn get_json<T>(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<Fetched<T>, FetchError>
    where
        T: DeserializeOwned,
    {
        let request = self
            .client
            .get(url.clone())
            .query(query)
            .build()
            .map_err(|err| self.convert_reqwest_error(&err, url.as_str()))?;
        let request_url = request.url().to_string();
        debug!("GET {request_url}");

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| self.convert_reqwest_error(&err, &request_url))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, &request_url))?;

        if !status.is_success() {
            log_failing_body(&request_url, &body);
            return Err(FetchError::Http {
                url: request_url,
                status: status.as_u16(),
                message: excerpt(&body).to_owned(),
            });
        }

        match serde_json::from_str(&body) {
            Ok(value) => Ok(Fetched {
                value,
                body,
                url: request_url,
            }),
            Err(err) => {
                log_failing_body(&request_url, &body);
                Err(FetchError::NotJson {
                    url: request_url,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Convert a reqwest error to a [`FetchError`].
    fn convert_reqwest_error(&self, error: &reqwest::Error, url: &str) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout {
                url: url.to_owned(),
                timeout_secs: self.timeout.as_secs(),
            };
        }

        if let Some(status) = error.status() {
            return FetchError::Http {
                url: url.to_owned(),
                status: status.as_u16(),
                message: error.to_string(),
            };
        }

        FetchError::Network {
            url: url.to_owned(),
            message: error.to_string(),
        }
    }
}

/// Validate a feature page, returning its records.
///
/// Declared errors and a missing `features` member fail. An empty page is
/// returned as such so the caller can report its offset; its body is still
/// logged.
pub(crate) fn page_records(
    fetched: Fetched<FeaturePage>,
) -> Result<(Vec<RawGeometryRecord>, FeaturePage), FetchError> {
    let Fetched {
        mut value,
        body,
        url,
    } = fetched;
    if let Some(error) = value.error.as_ref() {
        log_failing_body(&url, &body);
        let (code, message) = describe_error(error);
        return Err(FetchError::Service { url, code, message });
    }
    let Some(records) = value.features.take() else {
        log_failing_body(&url, &body);
        return Err(FetchError::MissingFeatures { url });
    };
    if records.is_empty() {
        log_failing_body(&url, &body);
    }
    Ok((records, value))
}

pub(crate) fn log_failing_body(url: &str, body: &str) {
    warn!("failing response from {url}: {}", excerpt(body));
}

/// Longest prefix of `body` within the logging limit, on a char boundary.
fn excerpt(body: &str) -> &str {
    (0..=body.len().min(MAX_LOGGED_BODY_BYTES))
        .rev()
        .find_map(|end| body.get(..end))
        .unwrap_or_default()
}
