//! Blocking JSON transport shared by the HTTP clients.

use std::future::Future;
use std::time::Duration;

use hubsync_core::RemoteError;
use log::debug;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use url::Url;

use super::config::{ClientBuildError, HttpClientConfig};

/// Longest error body echoed back in a [`RemoteError`] message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// HTTP client, validated base URL and the runtime used to drive requests.
///
/// When called from outside any Tokio runtime, requests run on the stored
/// runtime. Inside a multi-threaded runtime they run on the caller's handle
/// through [`tokio::task::block_in_place`]; inside a `current_thread` runtime
/// they fall back to the stored runtime, which may stall the caller's IO.
pub(crate) struct Transport {
    client: Client,
    config: HttpClientConfig,
    base: Url,
    runtime: Runtime,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("base", &self.base.as_str())
            .field("runtime", &"<tokio::runtime::Runtime>")
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub(crate) fn build(config: HttpClientConfig) -> Result<Self, ClientBuildError> {
        let base = parse_base_url(&config.base_url)?;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(ClientBuildError::HttpClient)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientBuildError::Runtime)?;
        Ok(Self {
            client,
            config,
            base,
            runtime,
        })
    }

    /// Resolve `segments` below the base URL, percent-encoding each one.
    pub(crate) fn endpoint<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, RemoteError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::Misconfigured {
                message: format!("base URL {} cannot carry a path", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Issue a GET request and decode its JSON body.
    pub(crate) fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: Url,
    ) -> Result<T, RemoteError> {
        self.block_on(self.get_json_async(operation, url))
    }

    async fn get_json_async<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: Url,
    ) -> Result<T, RemoteError> {
        debug!("{operation}: GET {url}");
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, operation))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(operation, status, retry_after, &body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, operation))?;
        decode_body(operation, &body)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(future))
            }
            _ => self.runtime.block_on(future),
        }
    }

    /// Convert a transport-level reqwest error into a [`RemoteError`].
    fn convert_reqwest_error(&self, error: &reqwest::Error, operation: &str) -> RemoteError {
        if error.is_timeout() {
            return RemoteError::Timeout {
                operation: operation.to_owned(),
                timeout_secs: self.config.timeout.as_secs(),
            };
        }

        if let Some(status) = error.status() {
            return classify_status(operation, status, None, &error.to_string());
        }

        if error.is_decode() {
            return RemoteError::Malformed {
                operation: operation.to_owned(),
                message: error.to_string(),
            };
        }

        RemoteError::Network {
            operation: operation.to_owned(),
            message: error.to_string(),
        }
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, ClientBuildError> {
    let invalid = |reason: String| ClientBuildError::InvalidBaseUrl {
        base_url: base_url.to_owned(),
        reason,
    };
    let url = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot carry a path".to_owned()));
    }
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    Ok(url)
}

/// Map a non-success HTTP status onto a [`RemoteError`].
pub(crate) fn classify_status(
    operation: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> RemoteError {
    let operation = operation.to_owned();
    let message: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            operation,
            retry_after,
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound { operation },
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout {
            operation,
            timeout_secs: 0,
        },
        status if status.is_server_error() => RemoteError::Unavailable {
            operation,
            status: status.as_u16(),
            message,
        },
        status => RemoteError::Rejected {
            operation,
            status: status.as_u16(),
            message,
        },
    }
}

/// Parse a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are not supported and yield `None`, leaving the retry
/// policy's own backoff in charge.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn decode_body<T: DeserializeOwned>(
    operation: &str,
    body: &[u8],
) -> Result<T, RemoteError> {
    serde_json::from_slice(body).map_err(|err| RemoteError::Malformed {
        operation: operation.to_owned(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::SERVICE_UNAVAILABLE, true)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, true)]
    #[case(StatusCode::REQUEST_TIMEOUT, true)]
    #[case(StatusCode::UNAUTHORIZED, false)]
    #[case(StatusCode::NOT_FOUND, false)]
    #[case(StatusCode::UNPROCESSABLE_ENTITY, false)]
    fn statuses_are_classified(#[case] status: StatusCode, #[case] transient: bool) {
        let error = classify_status("fetch hub-checkouts", status, None, "nope");
        assert_eq!(error.is_transient(), transient, "{status}: {error:?}");
    }

    #[rstest]
    fn rate_limits_keep_the_requested_delay() {
        let error = classify_status(
            "fetch hub-checkouts",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(7)),
            "",
        );
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
    }

    #[rstest]
    fn rejections_carry_a_trimmed_body() {
        let body = format!("  {}  ", "x".repeat(2_000));
        let error = classify_status("count", StatusCode::FORBIDDEN, None, &body);
        match error {
            RemoteError::Rejected {
                status, message, ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(message.len(), MAX_ERROR_BODY_CHARS);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[rstest]
    #[case("120", Some(Duration::from_secs(120)))]
    #[case(" 3 ", Some(Duration::from_secs(3)))]
    #[case("Wed, 21 Oct 2015 07:28:00 GMT", None)]
    #[case("-1", None)]
    fn retry_after_accepts_seconds(#[case] header: &str, #[case] expected: Option<Duration>) {
        assert_eq!(parse_retry_after(header), expected);
    }

    #[rstest]
    fn undecodable_bodies_are_malformed() {
        let error =
            decode_body::<serde_json::Value>("count", b"<html>").expect_err("not JSON");
        assert!(matches!(error, RemoteError::Malformed { .. }));
    }

    #[rstest]
    #[case("ftp://core.example.com")]
    #[case("not a url")]
    #[case("mailto:ops@example.com")]
    fn unusable_base_urls_are_refused(#[case] base_url: &str) {
        let err = Transport::build(HttpClientConfig::new(base_url)).expect_err("refused");
        assert!(matches!(err, ClientBuildError::InvalidBaseUrl { .. }));
    }

    #[rstest]
    #[case("https://core.example.com", "https://core.example.com/api/hub-checkouts/count")]
    #[case("https://core.example.com/", "https://core.example.com/api/hub-checkouts/count")]
    #[case(
        "https://example.com/core/",
        "https://example.com/core/api/hub-checkouts/count"
    )]
    fn endpoints_extend_the_base_path(#[case] base_url: &str, #[case] expected: &str) {
        let transport = Transport::build(HttpClientConfig::new(base_url)).expect("transport");
        let url = transport
            .endpoint(["api", "hub-checkouts", "count"])
            .expect("endpoint");
        assert_eq!(url.as_str(), expected);
    }

    #[rstest]
    fn endpoint_segments_are_percent_encoded() {
        let transport =
            Transport::build(HttpClientConfig::new("https://blobs.example.com")).expect("transport");
        let url = transport
            .endpoint(["containers", "exports", "blobs", "2024/05/a b.csv", "properties"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://blobs.example.com/containers/exports/blobs/2024%2F05%2Fa%20b.csv/properties"
        );
    }
}
