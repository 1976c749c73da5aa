use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, redirect, Client, Response};
use tokio::time::{sleep, timeout};
use tracing::debug;
use url::Url;

use crate::error::{ContentModelError, Result};

/// Settings for downloading remote grammars.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout_seconds: u64,
    /// Retries after the first attempt
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Cap for the exponential backoff in milliseconds
    pub max_retry_delay_ms: u64,
    /// Redirects followed before giving up
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_redirects: 10,
            user_agent: format!("xml-content-model/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Body and validators of a downloaded resource.
#[derive(Debug, Clone, Default)]
pub struct FetchedResource {
    pub data: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Source of remote resources for the cache store.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<FetchedResource>;
}

#[derive(Debug)]
struct InsecureRedirectError {
    from: String,
    to: String,
}

impl fmt::Display for InsecureRedirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "refusing redirect from {} to {}", self.from, self.to)
    }
}

impl StdError for InsecureRedirectError {}

fn redirect_policy(max_redirects: usize) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error(format!("too many redirects (limit {max_redirects})"));
        }
        let downgrade = attempt.url().scheme() == "http"
            && attempt.previous().last().is_some_and(|p| p.scheme() == "https");
        if downgrade {
            let error = InsecureRedirectError {
                from: attempt
                    .previous()
                    .last()
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                to: attempt.url().to_string(),
            };
            return attempt.error(error);
        }
        attempt.follow()
    })
}

/// [`ResourceFetcher`] over HTTP(S) with retries and a redirect policy that
/// refuses HTTPS to HTTP downgrades.
pub struct AsyncHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl AsyncHttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .redirect(redirect_policy(config.max_redirects))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ContentModelError::from)?;

        Ok(Self { client, config })
    }

    /// Body and cache validators of `uri`. Only `http` and `https` are
    /// accepted.
    pub async fn download(&self, uri: &str) -> Result<FetchedResource> {
        check_protocol(uri)?;
        let response = self.get_response_with_retry(uri).await?;

        let header_value = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_value(header::ETAG);
        let last_modified = header_value(header::LAST_MODIFIED);
        let data = response
            .bytes()
            .await
            .map_err(|e| self.map_request_error(uri, e))?
            .to_vec();

        Ok(FetchedResource {
            data,
            etag,
            last_modified,
        })
    }

    /// GET with retries: 5xx answers and transient errors are retried, 4xx
    /// answers are final.
    async fn get_response_with_retry(&self, uri: &str) -> Result<Response> {
        let mut attempt = 0;
        loop {
            let (error, retryable) = match self.make_request(uri).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let error = ContentModelError::HttpStatus {
                        url: uri.to_string(),
                        status: status.as_u16(),
                        message: format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown")
                        ),
                    };
                    (error, status.is_server_error())
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    (error, retryable)
                }
            };

            if !retryable || attempt >= self.config.retry_attempts {
                return Err(error);
            }
            debug!(uri, attempt, error = %error, "Retrying download");
            self.wait_before_retry(attempt).await;
            attempt += 1;
        }
    }

    async fn make_request(&self, uri: &str) -> Result<Response> {
        let limit = Duration::from_secs(self.config.timeout_seconds);
        timeout(limit, self.client.get(uri).send())
            .await
            .map_err(|_| ContentModelError::Timeout {
                url: uri.to_string(),
                timeout_seconds: self.config.timeout_seconds,
            })?
            .map_err(|e| self.map_request_error(uri, e))
    }

    fn map_request_error(&self, uri: &str, error: reqwest::Error) -> ContentModelError {
        let mut source = error.source();
        while let Some(cause) = source {
            if let Some(insecure) = cause.downcast_ref::<InsecureRedirectError>() {
                return ContentModelError::InsecureRedirect {
                    uri: uri.to_string(),
                    target: insecure.to.clone(),
                };
            }
            source = cause.source();
        }
        ContentModelError::Http(error)
    }

    async fn wait_before_retry(&self, attempt: u32) {
        sleep(self.retry_delay(attempt)).await;
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.config.max_retry_delay_ms))
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

#[async_trait]
impl ResourceFetcher for AsyncHttpClient {
    async fn fetch(&self, uri: &str) -> Result<FetchedResource> {
        self.download(uri).await
    }
}

fn check_protocol(uri: &str) -> Result<()> {
    let url = Url::parse(uri).map_err(|e| ContentModelError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ContentModelError::UnsupportedProtocol {
            uri: uri.to_string(),
            protocol: other.to_string(),
        }),
    }
}
