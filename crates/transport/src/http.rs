use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use super::error::{
    AbortedSnafu, HttpClientSnafu, ReadBodySnafu, SendRequestSnafu, StatusSnafu, TransportResult,
};
use super::reader::TransportReader;
use super::request::{ChatRequest, Endpoint};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_COMPLETION_PATH: &str = "/api/openai-stream";
pub const DEFAULT_CHAIN_PATH: &str = "/api/chains";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens one streamed exchange. The returned reader is bound to `cancel`.
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    fn open<'a>(
        &'a self,
        request: &'a ChatRequest,
        endpoint: &'a Endpoint,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<TransportReader>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub completion_path: String,
    pub chain_path: String,
    pub connect_timeout: Option<Duration>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            completion_path: DEFAULT_COMPLETION_PATH.to_string(),
            chain_path: DEFAULT_CHAIN_PATH.to_string(),
            connect_timeout: None,
        }
    }

    pub fn with_completion_path(mut self, path: impl Into<String>) -> Self {
        self.completion_path = path.into();
        self
    }

    pub fn with_chain_path(mut self, path: impl Into<String>) -> Self {
        self.chain_path = path.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn endpoint_url(&self, endpoint: &Endpoint) -> String {
        let base = self.base_url.trim_end_matches('/');
        match endpoint {
            Endpoint::Completion => {
                format!("{base}/{}", self.completion_path.trim_matches('/'))
            }
            Endpoint::Chain { user_id } => format!(
                "{base}/{}/{}",
                self.chain_path.trim_matches('/'),
                user_id.trim_matches('/')
            ),
        }
    }
}

/// reqwest-backed transport reading the response body as a raw octet stream.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let client = builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    async fn open_stream(
        &self,
        request: &ChatRequest,
        endpoint: &Endpoint,
        cancel: CancellationToken,
    ) -> TransportResult<TransportReader> {
        let url = self.config.endpoint_url(endpoint);
        let pending = self.client.post(&url).json(request).send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(url = %url, "request cancelled before response headers");
                return AbortedSnafu { stage: "send-request" }.fail();
            }
            response = pending => response.context(SendRequestSnafu {
                stage: "send-request",
                url: url.clone(),
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(error) => {
                    tracing::debug!(url = %url, error = %error, "failed to read error body");
                    String::new()
                }
            };
            tracing::warn!(
                url = %url,
                status = status.as_u16(),
                "streaming endpoint rejected request"
            );
            return StatusSnafu {
                stage: "response-status",
                url,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        tracing::debug!(url = %url, "streaming response opened");

        let body = response.bytes_stream().map(|item| {
            item.map(|bytes| bytes.to_vec()).context(ReadBodySnafu {
                stage: "read-body-chunk",
            })
        });

        Ok(TransportReader::from_stream(body, cancel))
    }
}

impl ChatTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn open<'a>(
        &'a self,
        request: &'a ChatRequest,
        endpoint: &'a Endpoint,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<TransportReader>> {
        Box::pin(self.open_stream(request, endpoint, cancel))
    }
}
