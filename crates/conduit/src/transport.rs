use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Method};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::{ConduitError, ConduitResult};

pub type BodyStream = BoxStream<'static, ConduitResult<Bytes>>;

const MAX_ERROR_MESSAGE_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Deadline for the whole exchange, body included
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn post_json(url: String, headers: Vec<(String, String)>, body: &Value) -> ConduitResult<Self> {
        let body = serde_json::to_vec(body).map_err(|e| ConduitError::EncodeFailed(e.to_string()))?;
        let mut headers = headers;
        if !headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        Ok(HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: Bytes::from(body),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> ConduitResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body. Cancellation drops the reader and discards
    /// whatever was read so far.
    pub async fn bytes(mut self, cancel: &CancellationToken) -> ConduitResult<Bytes> {
        let mut buffer = BytesMut::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                next = self.body.next() => next,
            };
            match next {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => break,
            }
        }
        Ok(buffer.freeze())
    }
}

/// Executes HTTP exchanges for the dispatcher.
///
/// Implementations are shared by every concurrent request and must return
/// `ProviderError` for non-2xx statuses (see [`ensure_success`]).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
    ) -> ConduitResult<HttpResponse>;
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 16,
        }
    }
}

/// The pooled reqwest client shared across all requests of a process.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings) -> ConduitResult<Self> {
        // No client-wide timeout: it would also cut long-lived streams.
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(settings.pool_idle_timeout)
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()
            .map_err(|e| ConduitError::ConfigInvalid(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        cancel: &CancellationToken,
        request: HttpRequest,
    ) -> ConduitResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }

        let url = request.url.clone();
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
            response = builder.send() => response.map_err(|e| unreachable_error(&url, &e))?,
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| unreachable_error(&url, &e)))
            .boxed();

        ensure_success(
            HttpResponse {
                status,
                headers,
                body,
            },
            cancel,
        )
        .await
    }
}

fn unreachable_error(url: &str, error: &reqwest::Error) -> ConduitError {
    let message = if error.is_timeout() {
        format!("request timed out: {error}")
    } else {
        error.to_string()
    };
    ConduitError::ProviderUnreachable {
        url: url.to_string(),
        message,
    }
}

/// Turn a non-2xx response into `ProviderError`, reading the error body.
pub async fn ensure_success(
    response: HttpResponse,
    cancel: &CancellationToken,
) -> ConduitResult<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status;
    let body = match response.bytes(cancel).await {
        Ok(body) => error_body_message(&String::from_utf8_lossy(&body)),
        Err(ConduitError::Cancelled) => return Err(ConduitError::Cancelled),
        Err(error) => format!("unable to read error body: {error}"),
    };
    tracing::debug!(status, body = %body, "provider returned an error status");
    Err(ConduitError::ProviderError { status, body })
}

/// Reduce a provider error body to its message.
///
/// Understands `{"error": {"message": ..}}`, `{"error": ".."}` and
/// `{"message": ..}`; anything else is returned trimmed.
pub fn error_body_message(body: &str) -> String {
    let extracted = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        let message = match value.get("error") {
            Some(Value::String(message)) => Some(message.clone()),
            Some(error) => error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            None => value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        message.filter(|m| !m.trim().is_empty())
    });
    match extracted {
        Some(message) => truncate_message(message.trim()),
        None if body.trim().is_empty() => "empty error response from provider".to_string(),
        None => truncate_message(body.trim()),
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let prefix = message.chars().take(MAX_ERROR_MESSAGE_LEN).collect::<String>();
    format!("{prefix}...")
}
