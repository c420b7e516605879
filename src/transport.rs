//! HTTP transport boundary.
//!
//! [`Transport`] is the seam between the client core and the network: it
//! takes a fully built [`HttpRequest`] and hands back either a buffered
//! [`HttpResponse`] or, for the log stream, a [`StreamResponse`] whose body
//! arrives incrementally. [`HttpTransport`] is the production implementation
//! on top of `reqwest`; tests substitute an in-memory transport.
//!
//! ## Error handling
//!
//! Only failures that prevent an HTTP response (DNS, connect, timeout,
//! reset) are [`TransportError`]s. Any status code, including 4xx/5xx, is a
//! successful transport result and is classified by the caller.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::ClientError;

/// Incremental response body of a streaming request.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A request ready to be sent.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// First header value with the given (case-insensitive) name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A response whose body is still arriving.
pub struct StreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

/// Transport-level failure: no HTTP response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
    /// An open stream was reset or ended abnormally.
    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Stream(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Issues HTTP requests on behalf of the client core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and buffer the whole response body.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Send a request and return as soon as headers arrive; the body is
    /// delivered chunk by chunk.
    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError>;
}

/// `reqwest`-backed transport.
///
/// Two clients are kept: REST calls get a whole-request timeout, the log
/// stream only a connect timeout (the stream is expected to stay open).
pub struct HttpTransport {
    http: reqwest::Client,
    streaming: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        let streaming = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, streaming })
    }

    fn build(client: &reqwest::Client, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body.to_string());
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let resp = Self::build(&self.http, request).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok(HttpResponse { status, body })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        let resp = Self::build(&self.streaming, request).send().await?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(StreamResponse { status, body })
    }
}
