//! In-memory transport for unit tests.
//!
//! Requests are answered by a routing closure; every request is recorded so
//! tests can assert on what went over the "wire". Streaming requests are
//! answered with the receiving half of a channel the test keeps feeding.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::{
    HttpRequest, HttpResponse, StreamResponse, Transport, TransportError,
};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Feeds one open log stream.
pub type ChunkSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

pub struct MockTransport {
    handler: Handler,
    latency: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
    stream_requests: Mutex<Vec<HttpRequest>>,
    streams: Mutex<VecDeque<Result<(u16, mpsc::UnboundedReceiver<Result<Bytes, TransportError>>), TransportError>>>,
    stream_opens: AtomicUsize,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: None,
            requests: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            stream_opens: AtomicUsize::new(0),
        }
    }

    /// Delay every `send` so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue the next stream `open_stream` will return. Returns the sender
    /// the test uses to push chunks; dropping it ends the stream.
    pub fn push_stream(&self, status: u16) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(Ok((status, rx)));
        tx
    }

    /// Queue a failed `open_stream` attempt.
    pub fn push_stream_error(&self, err: TransportError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stream_requests(&self) -> Vec<HttpRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    /// Number of recorded requests whose URL ends with `suffix` (query ignored).
    pub fn count(&self, suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url.split('?').next().unwrap_or("").ends_with(suffix))
            .count()
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(&request)
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        self.stream_requests.lock().unwrap().push(request);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(Ok((status, rx))) => {
                let body = futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed();
                Ok(StreamResponse { status, body })
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Connect("no stream scripted".into())),
        }
    }
}

pub fn json_response(status: u16, body: &Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        body: Bytes::from(body.to_string()),
    })
}

pub fn empty_response(status: u16) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status,
        body: Bytes::new(),
    })
}

/// Path of a request URL relative to the API root, without query string.
pub fn route(req: &HttpRequest) -> &str {
    let without_query = req.url.split('?').next().unwrap_or("");
    without_query
        .split_once("/v5/")
        .map_or(without_query, |(_, rest)| rest)
}

pub const API_ROOT: &str = "https://api.test/v5/";
