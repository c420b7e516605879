//! Shared device log stream with auto-reconnect.
//!
//! [`LogStreamClient`] keeps one server-side log stream for every subscribed
//! device. A background worker owns the connection, the subscription map and
//! the [`EventParser`]; callers talk to it over a command channel, so all
//! mutation happens on one task and records are delivered in the order the
//! server sent them.
//!
//! Stream lifecycle:
//!
//! 1. The first `subscribe` creates a stream (`POST logstream`) and opens its
//!    URL as `text/event-stream`.
//! 2. Each device is attached with `PUT logstream/{stream}/{device}`.
//! 3. When the connection drops, errors, or is silent for the idle timeout,
//!    it is reopened after the retry interval with `Last-Event-ID` set. Every
//!    failed attempt re-arms the same interval.
//! 4. If the server refuses to reopen the stream, a new stream is created
//!    and all subscribed devices are re-attached.
//! 5. Removing the last device closes the stream; nothing is rescheduled.

mod parser;

pub use parser::{EventParser, EventRecord, EventType, StreamState};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LogStreamConfig;
use crate::connection::ConnectionManager;
use crate::error::{AuthError, ClientError};
use crate::request::Action;
use crate::session::{SessionManager, SessionState};
use crate::transport::{ByteStream, HttpRequest, Transport, TransportError};

/// Receives the log entries of one device.
pub type LogHandler = Arc<dyn Fn(LogEntry) + Send + Sync>;

/// Notified whenever the stream connection changes state.
pub type StateCallback = Arc<dyn Fn(StreamState) + Send + Sync>;

/// One device log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub device_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Source of the line, e.g. `server.log` or `agent.error`.
    pub log_type: String,
    pub message: String,
    pub event_id: Option<String>,
}

impl LogEntry {
    /// Decode the `data` payload of a message record.
    ///
    /// Accepts a JSON object (`device`, `ts`, `type`, `msg`) or the plain
    /// `<device> <timestamp> <type> <message>` line format.
    pub fn parse(data: &str) -> Result<Self, ClientError> {
        let data = data.trim();
        if data.starts_with('{') {
            let v: Value = serde_json::from_str(data)
                .map_err(|e| ClientError::Parse(format!("invalid log entry JSON: {e}")))?;
            let device_id = v["device"]
                .as_str()
                .or_else(|| v["device_id"].as_str())
                .ok_or_else(|| ClientError::Parse("log entry has no device".into()))?;
            return Ok(Self {
                device_id: device_id.to_string(),
                timestamp: v["ts"].as_str().and_then(parse_timestamp),
                log_type: v["type"].as_str().unwrap_or_default().to_string(),
                message: v["msg"].as_str().unwrap_or_default().to_string(),
                event_id: None,
            });
        }

        let mut parts = data.splitn(4, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(ts), Some(log_type)) if !device.is_empty() => Ok(Self {
                device_id: device.to_string(),
                timestamp: parse_timestamp(ts),
                log_type: log_type.to_string(),
                message: parts.next().unwrap_or_default().to_string(),
                event_id: None,
            }),
            _ => Err(ClientError::Parse(format!("unrecognized log entry: {data}"))),
        }
    }
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Per-device subscription state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSubscription {
    pub device_id: String,
    /// Id of the last record delivered to this device.
    pub last_event_id: Option<String>,
}

/// Snapshot of the stream, published after every worker step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: StreamState,
    pub stream_id: Option<String>,
    pub devices: Vec<String>,
    pub reconnect_pending: bool,
}

impl StreamStatus {
    pub fn connected(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn subscriptions(&self) -> usize {
        self.devices.len()
    }
}

enum Command {
    Subscribe {
        device_id: String,
        handler: LogHandler,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Unsubscribe {
        device_id: String,
        reply: oneshot::Sender<Result<bool, ClientError>>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the log stream worker. Dropping it stops the worker.
pub struct LogStreamClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<StreamStatus>,
}

impl LogStreamClient {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub fn start(
        connections: Arc<ConnectionManager>,
        session: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        config: &LogStreamConfig,
        on_state: Option<StateCallback>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(StreamStatus::default());

        let worker = StreamWorker {
            connections,
            session,
            transport,
            idle_timeout: config.idle_timeout(),
            default_retry: config.retry_interval(),
            max_devices: config.max_devices,
            subscriptions: HashMap::new(),
            stream: None,
            body: None,
            idle_deadline: Instant::now(),
            parser: EventParser::new(),
            reconnect_at: None,
            state: StreamState::Closed,
            on_state,
            status: status_tx,
        };
        tokio::spawn(worker.run(command_rx));

        Self { commands, status }
    }

    /// Start delivering `device_id`'s logs to `handler`. Re-subscribing a
    /// device replaces its handler.
    pub async fn subscribe<F>(&self, device_id: impl Into<String>, handler: F) -> Result<(), ClientError>
    where
        F: Fn(LogEntry) + Send + Sync + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            device_id: device_id.into(),
            handler: Arc::new(handler),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::StreamClosed)?
    }

    /// Stop logging `device_id`. Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, device_id: impl Into<String>) -> Result<bool, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            device_id: device_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::StreamClosed)?
    }

    /// Drop every subscription and close the stream without telling the
    /// server. The client stays usable for new subscriptions.
    pub async fn stop_all(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::StopAll { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drop every subscription and stop the worker. No reconnect follows.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.status.borrow().devices.iter().any(|d| d == device_id)
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::StreamClosed)
    }
}

#[derive(Debug, Clone)]
struct StreamHandle {
    id: String,
    url: String,
}

struct Subscriber {
    subscription: LogSubscription,
    handler: LogHandler,
}

enum StreamEvent {
    Chunk(Bytes),
    Failed(TransportError),
    Ended,
    Idle,
}

enum OpenOutcome {
    Opened,
    /// Failure already handled: a reconnect is armed or the stream is closed.
    Deferred,
    /// The server answered the open request with this HTTP status.
    Rejected(u16),
}

struct StreamWorker {
    connections: Arc<ConnectionManager>,
    session: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    idle_timeout: Duration,
    default_retry: Duration,
    max_devices: usize,
    subscriptions: HashMap<String, Subscriber>,
    stream: Option<StreamHandle>,
    body: Option<ByteStream>,
    idle_deadline: Instant,
    parser: EventParser,
    reconnect_at: Option<Instant>,
    state: StreamState,
    on_state: Option<StateCallback>,
    status: watch::Sender<StreamStatus>,
}

impl StreamWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let reconnect_at = self.reconnect_at;
            let idle_deadline = self.idle_deadline;

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Subscribe { device_id, handler, reply }) => {
                        let result = self.subscribe(device_id, handler).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Unsubscribe { device_id, reply }) => {
                        let result = self.unsubscribe(&device_id).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::StopAll { reply }) => {
                        self.shutdown();
                        self.publish();
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        self.publish();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown();
                        self.publish();
                        return;
                    }
                },
                event = next_event(self.body.as_mut(), idle_deadline), if self.body.is_some() => {
                    self.on_stream_event(event);
                }
                () = wait_until(reconnect_at), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }

            self.publish();
        }
    }

    async fn subscribe(&mut self, device_id: String, handler: LogHandler) -> Result<(), ClientError> {
        if let Some(existing) = self.subscriptions.get_mut(&device_id) {
            existing.handler = handler;
            return Ok(());
        }
        if self.subscriptions.len() >= self.max_devices {
            return Err(ClientError::TooManyStreams {
                limit: self.max_devices,
            });
        }

        if self.stream.is_none() {
            let stream = create_stream(&self.connections).await?;
            self.parser = EventParser::new();
            self.stream = Some(stream);
        }
        if self.body.is_none() && self.reconnect_at.is_none() {
            self.connect().await;
            if self.stream.is_none() {
                return Err(self.session_error());
            }
        }
        if self.body.is_some() {
            if let Some(stream) = self.stream.clone() {
                if let Err(e) = attach(&self.connections, &stream, &device_id).await {
                    warn!(device = %device_id, error = %e, "failed to attach device to log stream");
                    if self.subscriptions.is_empty() {
                        self.close();
                    }
                    return Err(e);
                }
            }
        }

        info!(device = %device_id, "device log subscribed");
        self.subscriptions.insert(
            device_id.clone(),
            Subscriber {
                subscription: LogSubscription {
                    device_id,
                    last_event_id: None,
                },
                handler,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&mut self, device_id: &str) -> Result<bool, ClientError> {
        if self.subscriptions.remove(device_id).is_none() {
            return Ok(false);
        }
        info!(device = %device_id, "device log unsubscribed");

        if self.body.is_some() {
            if let Some(stream) = &self.stream {
                let path = format!("logstream/{}/{device_id}", stream.id);
                if let Err(e) = self
                    .connections
                    .request(Method::DELETE, &path, None, Action::RemoveFromLogStream)
                    .await
                {
                    warn!(device = %device_id, error = %e, "failed to remove device from log stream");
                }
            }
        }

        if self.subscriptions.is_empty() {
            self.close();
        }
        Ok(true)
    }

    /// Why the session stopped serving the stream.
    fn session_error(&self) -> ClientError {
        match self.session.state() {
            SessionState::LoggedOut(Some(reason)) => reason.into(),
            _ => AuthError::NotLoggedIn.into(),
        }
    }

    fn shutdown(&mut self) {
        self.subscriptions.clear();
        self.close();
    }

    /// Tear the stream down without scheduling a reconnect.
    fn close(&mut self) {
        if self.stream.is_some() || self.reconnect_at.is_some() {
            info!("log stream closed");
        }
        self.body = None;
        self.reconnect_at = None;
        self.stream = None;
        self.parser = EventParser::new();
        self.set_state(StreamState::Closed);
    }

    /// Open the stream, creating a replacement if the server refuses the
    /// current one, then re-attach every subscribed device.
    async fn connect(&mut self) {
        let outcome = match self.open().await {
            OpenOutcome::Rejected(status) => {
                warn!(status, "log stream rejected; creating a new stream");
                match create_stream(&self.connections).await {
                    Ok(stream) => {
                        self.stream = Some(stream);
                        self.parser = EventParser::new();
                        self.open().await
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to create log stream");
                        self.schedule_reconnect();
                        return;
                    }
                }
            }
            other => other,
        };

        match outcome {
            OpenOutcome::Opened => self.attach_all().await,
            OpenOutcome::Rejected(status) => {
                warn!(status, "new log stream rejected");
                self.schedule_reconnect();
            }
            OpenOutcome::Deferred => {}
        }
    }

    async fn open(&mut self) -> OpenOutcome {
        let Some(stream) = self.stream.clone() else {
            return OpenOutcome::Deferred;
        };
        self.set_state(StreamState::Connecting);

        let token = match self.session.valid_token().await {
            Ok(token) => token,
            Err(e) if e.is_session_fatal() => {
                warn!(error = %e, "session ended; closing log stream");
                self.shutdown();
                return OpenOutcome::Deferred;
            }
            Err(e) => {
                warn!(error = %e, "no token for log stream");
                self.schedule_reconnect();
                return OpenOutcome::Deferred;
            }
        };

        let mut req = HttpRequest::new(Method::GET, stream.url.as_str())
            .header("Authorization", token.bearer())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(id) = self.parser.last_event_id() {
            req = req.header("Last-Event-ID", id);
        }

        debug!(stream_id = %stream.id, last_event_id = ?self.parser.last_event_id(), "opening log stream");
        match self.transport.open_stream(req).await {
            Ok(resp) if (200..300).contains(&resp.status) => {
                info!(stream_id = %stream.id, "log stream open");
                self.parser.reset();
                self.body = Some(resp.body);
                self.idle_deadline = Instant::now() + self.idle_timeout;
                self.set_state(StreamState::Open);
                OpenOutcome::Opened
            }
            Ok(resp) if resp.status == 401 => {
                if let Err(e) = self.session.force_refresh(&token).await {
                    if e.is_session_fatal() {
                        warn!(error = %e, "session ended; closing log stream");
                        self.shutdown();
                        return OpenOutcome::Deferred;
                    }
                }
                self.schedule_reconnect();
                OpenOutcome::Deferred
            }
            Ok(resp) => OpenOutcome::Rejected(resp.status),
            Err(e) => {
                warn!(error = %e, "log stream connect failed");
                self.schedule_reconnect();
                OpenOutcome::Deferred
            }
        }
    }

    async fn attach_all(&mut self) {
        let Some(stream) = self.stream.clone() else { return };
        let connections = Arc::clone(&self.connections);
        let devices: Vec<String> = self.subscriptions.keys().cloned().collect();
        for device_id in devices {
            if let Err(e) = attach(&connections, &stream, &device_id).await {
                warn!(device = %device_id, error = %e, "failed to re-attach device to log stream");
            }
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Chunk(chunk) => {
                self.idle_deadline = Instant::now() + self.idle_timeout;
                for record in self.parser.feed(&chunk) {
                    self.deliver(record);
                }
            }
            StreamEvent::Failed(e) => {
                warn!(error = %e, "log stream error");
                self.connection_lost();
            }
            StreamEvent::Ended => {
                info!("log stream ended by server");
                self.connection_lost();
            }
            StreamEvent::Idle => {
                warn!(timeout_secs = self.idle_timeout.as_secs(), "log stream idle; reconnecting");
                self.connection_lost();
            }
        }
    }

    fn deliver(&mut self, record: EventRecord) {
        match record.event_type {
            EventType::Message => {
                let mut entry = match LogEntry::parse(&record.data) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed log record");
                        return;
                    }
                };
                match self.subscriptions.get_mut(&entry.device_id) {
                    Some(subscriber) => {
                        subscriber.subscription.last_event_id = record.id.clone();
                        entry.event_id = record.id;
                        (subscriber.handler)(entry);
                    }
                    None => debug!(device = %entry.device_id, "dropping log record for unsubscribed device"),
                }
            }
            EventType::StateChange => debug!(data = %record.data, "log stream state change"),
            EventType::Error => warn!(data = %record.data, "log stream reported an error"),
        }
    }

    fn connection_lost(&mut self) {
        self.body = None;
        self.parser.reset();
        if self.subscriptions.is_empty() {
            self.close();
        } else {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.parser.retry().unwrap_or(self.default_retry);
        debug!(delay_ms = delay.as_millis() as u64, "log stream reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(StreamState::Closed);
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(callback) = &self.on_state {
            callback(state);
        }
    }

    fn publish(&self) {
        let mut devices: Vec<String> = self.subscriptions.keys().cloned().collect();
        devices.sort();
        self.status.send_replace(StreamStatus {
            state: self.state,
            stream_id: self.stream.as_ref().map(|s| s.id.clone()),
            devices,
            reconnect_pending: self.reconnect_at.is_some(),
        });
    }
}

async fn create_stream(connections: &Arc<ConnectionManager>) -> Result<StreamHandle, ClientError> {
    let resp = connections
        .request(Method::POST, "logstream", None, Action::CreateLogStream)
        .await?;
    let id = resp["data"]["id"]
        .as_str()
        .ok_or_else(|| ClientError::Parse("log stream response has no id".into()))?;
    let url = resp["data"]["attributes"]["url"]
        .as_str()
        .ok_or_else(|| ClientError::Parse("log stream response has no url".into()))?;
    info!(stream_id = %id, "log stream created");
    Ok(StreamHandle {
        id: id.to_string(),
        url: url.to_string(),
    })
}

async fn attach(
    connections: &Arc<ConnectionManager>,
    stream: &StreamHandle,
    device_id: &str,
) -> Result<(), ClientError> {
    let path = format!("logstream/{}/{device_id}", stream.id);
    connections
        .request(Method::PUT, &path, None, Action::AddToLogStream)
        .await
        .map(|_| ())
}

async fn next_event(body: Option<&mut ByteStream>, deadline: Instant) -> StreamEvent {
    let Some(body) = body else {
        return std::future::pending().await;
    };
    match tokio::time::timeout_at(deadline, body.next()).await {
        Ok(Some(Ok(chunk))) => StreamEvent::Chunk(chunk),
        Ok(Some(Err(e))) => StreamEvent::Failed(e),
        Ok(None) => StreamEvent::Ended,
        Err(_) => StreamEvent::Idle,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
