//! Incremental parser for the server-sent-events log stream.
//!
//! Bytes are appended to an internal buffer as they arrive. A record is
//! emitted only once its terminating blank line (`\n\n`, `\r\r` or
//! `\r\n\r\n`) has been seen; anything after the last separator stays
//! buffered for the next chunk.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

const SEPARATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

/// Kind of record, from the `event:` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Message,
    StateChange,
    Error,
}

impl EventType {
    fn from_name(name: &str) -> Self {
        match name {
            "state_change" | "statechange" | "state" => Self::StateChange,
            "error" => Self::Error,
            _ => Self::Message,
        }
    }
}

/// Connection state of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: Option<String>,
    pub event_type: EventType,
    pub data: String,
    pub state: StreamState,
}

#[derive(Debug, Default)]
pub struct EventParser {
    buffer: BytesMut,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the most recent record that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnect interval requested by the server, if any.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Discard buffered partial input. The last event id and retry hint are
    /// kept so a reconnect can resume.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Append `chunk` and return every record it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<EventRecord> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some((pos, sep_len)) = find_separator(&self.buffer) {
            let block = self.buffer.split_to(pos);
            self.buffer.advance(sep_len);

            match std::str::from_utf8(&block) {
                Ok(text) => {
                    if let Some(record) = self.parse_block(text) {
                        records.push(record);
                    }
                }
                Err(e) => warn!(error = %e, "dropping log stream record with invalid UTF-8"),
            }
        }
        records
    }

    fn parse_block(&mut self, block: &str) -> Option<EventRecord> {
        let mut data: Option<String> = None;
        let mut id = None;
        let mut event_type = EventType::Message;

        for line in split_lines(block) {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match key {
                "data" => match data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                "id" => {
                    self.last_event_id = Some(value.to_string());
                    id = Some(value.to_string());
                }
                "event" => event_type = EventType::from_name(value),
                "retry" => match value.trim().parse::<u64>() {
                    Ok(ms) => self.retry = Some(Duration::from_millis(ms)),
                    Err(_) => debug!(value, "ignoring non-numeric retry field"),
                },
                _ => {}
            }
        }

        let data = data?;
        Some(EventRecord {
            id,
            event_type,
            data,
            state: StreamState::Open,
        })
    }
}

/// Earliest record separator: `(offset, length)`.
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    SEPARATORS
        .iter()
        .filter_map(|sep| {
            buf.windows(sep.len())
                .position(|w| w == *sep)
                .map(|pos| (pos, sep.len()))
        })
        .min_by_key(|&(pos, len)| (pos, std::cmp::Reverse(len)))
}

/// Split on `\r\n`, `\n` or `\r`.
fn split_lines(block: &str) -> impl Iterator<Item = &str> {
    block.split('\n').flat_map(|line| {
        let line = line.strip_suffix('\r').unwrap_or(line);
        line.split('\r')
    })
}
