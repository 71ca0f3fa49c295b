//! Production channel transport: server-sent events over HTTP.
//!
//! One spawned reader task per channel instance. The task GETs the events
//! URL, signals `opened` once the stream responds, parses SSE frames
//! incrementally, and signals `failed` when the stream errors or ends.
//! Closing the handle cancels the task.

use futures::StreamExt;
use reqwest::header::ACCEPT;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::{ChannelHandle, ChannelSink, ChannelTransport};
use super::protocol::UpdateEvent;

pub struct SseTransport {
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

struct SseHandle {
    cancel: CancellationToken,
}

impl ChannelHandle for SseHandle {
    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl ChannelTransport for SseTransport {
    fn open(&self, url: &str, sink: ChannelSink) -> Box<dyn ChannelHandle> {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let client = self.client.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = run_stream(client, url, sink) => {}
            }
        });
        Box::new(SseHandle { cancel })
    }
}

async fn run_stream(client: reqwest::Client, url: String, sink: ChannelSink) {
    let response = match client
        .get(&url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!(status = %response.status(), "event stream rejected");
            sink.failed();
            return;
        }
        Err(err) => {
            debug!(error = %err, "event stream connect failed");
            sink.failed();
            return;
        }
    };

    sink.opened();

    let mut parser = FrameParser::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in parser.push(&bytes) {
                    if let Some(event) =
                        UpdateEvent::from_wire(&frame.event, frame.id, &frame.data)
                    {
                        sink.event(event);
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "event stream read error");
                break;
            }
        }
    }
    // Stream ended: the server closed it or the read failed. Either way the
    // manager decides whether to reconnect.
    sink.failed();
}

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    event: String,
    id: Option<String>,
    data: String,
}

/// Incremental SSE parser: feed byte chunks, get completed frames.
///
/// Follows the event-stream format: `event:`, `id:` and `data:` fields, `:`
/// comment lines ignored, frames terminated by a blank line, multi-line
/// data joined with newlines.
struct FrameParser {
    buffer: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl FrameParser {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            event: None,
            id: None,
            data: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.take_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn take_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<Frame> {
        if self.event.is_none() && self.id.is_none() && self.data.is_empty() {
            return None;
        }
        let frame = Frame {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            id: self.id.take(),
            data: self.data.drain(..).collect::<Vec<_>>().join("\n"),
        };
        Some(frame)
    }
}
