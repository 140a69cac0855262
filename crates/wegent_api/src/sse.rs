//! SSE parsing for the streaming chat endpoint.
//!
//! The chat turn endpoint answers with an event-stream-shaped body:
//!
//! ```text
//! data: {"task_id":42,"subtask_id":100,"content":""}
//! data: {"content":"He"}
//! data: {"content":"llo"}
//! data: {"done":true}
//! data: [DONE]
//! ```
//!
//! This module provides the frame types, a line parser, and a driver that
//! consumes a `reqwest::Response` body and forwards [`StreamEvent`]s over an
//! mpsc channel.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One parsed `data:` frame. The first frame of a turn is guaranteed to
/// carry `task_id` and `subtask_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub subtask_id: Option<i64>,
    #[serde(default)]
    pub result: Option<FrameResult>,
}

/// Structured payload piggybacked on a frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameResult {
    #[serde(default)]
    pub value: Option<String>,
}

/// Events emitted by the stream driver.
#[derive(Debug)]
pub enum StreamEvent {
    /// A parsed frame.
    Frame(ChatFrame),
    /// The underlying read failed (network error, connection reset).
    StreamError(String),
    /// The body ended.
    Closed,
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// Parse one line of the event stream. Returns `None` for non-`data:` lines,
/// the `[DONE]` sentinel, and malformed JSON (all are skipped).
pub(crate) fn parse_frame_line(line: &str) -> Option<ChatFrame> {
    let data = line.trim().strip_prefix("data: ")?;

    // Terminal sentinel carries no payload.
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<ChatFrame>(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Skipping malformed stream frame: {e} -- data: {data}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Stream driver
// ---------------------------------------------------------------------------

/// Consume a `reqwest::Response` with an SSE-framed body and forward parsed
/// frames on the given `tx` channel. Partial lines are retained across reads.
///
/// This function is meant to be spawned via `tokio::spawn`.
pub(crate) async fn drive_chat_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                warn!("Chat stream read error: {e}");
                let _ = tx.send(StreamEvent::StreamError(e.to_string())).await;
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));

        // Process complete lines; an incomplete tail stays buffered.
        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].to_owned();
            buffer.drain(..=newline_pos);

            if let Some(frame) = parse_frame_line(&line) {
                if tx.send(StreamEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
        }
    }

    // Flush a final unterminated line, then signal the end of the body.
    if let Some(frame) = parse_frame_line(&buffer) {
        let _ = tx.send(StreamEvent::Frame(frame)).await;
    }
    let _ = tx.send(StreamEvent::Closed).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
