//! One streaming assistant turn.
//!
//! [`start_chat_turn`] POSTs the turn and returns a handle once response
//! headers arrive; the body is consumed by a background task. The first frame
//! resolves the real task id (replacing a client-temporary one), a frame with
//! `done=true` completes the turn exactly once, and [`cancel_chat`] uploads
//! the best-known partial content when the user aborts mid-stream.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::{ApiClient, ApiError};
use crate::sse::{ChatFrame, StreamEvent, drive_chat_stream};

const STREAM_PATH: &str = "/chat/stream";
const CANCEL_PATH: &str = "/chat/cancel";

/// Ceiling on a single streamed turn; matches the deep-research timeout.
const STREAM_TIMEOUT_SECS: u64 = 60 * 60;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Request / reply types
// ---------------------------------------------------------------------------

/// Body of the streaming turn request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatTurnRequest {
    pub message: String,
    pub team_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_override_bot_model: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

/// Reply from the cancel endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
struct CancelRequest {
    subtask_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_content: Option<String>,
}

// ---------------------------------------------------------------------------
// Turn events and handle
// ---------------------------------------------------------------------------

/// Events a streaming turn surfaces to the send-message flow.
#[derive(Debug)]
pub enum ChatTurnEvent {
    /// First frame arrived; the server assigned real ids.
    Resolved { task_id: i64, subtask_id: i64 },
    /// An incremental frame (content and/or structured result).
    Delta(ChatFrame),
    /// A frame carried `done=true`. Emitted exactly once.
    Completed { task_id: i64, subtask_id: i64 },
    /// Network failure, server-reported error, or premature end of body.
    Failed(String),
}

/// Handle to an in-flight streaming turn.
pub struct ChatTurnHandle {
    /// Turn events, in arrival order.
    pub events: mpsc::Receiver<ChatTurnEvent>,
    driver: JoinHandle<()>,
}

impl ChatTurnHandle {
    /// Stop reading the body. User-initiated; pairs with [`cancel_chat`].
    pub fn abort(&self) {
        self.driver.abort();
    }
}

impl Drop for ChatTurnHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Start a streaming turn. Returns once response headers arrive; the body is
/// consumed by a background task that forwards [`ChatTurnEvent`]s.
pub async fn start_chat_turn(
    client: &ApiClient,
    request: &ChatTurnRequest,
) -> Result<ChatTurnHandle, ApiError> {
    let mut req = client
        .http()
        .post(client.endpoint(STREAM_PATH))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .timeout(Duration::from_secs(STREAM_TIMEOUT_SECS))
        .json(request);
    if let Some(token) = client.bearer_token() {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(e.to_string())
        }
    })?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(client.handle_unauthorized());
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: text,
        });
    }

    let (frame_tx, frame_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let driver = tokio::spawn(async move {
        let reader = tokio::spawn(drive_chat_stream(resp, frame_tx));
        pump_turn_events(frame_rx, event_tx).await;
        reader.abort();
    });

    Ok(ChatTurnHandle {
        events: event_rx,
        driver,
    })
}

/// Cancel an in-flight turn, uploading the best-known partial content.
pub async fn cancel_chat(
    client: &ApiClient,
    subtask_id: i64,
    partial_content: Option<String>,
) -> Result<CancelReply, ApiError> {
    let body = CancelRequest {
        subtask_id,
        partial_content,
    };
    let reply: Option<CancelReply> = client.post(CANCEL_PATH, &body).await?;
    reply.ok_or_else(|| ApiError::Decode("empty cancel reply".into()))
}

// ---------------------------------------------------------------------------
// Frame → event translation
// ---------------------------------------------------------------------------

/// Translate raw stream events into turn events. Tracks the resolved ids,
/// guarantees at most one `Completed`, and stops at the first terminal event.
async fn pump_turn_events(
    mut frames: mpsc::Receiver<StreamEvent>,
    events: mpsc::Sender<ChatTurnEvent>,
) {
    let mut resolved: Option<(i64, i64)> = None;

    while let Some(event) = frames.recv().await {
        match event {
            StreamEvent::Frame(mut frame) => {
                if resolved.is_none() {
                    if let (Some(task_id), Some(subtask_id)) = (frame.task_id, frame.subtask_id) {
                        resolved = Some((task_id, subtask_id));
                        if events
                            .send(ChatTurnEvent::Resolved {
                                task_id,
                                subtask_id,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }

                if let Some(error) = frame.error.take() {
                    let _ = events.send(ChatTurnEvent::Failed(error)).await;
                    return;
                }

                if frame.done == Some(true) {
                    let (task_id, subtask_id) = match (resolved, frame.task_id, frame.subtask_id) {
                        (Some(ids), _, _) => ids,
                        (None, Some(t), Some(s)) => (t, s),
                        _ => {
                            debug!("Done frame without resolved ids; dropping turn");
                            let _ = events
                                .send(ChatTurnEvent::Failed(
                                    "stream completed before ids were resolved".into(),
                                ))
                                .await;
                            return;
                        }
                    };
                    let _ = events
                        .send(ChatTurnEvent::Completed {
                            task_id,
                            subtask_id,
                        })
                        .await;
                    return;
                }

                if events.send(ChatTurnEvent::Delta(frame)).await.is_err() {
                    return;
                }
            }
            StreamEvent::StreamError(e) => {
                let _ = events.send(ChatTurnEvent::Failed(e)).await;
                return;
            }
            StreamEvent::Closed => {
                let _ = events
                    .send(ChatTurnEvent::Failed(
                        "stream ended before completion".into(),
                    ))
                    .await;
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> StreamEvent {
        StreamEvent::Frame(serde_json::from_str::<ChatFrame>(json).unwrap())
    }

    async fn collect(events: Vec<StreamEvent>) -> Vec<ChatTurnEvent> {
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        for event in events {
            frame_tx.send(event).await.unwrap();
        }
        drop(frame_tx);

        pump_turn_events(frame_rx, event_tx).await;

        let mut out = Vec::new();
        while let Some(e) = event_rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn happy_path_resolves_then_completes_once() {
        let out = collect(vec![
            frame(r#"{"task_id":42,"subtask_id":100,"content":""}"#),
            frame(r#"{"content":"He"}"#),
            frame(r#"{"content":"llo"}"#),
            frame(r#"{"done":true}"#),
        ])
        .await;

        assert!(matches!(
            out[0],
            ChatTurnEvent::Resolved { task_id: 42, subtask_id: 100 }
        ));
        let deltas = out
            .iter()
            .filter(|e| matches!(e, ChatTurnEvent::Delta(_)))
            .count();
        assert_eq!(deltas, 3);
        assert!(matches!(
            out.last(),
            Some(ChatTurnEvent::Completed { task_id: 42, subtask_id: 100 })
        ));
        let completions = out
            .iter()
            .filter(|e| matches!(e, ChatTurnEvent::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn error_frame_fails_the_turn() {
        let out = collect(vec![
            frame(r#"{"task_id":42,"subtask_id":100}"#),
            frame(r#"{"error":"model exploded"}"#),
            frame(r#"{"content":"never delivered"}"#),
        ])
        .await;

        assert!(matches!(out.last(), Some(ChatTurnEvent::Failed(msg)) if msg == "model exploded"));
        // Nothing after the terminal event.
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn premature_close_fails_the_turn() {
        let out = collect(vec![
            frame(r#"{"task_id":42,"subtask_id":100}"#),
            frame(r#"{"content":"He"}"#),
            StreamEvent::Closed,
        ])
        .await;

        assert!(matches!(out.last(), Some(ChatTurnEvent::Failed(_))));
    }

    #[tokio::test]
    async fn read_error_fails_the_turn() {
        let out = collect(vec![
            frame(r#"{"task_id":42,"subtask_id":100}"#),
            StreamEvent::StreamError("connection reset".into()),
        ])
        .await;

        assert!(matches!(out.last(), Some(ChatTurnEvent::Failed(msg)) if msg == "connection reset"));
    }

    #[tokio::test]
    async fn done_frame_may_carry_its_own_ids() {
        // Page-refresh recovery: the only frame seen is the finalizer.
        let out = collect(vec![frame(r#"{"task_id":7,"subtask_id":9,"done":true}"#)]).await;

        assert!(matches!(
            out[0],
            ChatTurnEvent::Resolved { task_id: 7, subtask_id: 9 }
        ));
        assert!(matches!(
            out[1],
            ChatTurnEvent::Completed { task_id: 7, subtask_id: 9 }
        ));
    }

    #[test]
    fn request_serialization_omits_unset_fields() {
        let request = ChatTurnRequest {
            message: "hi".into(),
            team_id: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["message"], "hi");
        assert_eq!(json["team_id"], 3);
        assert!(json.get("task_id").is_none());
        assert!(json.get("git_url").is_none());
    }

    #[test]
    fn request_serialization_includes_overrides() {
        let request = ChatTurnRequest {
            message: "hi".into(),
            team_id: 3,
            task_id: Some(42),
            model_id: Some(5),
            force_override_bot_model: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["task_id"], 42);
        assert_eq!(json["model_id"], 5);
        assert_eq!(json["force_override_bot_model"], true);
    }
}
