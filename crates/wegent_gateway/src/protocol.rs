//! Socket wire protocol — envelope-based typed messaging.
//!
//! Every socket message is an [`Envelope`] whose `kind` selects how the
//! `payload` is interpreted. Room operations carry a `request_id` so replies
//! can be correlated; `chat:*` events carry the task id they belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // ── Room operations ─────────────────────────────────────────────
    /// Subscribe to a task's room, optionally requesting an incremental
    /// snapshot past a known message id.
    JoinTask,
    /// Server reply to `JoinTask`.
    JoinReply,
    /// Release a task's room subscription.
    LeaveTask,
    /// Server acknowledgement of `LeaveTask`.
    LeaveReply,

    // ── Keep-alive ──────────────────────────────────────────────────
    Ping,
    Pong,

    // ── Per-task chat events ────────────────────────────────────────
    #[serde(rename = "chat:start")]
    ChatStart,
    #[serde(rename = "chat:chunk")]
    ChatChunk,
    #[serde(rename = "chat:done")]
    ChatDone,
    #[serde(rename = "chat:error")]
    ChatError,
    #[serde(rename = "chat:cancelled")]
    ChatCancelled,
    #[serde(rename = "chat:message")]
    ChatMessage,
}

impl MessageKind {
    /// True for the six `chat:*` event kinds.
    pub fn is_chat_event(&self) -> bool {
        matches!(
            self,
            Self::ChatStart
                | Self::ChatChunk
                | Self::ChatDone
                | Self::ChatError
                | Self::ChatCancelled
                | Self::ChatMessage
        )
    }
}

/// A socket message envelope carrying a typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier (UUID v4).
    pub id: String,
    /// The kind/type of message.
    pub kind: MessageKind,
    /// Task this message concerns, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    /// Correlation id for request/reply pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The payload data (JSON value, interpreted based on `kind`).
    #[serde(default)]
    pub payload: Value,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create a new envelope of the given kind.
    pub fn new(kind: MessageKind, task_id: Option<i64>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            task_id,
            request_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Attach a correlation id for a request/reply pair.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Room operation payloads
// ---------------------------------------------------------------------------

/// Options for joining a task's room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    #[serde(default)]
    pub force_refresh: bool,
    /// When set, the server returns only subtasks with a greater message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_message_id: Option<i64>,
}

/// Server reply to a join: the snapshot plus any in-flight stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Subtask>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An in-flight assistant turn the server is currently producing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingInfo {
    pub subtask_id: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub cached_content: String,
}

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Who produced a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskRole {
    User,
    Assistant,
}

/// Server-side subtask status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One message turn as reported by a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: i64,
    pub role: SubtaskRole,
    pub status: SubtaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubtaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bots: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_name: Option<String>,
}

/// Structured result attached to an assistant subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Incremental reasoning delta on `chat:chunk`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Value>,
}

/// A typed fragment of an assistant reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Tool-call arguments / results and anything else the server attaches.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// What a [`Block`] contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    ToolUse,
    ToolResult,
}

/// A knowledge-base citation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Chat events
// ---------------------------------------------------------------------------

/// The closed sum of per-task live events.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Start {
        subtask_id: i64,
        shell_type: Option<String>,
    },
    Chunk {
        subtask_id: i64,
        content: String,
        result: Option<SubtaskResult>,
        sources: Option<Vec<Source>>,
        block_id: Option<String>,
    },
    Done {
        subtask_id: i64,
        content: Option<String>,
        result: Option<SubtaskResult>,
        message_id: Option<i64>,
        sources: Option<Vec<Source>>,
        has_error: bool,
        error_message: Option<String>,
    },
    Error {
        subtask_id: i64,
        error: String,
        message_id: Option<i64>,
    },
    Cancelled {
        subtask_id: i64,
    },
    /// A completed user message from a peer in a group chat.
    Message {
        subtask_id: i64,
        content: String,
        message_id: i64,
        sender_user_id: Option<i64>,
        sender_user_name: Option<String>,
        contexts: Vec<Value>,
    },
}

impl ChatEvent {
    /// The subtask this event concerns.
    pub fn subtask_id(&self) -> i64 {
        match self {
            Self::Start { subtask_id, .. }
            | Self::Chunk { subtask_id, .. }
            | Self::Done { subtask_id, .. }
            | Self::Error { subtask_id, .. }
            | Self::Cancelled { subtask_id }
            | Self::Message { subtask_id, .. } => *subtask_id,
        }
    }

    /// Parse a chat event from an envelope's kind and payload. Returns `None`
    /// for non-chat kinds and payloads missing required fields.
    pub fn parse(kind: &MessageKind, payload: Value) -> Option<Self> {
        match kind {
            MessageKind::ChatStart => {
                let p: StartPayload = serde_json::from_value(payload).ok()?;
                Some(Self::Start {
                    subtask_id: p.subtask_id,
                    shell_type: p.shell_type,
                })
            }
            MessageKind::ChatChunk => {
                let p: ChunkPayload = serde_json::from_value(payload).ok()?;
                Some(Self::Chunk {
                    subtask_id: p.subtask_id,
                    content: p.content,
                    result: p.result,
                    sources: p.sources,
                    block_id: p.block_id,
                })
            }
            MessageKind::ChatDone => {
                let p: DonePayload = serde_json::from_value(payload).ok()?;
                Some(Self::Done {
                    subtask_id: p.subtask_id,
                    content: p.content,
                    result: p.result,
                    message_id: p.message_id,
                    sources: p.sources,
                    has_error: p.has_error,
                    error_message: p.error_message,
                })
            }
            MessageKind::ChatError => {
                let p: ErrorPayload = serde_json::from_value(payload).ok()?;
                Some(Self::Error {
                    subtask_id: p.subtask_id,
                    error: p.error,
                    message_id: p.message_id,
                })
            }
            MessageKind::ChatCancelled => {
                let p: CancelledPayload = serde_json::from_value(payload).ok()?;
                Some(Self::Cancelled {
                    subtask_id: p.subtask_id,
                })
            }
            MessageKind::ChatMessage => {
                let p: PeerMessagePayload = serde_json::from_value(payload).ok()?;
                Some(Self::Message {
                    subtask_id: p.subtask_id,
                    content: p.content,
                    message_id: p.message_id,
                    sender_user_id: p.sender_user_id,
                    sender_user_name: p.sender_user_name,
                    contexts: p.contexts,
                })
            }
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct StartPayload {
    subtask_id: i64,
    #[serde(default)]
    shell_type: Option<String>,
}

#[derive(Deserialize)]
struct ChunkPayload {
    subtask_id: i64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    result: Option<SubtaskResult>,
    #[serde(default)]
    sources: Option<Vec<Source>>,
    #[serde(default)]
    block_id: Option<String>,
}

#[derive(Deserialize)]
struct DonePayload {
    subtask_id: i64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    result: Option<SubtaskResult>,
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    sources: Option<Vec<Source>>,
    #[serde(default)]
    has_error: bool,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    subtask_id: i64,
    error: String,
    #[serde(default)]
    message_id: Option<i64>,
}

#[derive(Deserialize)]
struct CancelledPayload {
    subtask_id: i64,
}

#[derive(Deserialize)]
struct PeerMessagePayload {
    subtask_id: i64,
    content: String,
    message_id: i64,
    #[serde(default)]
    sender_user_id: Option<i64>,
    #[serde(default)]
    sender_user_name: Option<String>,
    #[serde(default)]
    contexts: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
