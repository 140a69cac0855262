//! The message model.
//!
//! Messages are a tagged sum over `{user, ai}` with a small shared header.
//! Display order is defined by the server-assigned `message_id` serial;
//! messages the server has not committed yet sort after all committed ones,
//! in local-timestamp order, which keeps optimistic sends at the tail.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use wegent_gateway::protocol::{Block, BlockKind, Source, SubtaskResult, SubtaskState};

// ---------------------------------------------------------------------------
// Slot keys
// ---------------------------------------------------------------------------

/// Key of a user message acknowledged by the server.
pub fn user_slot_key(subtask_id: i64) -> String {
    format!("user-backend-{subtask_id}")
}

/// Key of an assistant message.
pub fn ai_slot_key(subtask_id: i64) -> String {
    format!("ai-{subtask_id}")
}

/// Fresh key for an optimistic user message not yet acknowledged.
pub fn local_user_key() -> String {
    format!("user-{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Client-side message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Error,
}

impl MessageStatus {
    /// Terminal messages only accept idempotent updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

// ---------------------------------------------------------------------------
// Message variants
// ---------------------------------------------------------------------------

/// Fields shared by both message kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Stable map key: `user-<local>`, `user-backend-<id>`, or `ai-<id>`.
    pub id: String,
    pub status: MessageStatus,
    /// The monotonically-growing displayed text.
    pub content: String,
    /// Milliseconds since epoch; local creation time or server `created_at`.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<i64>,
    /// Server serial; the primary total-order key within the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageHeader {
    pub fn new(id: impl Into<String>, status: MessageStatus, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            content: content.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            subtask_id: None,
            message_id: None,
            error: None,
        }
    }
}

/// A user turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_name: Option<String>,
    /// Group chats show the sender line above the bubble.
    #[serde(default)]
    pub should_show_sender: bool,
}

/// An assistant turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiMessage {
    /// Server-side lifecycle of the producing subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_status: Option<SubtaskState>,
    /// Model "thinking" text, accumulated from reasoning chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubtaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
}

/// One message in the timeline: a shared header plus per-kind fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    User {
        #[serde(flatten)]
        header: MessageHeader,
        #[serde(flatten)]
        user: UserMessage,
    },
    Ai {
        #[serde(flatten)]
        header: MessageHeader,
        #[serde(flatten)]
        ai: AiMessage,
    },
}

impl TaskMessage {
    pub fn user(header: MessageHeader, user: UserMessage) -> Self {
        Self::User { header, user }
    }

    pub fn ai(header: MessageHeader, ai: AiMessage) -> Self {
        Self::Ai { header, ai }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            Self::User { header, .. } | Self::Ai { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        match self {
            Self::User { header, .. } | Self::Ai { header, .. } => header,
        }
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Self::Ai { .. })
    }

    pub fn as_ai(&self) -> Option<&AiMessage> {
        match self {
            Self::Ai { ai, .. } => Some(ai),
            Self::User { .. } => None,
        }
    }

    pub fn as_ai_mut(&mut self) -> Option<&mut AiMessage> {
        match self {
            Self::Ai { ai, .. } => Some(ai),
            Self::User { .. } => None,
        }
    }

    /// True for an assistant message that is currently streaming.
    pub fn is_streaming_ai(&self) -> bool {
        self.is_ai() && self.header().status == MessageStatus::Streaming
    }
}

/// Options attached to an optimistic user send.
#[derive(Debug, Clone, Default)]
pub struct PendingMessageOptions {
    pub attachments: Vec<Value>,
    pub contexts: Vec<Value>,
    pub sender_user_id: Option<i64>,
    pub sender_user_name: Option<String>,
    pub is_group_chat: bool,
}

// ---------------------------------------------------------------------------
// Display order
// ---------------------------------------------------------------------------

/// The consumer-facing ordering: `message_id` ascending, then messages
/// without one in `timestamp` ascending after all committed messages.
pub fn display_order(a: &TaskMessage, b: &TaskMessage) -> Ordering {
    let (ha, hb) = (a.header(), b.header());
    match (ha.message_id, hb.message_id) {
        (Some(x), Some(y)) => x.cmp(&y).then(ha.timestamp_ms.cmp(&hb.timestamp_ms)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => ha.timestamp_ms.cmp(&hb.timestamp_ms),
    }
}

// ---------------------------------------------------------------------------
// Block and result merging
// ---------------------------------------------------------------------------

/// Merge incoming blocks into the existing list by id: text blocks
/// accumulate content, tool blocks replace wholesale.
pub fn merge_blocks(existing: &mut Vec<Block>, incoming: &[Block]) {
    for block in incoming {
        match existing.iter_mut().find(|b| b.id == block.id) {
            Some(slot) => match block.kind {
                BlockKind::Text => {
                    slot.content.push_str(&block.content);
                    if block.status.is_some() {
                        slot.status = block.status.clone();
                    }
                }
                BlockKind::ToolUse | BlockKind::ToolResult => *slot = block.clone(),
            },
            None => existing.push(block.clone()),
        }
    }
}

/// Append a bare text delta to the block with the given id, creating a
/// streaming text block if none exists yet (the common text-stream case).
pub fn append_text_block(existing: &mut Vec<Block>, block_id: &str, content: &str) {
    match existing
        .iter_mut()
        .find(|b| b.id == block_id && b.kind == BlockKind::Text)
    {
        Some(slot) => slot.content.push_str(content),
        None => existing.push(Block {
            id: block_id.to_string(),
            kind: BlockKind::Text,
            content: content.to_string(),
            status: Some("streaming".to_string()),
            extra: serde_json::Map::new(),
        }),
    }
}

/// Merge an incoming result over the current one, preferring incoming
/// non-empty fields. Blocks merge by id; `reasoning_chunk` is handled by the
/// caller (it appends to the message, not the result).
pub fn merge_result(current: &mut Option<SubtaskResult>, incoming: &SubtaskResult) {
    let slot = current.get_or_insert_with(SubtaskResult::default);

    if incoming.value.as_deref().is_some_and(|v| !v.is_empty()) {
        slot.value = incoming.value.clone();
    }
    if !incoming.thinking.is_empty() {
        slot.thinking = incoming.thinking.clone();
    }
    if !incoming.blocks.is_empty() {
        merge_blocks(&mut slot.blocks, &incoming.blocks);
    }
    if incoming.shell_type.is_some() {
        slot.shell_type = incoming.shell_type.clone();
    }
    if !incoming.sources.is_empty() {
        slot.sources = incoming.sources.clone();
    }
    if incoming.reasoning_content.is_some() {
        slot.reasoning_content = incoming.reasoning_content.clone();
    }
    if incoming.correction.is_some() {
        slot.correction = incoming.correction.clone();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
