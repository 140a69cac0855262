//! Authenticated HTTP transport and streaming chat client.
//!
//! [`client::ApiClient`] is the single process-wide request/response surface:
//! it attaches the bearer token, normalizes 401 into an auth-expired error
//! with a sanitized return path, and extracts server error messages.
//! [`chat`] drives one streaming assistant turn over an SSE-framed response
//! body; [`poll`] is the long-poll helper used by the deep-research path.

/// Streaming chat turn: SSE POST, first-frame task resolution, cancellation.
pub mod chat;
/// Authenticated request/response client.
pub mod client;
/// Streaming-status polling with cooperative cancellation.
pub mod poll;
/// SSE frame parsing and the byte-stream driver.
pub mod sse;

pub use chat::{CancelReply, ChatTurnEvent, ChatTurnHandle, ChatTurnRequest, cancel_chat,
    start_chat_turn};
pub use client::{ApiClient, ApiError, login_url};
pub use poll::{PollOptions, PollOutcome, poll_until};
pub use sse::{ChatFrame, FrameResult, StreamEvent};
