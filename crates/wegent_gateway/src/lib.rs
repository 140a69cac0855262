//! Task-room socket gateway.
//!
//! One persistent multiplexed WebSocket connection shared across all tasks.
//! [`gateway::SocketGateway`] joins and leaves per-task rooms, fans incoming
//! `chat:*` events out to per-task subscribers, and notifies listeners after
//! every reconnect so they can re-sync with `force=true`.

/// The WebSocket client: connection lifecycle, rooms, event fan-out.
pub mod gateway;
/// Envelope-based wire protocol and typed chat events.
pub mod protocol;

pub use gateway::{GatewayError, RoutedEvent, SocketGateway};
pub use protocol::{
    Block, BlockKind, ChatEvent, Envelope, JoinOptions, JoinReply, MessageKind, Source,
    StreamingInfo, Subtask, SubtaskResult, SubtaskRole, SubtaskState,
};
