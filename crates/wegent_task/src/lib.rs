//! Per-task conversational state.
//!
//! [`machine::TaskStateMachine`] reconstructs one task's message timeline
//! from three overlapping sources (optimistic local sends, the live stream
//! cache returned by a room join, and the database snapshot) and keeps it
//! consistent across reordering, disconnects, and mid-stream page reloads.
//! [`manager::TaskStateManager`] owns the machines, routes incoming socket
//! events to them, and batch-recovers every task after a reconnect.

/// The per-task reentrant state machine.
pub mod machine;
/// Machine registry, recovery orchestration, and event routing.
pub mod manager;
/// The message model, display ordering, and block merging.
pub mod message;

pub use machine::{RecoverAction, RecoverOptions, TaskSnapshot, TaskStateMachine, TaskStatus};
pub use manager::{RoomClient, TaskStateManager};
pub use message::{
    AiMessage, MessageHeader, MessageStatus, PendingMessageOptions, TaskMessage, UserMessage,
    ai_slot_key, display_order, local_user_key, user_slot_key,
};
