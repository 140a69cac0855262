//! The per-task reentrant state machine.
//!
//! One machine owns one task's message map and status. All transitions are
//! synchronous; the manager performs the room I/O and feeds results back in,
//! so a transition is atomic between suspension points. Recovery requests
//! arriving during a transient state are coalesced into a single queued
//! option set, and chat events arriving during a join/sync are buffered and
//! replayed once the merge completes.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use wegent_gateway::protocol::{
    ChatEvent, JoinOptions, JoinReply, Source, StreamingInfo, Subtask, SubtaskResult,
    SubtaskRole, SubtaskState,
};

use crate::message::{
    AiMessage, MessageHeader, MessageStatus, PendingMessageOptions, TaskMessage, UserMessage,
    ai_slot_key, append_text_block, display_order, merge_result, user_slot_key,
};

/// A non-forced recovery within this window of the previous one is dropped.
const RECOVER_DEBOUNCE_MS: i64 = 1000;

// ---------------------------------------------------------------------------
// Status and recovery types
// ---------------------------------------------------------------------------

/// The task-level status lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Joining,
    Syncing,
    Ready,
    Streaming,
    Error,
}

impl TaskStatus {
    /// True while a room join/sync is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Joining | Self::Syncing)
    }
}

/// Options for a recovery request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverOptions {
    /// Bypass the debounce window.
    pub force: bool,
}

/// What the caller should do after announcing a recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverAction {
    /// Dropped by the debounce window; nothing to do.
    Debounced,
    /// A join/sync is already in flight; the request was queued (last wins).
    Queued,
    /// Perform the room join with these options, then feed the result back
    /// through `apply_join_success` / `apply_join_failure`.
    Join(JoinOptions),
}

/// An immutable view of a machine's state, emitted to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: i64,
    pub status: TaskStatus,
    /// Messages in display order.
    pub messages: Vec<TaskMessage>,
    pub streaming_subtask_id: Option<i64>,
    pub error: Option<String>,
    pub is_stopping: bool,
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

/// Per-task state: status, message map, streaming bookkeeping, and the
/// queued-recover / pending-chunks reentrancy machinery.
pub struct TaskStateMachine {
    task_id: i64,
    status: TaskStatus,
    messages: HashMap<String, TaskMessage>,
    streaming_subtask_id: Option<i64>,
    streaming_info: Option<StreamingInfo>,
    error: Option<String>,
    is_stopping: bool,
    last_recover_at_ms: Option<i64>,
    queued_recover: Option<RecoverOptions>,
    pending_chunks: VecDeque<ChatEvent>,
}

impl TaskStateMachine {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            status: TaskStatus::Idle,
            messages: HashMap::new(),
            streaming_subtask_id: None,
            streaming_info: None,
            error: None,
            is_stopping: false,
            last_recover_at_ms: None,
            queued_recover: None,
            pending_chunks: VecDeque::new(),
        }
    }

    // -- Accessors -----------------------------------------------------------

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn streaming_subtask_id(&self) -> Option<i64> {
        self.streaming_subtask_id
    }

    pub fn is_stopping(&self) -> bool {
        self.is_stopping
    }

    /// Flag a user-initiated stop in progress (disables the send box).
    pub fn set_stopping(&mut self, stopping: bool) {
        self.is_stopping = stopping;
    }

    pub fn message(&self, key: &str) -> Option<&TaskMessage> {
        self.messages.get(key)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Messages in display order (committed by `message_id`, then optimistic
    /// sends by timestamp).
    pub fn ordered_messages(&self) -> Vec<TaskMessage> {
        let mut messages: Vec<TaskMessage> = self.messages.values().cloned().collect();
        messages.sort_by(display_order);
        messages
    }

    /// The high-water-mark message id, used for incremental resync.
    pub fn max_known_message_id(&self) -> Option<i64> {
        self.messages
            .values()
            .filter_map(|m| m.header().message_id)
            .max()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            status: self.status,
            messages: self.ordered_messages(),
            streaming_subtask_id: self.streaming_subtask_id,
            error: self.error.clone(),
            is_stopping: self.is_stopping,
        }
    }

    pub(crate) fn set_task_id(&mut self, task_id: i64) {
        self.task_id = task_id;
    }

    // -- Recovery ------------------------------------------------------------

    /// Announce a recovery request using the current wall clock.
    pub fn begin_recover(&mut self, options: RecoverOptions) -> RecoverAction {
        self.begin_recover_at(options, chrono::Utc::now().timestamp_millis())
    }

    /// Announce a recovery request. Applies the debounce window, queues the
    /// request when a join/sync is already in flight, and otherwise enters
    /// `joining` (from idle) or `syncing` (from any settled state).
    pub fn begin_recover_at(&mut self, options: RecoverOptions, now_ms: i64) -> RecoverAction {
        if !options.force {
            if let Some(last) = self.last_recover_at_ms {
                if now_ms.saturating_sub(last) < RECOVER_DEBOUNCE_MS {
                    debug!("Recovery for task {} debounced", self.task_id);
                    return RecoverAction::Debounced;
                }
            }
        }

        if self.status.is_transient() {
            // Coalesce: at most one pending request, last one wins.
            self.queued_recover = Some(options);
            return RecoverAction::Queued;
        }

        self.last_recover_at_ms = Some(now_ms);
        self.status = if self.status == TaskStatus::Idle {
            TaskStatus::Joining
        } else {
            TaskStatus::Syncing
        };

        RecoverAction::Join(JoinOptions {
            force_refresh: true,
            after_message_id: self.max_known_message_id(),
        })
    }

    /// Apply a successful room join: merge the snapshot, settle the status,
    /// drain buffered events, and hand back any queued recovery request.
    pub fn apply_join_success(&mut self, reply: JoinReply) -> Option<RecoverOptions> {
        if !self.status.is_transient() {
            debug!("Stale join result for task {} ignored", self.task_id);
            return None;
        }
        if let Some(error) = reply.error {
            return self.apply_join_failure(error);
        }

        self.streaming_info = reply.streaming;
        if let Some(subtasks) = &reply.subtasks {
            self.merge_subtasks(subtasks);
        }
        self.synthesize_streaming_slot();

        let streaming_slot = self
            .messages
            .values()
            .find(|m| m.is_streaming_ai())
            .and_then(|m| m.header().subtask_id);

        // Stream-cache info whose slot already finished is stale; it must
        // not pull the machine back into streaming.
        let cache_stream = self
            .streaming_info
            .as_ref()
            .map(|s| s.subtask_id)
            .filter(|id| {
                self.messages
                    .get(&ai_slot_key(*id))
                    .is_none_or(|m| !m.header().status.is_terminal())
            });

        if streaming_slot.is_some() || cache_stream.is_some() {
            self.status = TaskStatus::Streaming;
            self.streaming_subtask_id = cache_stream.or(streaming_slot);
        } else {
            self.status = TaskStatus::Ready;
            self.streaming_subtask_id = None;
        }
        self.error = None;

        self.drain_pending_chunks();
        self.queued_recover.take()
    }

    /// Apply a failed room join. The machine enters `error`; buffered events
    /// are still drained so nothing is lost across the retry.
    pub fn apply_join_failure(&mut self, message: impl Into<String>) -> Option<RecoverOptions> {
        if !self.status.is_transient() {
            return None;
        }
        self.status = TaskStatus::Error;
        self.error = Some(message.into());
        self.drain_pending_chunks();
        self.queued_recover.take()
    }

    /// Drop all transient state and return to `idle` (room left).
    pub fn leave(&mut self) {
        self.status = TaskStatus::Idle;
        self.streaming_subtask_id = None;
        self.streaming_info = None;
        self.error = None;
        self.is_stopping = false;
        self.queued_recover = None;
        self.pending_chunks.clear();
    }

    // -- Live events ---------------------------------------------------------

    /// Feed one socket event into the machine. Events arriving while a
    /// join/sync is in flight are buffered and replayed after the merge.
    pub fn handle_event(&mut self, event: ChatEvent) {
        if self.status.is_transient() {
            self.pending_chunks.push_back(event);
            return;
        }
        self.apply_event(event);
    }

    /// Number of events waiting for the in-flight join/sync to finish.
    pub fn pending_chunk_count(&self) -> usize {
        self.pending_chunks.len()
    }

    fn drain_pending_chunks(&mut self) {
        let events: Vec<ChatEvent> = self.pending_chunks.drain(..).collect();
        for event in events {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Start {
                subtask_id,
                shell_type,
            } => self.on_chat_start(subtask_id, shell_type),
            ChatEvent::Chunk {
                subtask_id,
                content,
                result,
                sources,
                block_id,
            } => self.on_chat_chunk(subtask_id, content, result, sources, block_id),
            ChatEvent::Done {
                subtask_id,
                content,
                result,
                message_id,
                sources,
                has_error,
                error_message,
            } => self.on_chat_done(
                subtask_id,
                content,
                result,
                message_id,
                sources,
                has_error,
                error_message,
            ),
            ChatEvent::Error {
                subtask_id,
                error,
                message_id,
            } => self.on_chat_error(subtask_id, error, message_id),
            ChatEvent::Cancelled { subtask_id } => self.on_chat_cancelled(subtask_id),
            ChatEvent::Message {
                subtask_id,
                content,
                message_id,
                sender_user_id,
                sender_user_name,
                contexts,
            } => self.on_peer_message(
                subtask_id,
                content,
                message_id,
                sender_user_id,
                sender_user_name,
                contexts,
            ),
        }
    }

    fn on_chat_start(&mut self, subtask_id: i64, shell_type: Option<String>) {
        let key = ai_slot_key(subtask_id);

        // Replays of a finished turn never restart the slot.
        if let Some(existing) = self.messages.get(&key) {
            if existing.header().status.is_terminal() {
                debug!("chat:start for finished subtask {subtask_id}; ignoring");
                return;
            }
        }

        // A task streams one reply at a time; finalize anything stale.
        for message in self.messages.values_mut() {
            if message.is_streaming_ai() && message.header().subtask_id != Some(subtask_id) {
                debug!("Finalizing stale streaming slot {}", message.header().id);
                message.header_mut().status = MessageStatus::Completed;
            }
        }

        let entry = self.messages.entry(key.clone()).or_insert_with(|| {
            let mut header = MessageHeader::new(key, MessageStatus::Streaming, "");
            header.subtask_id = Some(subtask_id);
            TaskMessage::ai(header, AiMessage::default())
        });
        entry.header_mut().status = MessageStatus::Streaming;
        if let Some(ai) = entry.as_ai_mut() {
            ai.subtask_status = Some(SubtaskState::Running);
            if shell_type.is_some() {
                merge_result(
                    &mut ai.result,
                    &SubtaskResult {
                        shell_type,
                        ..Default::default()
                    },
                );
            }
        }

        self.streaming_subtask_id = Some(subtask_id);
        if self.status == TaskStatus::Ready {
            self.status = TaskStatus::Streaming;
        }
    }

    fn on_chat_chunk(
        &mut self,
        subtask_id: i64,
        content: String,
        result: Option<SubtaskResult>,
        sources: Option<Vec<Source>>,
        block_id: Option<String>,
    ) {
        let key = ai_slot_key(subtask_id);
        let Some(message) = self.messages.get_mut(&key) else {
            warn!("chat:chunk for unknown subtask {subtask_id}; dropping");
            return;
        };
        if message.header().status.is_terminal() {
            debug!("chat:chunk for finished subtask {subtask_id}; dropping");
            return;
        }

        // The displayed transcript always grows, block structure or not.
        message.header_mut().content.push_str(&content);

        let Some(ai) = message.as_ai_mut() else { return };

        let incoming_has_blocks = result.as_ref().is_some_and(|r| !r.blocks.is_empty());
        if let Some(block_id) = block_id {
            if !incoming_has_blocks {
                let slot = ai.result.get_or_insert_with(SubtaskResult::default);
                append_text_block(&mut slot.blocks, &block_id, &content);
            }
        }

        if let Some(result) = &result {
            if let Some(chunk) = &result.reasoning_chunk {
                ai.reasoning_content
                    .get_or_insert_with(String::new)
                    .push_str(chunk);
            } else if let Some(full) = &result.reasoning_content {
                ai.reasoning_content = Some(full.clone());
            }
            merge_result(&mut ai.result, result);
        }

        if let Some(sources) = sources {
            ai.sources = sources;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_chat_done(
        &mut self,
        subtask_id: i64,
        content: Option<String>,
        result: Option<SubtaskResult>,
        message_id: Option<i64>,
        sources: Option<Vec<Source>>,
        has_error: bool,
        error_message: Option<String>,
    ) {
        let key = ai_slot_key(subtask_id);
        match self.messages.get_mut(&key) {
            Some(message) => {
                if message.header().status.is_terminal() {
                    // Replay: idempotent updates only.
                    let header = message.header_mut();
                    if header.message_id.is_none() {
                        header.message_id = message_id;
                    }
                    if let (Some(ai), Some(sources)) = (message.as_ai_mut(), sources) {
                        if ai.sources.is_empty() {
                            ai.sources = sources;
                        }
                    }
                } else {
                    let header = message.header_mut();
                    header.status = if has_error {
                        MessageStatus::Error
                    } else {
                        MessageStatus::Completed
                    };
                    if has_error {
                        header.error = error_message.clone();
                    }
                    if message_id.is_some() {
                        header.message_id = message_id;
                    }
                    // A full replacement, not a delta.
                    if let Some(content) = content.filter(|c| !c.is_empty()) {
                        header.content = content;
                    }
                    if let Some(ai) = message.as_ai_mut() {
                        ai.subtask_status = Some(if has_error {
                            SubtaskState::Failed
                        } else {
                            SubtaskState::Completed
                        });
                        if let Some(result) = &result {
                            merge_result(&mut ai.result, result);
                        }
                        if let Some(sources) = sources {
                            ai.sources = sources;
                        }
                    }
                }
            }
            None => {
                // Page refreshed mid-turn and only the finalizer arrived:
                // synthesize the completed slot from the event payload.
                let text = content
                    .or_else(|| result.as_ref().and_then(|r| r.value.clone()))
                    .unwrap_or_default();
                let mut header = MessageHeader::new(
                    key.clone(),
                    if has_error {
                        MessageStatus::Error
                    } else {
                        MessageStatus::Completed
                    },
                    text,
                );
                header.subtask_id = Some(subtask_id);
                header.message_id = message_id;
                if has_error {
                    header.error = error_message.clone();
                }
                let ai = AiMessage {
                    subtask_status: Some(if has_error {
                        SubtaskState::Failed
                    } else {
                        SubtaskState::Completed
                    }),
                    sources: sources.unwrap_or_default(),
                    result,
                    ..Default::default()
                };
                self.messages.insert(key, TaskMessage::ai(header, ai));
            }
        }

        if self.streaming_subtask_id == Some(subtask_id) {
            self.streaming_subtask_id = None;
            if self.status == TaskStatus::Streaming {
                if has_error {
                    self.status = TaskStatus::Error;
                    self.error = error_message;
                } else {
                    self.status = TaskStatus::Ready;
                }
            }
        }
    }

    fn on_chat_error(&mut self, subtask_id: i64, error: String, message_id: Option<i64>) {
        let key = ai_slot_key(subtask_id);
        match self.messages.get_mut(&key) {
            Some(message) if !message.header().status.is_terminal() => {
                let header = message.header_mut();
                header.status = MessageStatus::Error;
                header.error = Some(error.clone());
                if message_id.is_some() {
                    header.message_id = message_id;
                }
                if let Some(ai) = message.as_ai_mut() {
                    ai.subtask_status = Some(SubtaskState::Failed);
                }
            }
            Some(_) => {
                debug!("chat:error for finished subtask {subtask_id}; ignoring");
                return;
            }
            None => {
                let mut header =
                    MessageHeader::new(key.clone(), MessageStatus::Error, "");
                header.subtask_id = Some(subtask_id);
                header.message_id = message_id;
                header.error = Some(error.clone());
                let ai = AiMessage {
                    subtask_status: Some(SubtaskState::Failed),
                    ..Default::default()
                };
                self.messages.insert(key, TaskMessage::ai(header, ai));
            }
        }

        if self.streaming_subtask_id == Some(subtask_id) {
            self.streaming_subtask_id = None;
        }
        if matches!(self.status, TaskStatus::Ready | TaskStatus::Streaming) {
            self.status = TaskStatus::Error;
            self.error = Some(error);
        }
    }

    fn on_chat_cancelled(&mut self, subtask_id: i64) {
        let key = ai_slot_key(subtask_id);
        match self.messages.get_mut(&key) {
            Some(message) if !message.header().status.is_terminal() => {
                // Keep everything accumulated so far; the turn just stops.
                message.header_mut().status = MessageStatus::Completed;
                if let Some(ai) = message.as_ai_mut() {
                    ai.subtask_status = Some(SubtaskState::Cancelled);
                }
            }
            Some(message) => {
                if let Some(ai) = message.as_ai_mut() {
                    ai.subtask_status = Some(SubtaskState::Cancelled);
                }
            }
            None => {
                warn!("chat:cancelled for unknown subtask {subtask_id}; dropping");
            }
        }

        self.is_stopping = false;
        if self.streaming_subtask_id == Some(subtask_id) {
            self.streaming_subtask_id = None;
            if self.status == TaskStatus::Streaming {
                self.status = TaskStatus::Ready;
            }
        }
    }

    fn on_peer_message(
        &mut self,
        subtask_id: i64,
        content: String,
        message_id: i64,
        sender_user_id: Option<i64>,
        sender_user_name: Option<String>,
        contexts: Vec<serde_json::Value>,
    ) {
        // May also arrive via a snapshot or a confirmed local send;
        // double-observation is merged idempotently by subtask id.
        if let Some(existing) = self
            .messages
            .values_mut()
            .find(|m| !m.is_ai() && m.header().subtask_id == Some(subtask_id))
        {
            let header = existing.header_mut();
            if header.message_id.is_none() {
                header.message_id = Some(message_id);
            }
            return;
        }

        let key = user_slot_key(subtask_id);
        let mut header = MessageHeader::new(key.clone(), MessageStatus::Completed, content);
        header.subtask_id = Some(subtask_id);
        header.message_id = Some(message_id);
        let user = UserMessage {
            contexts,
            sender_user_id,
            sender_user_name,
            should_show_sender: true,
            ..Default::default()
        };
        self.messages.insert(key, TaskMessage::user(header, user));
    }

    // -- Optimistic sends ----------------------------------------------------

    /// Insert an optimistic user message awaiting server acknowledgement.
    pub fn add_pending_user_message(
        &mut self,
        local_id: &str,
        content: &str,
        options: PendingMessageOptions,
    ) {
        let header = MessageHeader::new(local_id, MessageStatus::Pending, content);
        let user = UserMessage {
            attachments: options.attachments,
            contexts: options.contexts,
            sender_user_id: options.sender_user_id,
            sender_user_name: options.sender_user_name,
            should_show_sender: options.is_group_chat,
        };
        self.messages
            .insert(local_id.to_string(), TaskMessage::user(header, user));
    }

    /// The server echoed the send: attach its ids and complete the message.
    /// The map key stays stable; only the rendered identity changes.
    pub fn confirm_user_message(&mut self, local_id: &str, subtask_id: i64, message_id: i64) {
        let Some(message) = self.messages.get_mut(local_id) else {
            warn!("Confirm for unknown local message {local_id}");
            return;
        };
        let header = message.header_mut();
        header.status = MessageStatus::Completed;
        header.subtask_id = Some(subtask_id);
        header.message_id = Some(message_id);
    }

    /// The send failed before the server accepted it.
    pub fn mark_user_message_error(&mut self, local_id: &str, error: &str) {
        let Some(message) = self.messages.get_mut(local_id) else {
            warn!("Error mark for unknown local message {local_id}");
            return;
        };
        let header = message.header_mut();
        header.status = MessageStatus::Error;
        header.error = Some(error.to_string());
    }

    // -- Correction hooks ----------------------------------------------------

    /// The assistant message produced by a subtask, if present.
    pub fn ai_message_by_subtask(&self, subtask_id: i64) -> Option<&TaskMessage> {
        self.messages.get(&ai_slot_key(subtask_id))
    }

    /// Replace a completed assistant reply's visible content (correction
    /// apply/undo). Returns the previous content. The server keeps the
    /// original value, so the rewrite is reversible.
    pub fn replace_ai_content(&mut self, subtask_id: i64, content: &str) -> Option<String> {
        let message = self.messages.get_mut(&ai_slot_key(subtask_id))?;
        let previous = std::mem::replace(&mut message.header_mut().content, content.to_string());
        if let Some(ai) = message.as_ai_mut() {
            if let Some(result) = ai.result.as_mut() {
                result.value = Some(content.to_string());
            }
        }
        Some(previous)
    }

    /// Attach a correction record to the message's structured result.
    pub fn set_correction(&mut self, subtask_id: i64, correction: serde_json::Value) {
        let Some(message) = self.messages.get_mut(&ai_slot_key(subtask_id)) else {
            return;
        };
        if let Some(ai) = message.as_ai_mut() {
            ai.result
                .get_or_insert_with(SubtaskResult::default)
                .correction = Some(correction);
        }
    }

    // -- Edit cascade and pagination ----------------------------------------

    /// Editing a prior question discards its reply and everything after it;
    /// the next send creates a new branch.
    pub fn cleanup_messages_after_edit(&mut self, edited_subtask_id: i64) {
        let edited_message_id = self
            .messages
            .values()
            .find(|m| !m.is_ai() && m.header().subtask_id == Some(edited_subtask_id))
            .and_then(|m| m.header().message_id);
        let Some(edited_message_id) = edited_message_id else {
            warn!("Edit cleanup: no committed user message for subtask {edited_subtask_id}");
            return;
        };
        self.messages.retain(|_, m| {
            m.header()
                .message_id
                .is_none_or(|mid| mid < edited_message_id)
        });
    }

    /// Insert older history entries. Existing keys are never overwritten by
    /// older snapshots.
    pub fn merge_older_messages(&mut self, messages: Vec<TaskMessage>) {
        for message in messages {
            let key = message.header().id.clone();
            self.messages.entry(key).or_insert(message);
        }
    }

    // -- Snapshot merge ------------------------------------------------------

    fn merge_subtasks(&mut self, subtasks: &[Subtask]) {
        for subtask in subtasks {
            match subtask.role {
                SubtaskRole::User => self.merge_user_subtask(subtask),
                SubtaskRole::Assistant => self.merge_ai_subtask(subtask),
            }
        }
    }

    fn merge_user_subtask(&mut self, subtask: &Subtask) {
        // A confirmed optimistic send or a peer message may already hold this
        // subtask under another key; never duplicate it.
        if let Some(existing) = self
            .messages
            .values_mut()
            .find(|m| !m.is_ai() && m.header().subtask_id == Some(subtask.id))
        {
            let header = existing.header_mut();
            if header.message_id.is_none() {
                header.message_id = subtask.message_id;
            }
            return;
        }

        let key = user_slot_key(subtask.id);
        let mut header = MessageHeader::new(
            key.clone(),
            MessageStatus::Completed,
            subtask.prompt.clone().unwrap_or_default(),
        );
        if let Some(created_at) = subtask.created_at {
            header.timestamp_ms = created_at.timestamp_millis();
        }
        header.subtask_id = Some(subtask.id);
        header.message_id = subtask.message_id;
        let user = UserMessage {
            attachments: subtask.attachments.clone(),
            contexts: subtask.contexts.clone(),
            sender_user_id: subtask.sender_user_id,
            sender_user_name: subtask.sender_user_name.clone(),
            should_show_sender: subtask.sender_user_name.is_some(),
        };
        self.messages.insert(key, TaskMessage::user(header, user));
    }

    fn merge_ai_subtask(&mut self, subtask: &Subtask) {
        match subtask.status {
            // Placeholders the scheduler has not picked up yet.
            SubtaskState::Pending => {}
            SubtaskState::Running => self.merge_running_ai(subtask),
            _ => self.merge_terminal_ai(subtask),
        }
    }

    /// The content-priority rule: for an in-flight reply, display the longest
    /// of the live stream cache, the in-memory content, and the snapshot
    /// value. This reconciles the 1-second cache cadence, the 5-second
    /// database cadence, and possibly-newer local chunks.
    fn merge_running_ai(&mut self, subtask: &Subtask) {
        let key = ai_slot_key(subtask.id);

        let cache_content = self
            .streaming_info
            .as_ref()
            .filter(|s| s.subtask_id == subtask.id)
            .map(|s| s.cached_content.clone());
        let memory_content = self.messages.get(&key).map(|m| m.header().content.clone());
        let snapshot_content = subtask.result.as_ref().and_then(|r| r.value.clone());

        let content = [cache_content, memory_content, snapshot_content]
            .into_iter()
            .flatten()
            // max_by_key keeps the later element on ties, so reverse the
            // candidate order to prefer cache > memory > snapshot.
            .rev()
            .max_by_key(|c| c.len())
            .unwrap_or_default();

        match self.messages.get_mut(&key) {
            Some(existing) => {
                if existing.header().status.is_terminal() {
                    // A finished slot is never rewound by a stale RUNNING row.
                    let header = existing.header_mut();
                    if header.message_id.is_none() {
                        header.message_id = subtask.message_id;
                    }
                    return;
                }
                let header = existing.header_mut();
                header.content = content;
                header.status = MessageStatus::Streaming;
                if header.message_id.is_none() {
                    header.message_id = subtask.message_id;
                }
                if let Some(ai) = existing.as_ai_mut() {
                    ai.subtask_status = Some(SubtaskState::Running);
                    if let Some(result) = &subtask.result {
                        merge_result(&mut ai.result, result);
                    }
                }
            }
            None => {
                let mut header = MessageHeader::new(key.clone(), MessageStatus::Streaming, content);
                if let Some(created_at) = subtask.created_at {
                    header.timestamp_ms = created_at.timestamp_millis();
                }
                header.subtask_id = Some(subtask.id);
                header.message_id = subtask.message_id;
                let ai = AiMessage {
                    subtask_status: Some(SubtaskState::Running),
                    sources: subtask
                        .result
                        .as_ref()
                        .map(|r| r.sources.clone())
                        .unwrap_or_default(),
                    reasoning_content: subtask
                        .result
                        .as_ref()
                        .and_then(|r| r.reasoning_content.clone()),
                    result: subtask.result.clone(),
                    bot_name: bot_name(subtask),
                };
                self.messages.insert(key, TaskMessage::ai(header, ai));
            }
        }
    }

    fn merge_terminal_ai(&mut self, subtask: &Subtask) {
        let key = ai_slot_key(subtask.id);
        let failed = matches!(
            subtask.status,
            SubtaskState::Failed | SubtaskState::Cancelled
        );

        match self.messages.get_mut(&key) {
            Some(existing) if existing.header().status.is_terminal() => {
                // Idempotent updates only (ids, citations, cancel conversion).
                let header = existing.header_mut();
                if header.message_id.is_none() {
                    header.message_id = subtask.message_id;
                }
                if let Some(ai) = existing.as_ai_mut() {
                    if subtask.status == SubtaskState::Cancelled {
                        ai.subtask_status = Some(SubtaskState::Cancelled);
                    }
                    if ai.sources.is_empty() {
                        if let Some(result) = &subtask.result {
                            ai.sources = result.sources.clone();
                        }
                    }
                }
            }
            Some(existing) => {
                // A live slot the snapshot has since finished.
                let header = existing.header_mut();
                header.status = if failed {
                    MessageStatus::Error
                } else {
                    MessageStatus::Completed
                };
                if failed {
                    header.error = subtask.error_message.clone();
                }
                if let Some(value) = subtask
                    .result
                    .as_ref()
                    .and_then(|r| r.value.clone())
                    .filter(|v| !v.is_empty())
                {
                    header.content = value;
                }
                if header.message_id.is_none() {
                    header.message_id = subtask.message_id;
                }
                if let Some(ai) = existing.as_ai_mut() {
                    ai.subtask_status = Some(subtask.status);
                    if let Some(result) = &subtask.result {
                        merge_result(&mut ai.result, result);
                        if !result.sources.is_empty() {
                            ai.sources = result.sources.clone();
                        }
                    }
                }
            }
            None => {
                let content = subtask
                    .result
                    .as_ref()
                    .and_then(|r| r.value.clone())
                    .unwrap_or_default();
                let mut header = MessageHeader::new(
                    key.clone(),
                    if failed {
                        MessageStatus::Error
                    } else {
                        MessageStatus::Completed
                    },
                    content,
                );
                if let Some(created_at) = subtask.created_at {
                    header.timestamp_ms = created_at.timestamp_millis();
                }
                header.subtask_id = Some(subtask.id);
                header.message_id = subtask.message_id;
                if failed {
                    header.error = subtask.error_message.clone();
                }
                let ai = AiMessage {
                    subtask_status: Some(subtask.status),
                    sources: subtask
                        .result
                        .as_ref()
                        .map(|r| r.sources.clone())
                        .unwrap_or_default(),
                    reasoning_content: subtask
                        .result
                        .as_ref()
                        .and_then(|r| r.reasoning_content.clone()),
                    result: subtask.result.clone(),
                    bot_name: bot_name(subtask),
                };
                self.messages.insert(key, TaskMessage::ai(header, ai));
            }
        }
    }

    /// The server reported an in-flight turn the snapshot didn't contain:
    /// synthesize its slot from the stream cache.
    fn synthesize_streaming_slot(&mut self) {
        let Some(info) = &self.streaming_info else { return };
        let key = ai_slot_key(info.subtask_id);
        if self.messages.contains_key(&key) {
            return;
        }
        let mut header = MessageHeader::new(
            key.clone(),
            MessageStatus::Streaming,
            info.cached_content.clone(),
        );
        header.subtask_id = Some(info.subtask_id);
        let ai = AiMessage {
            subtask_status: Some(SubtaskState::Running),
            ..Default::default()
        };
        self.messages.insert(key, TaskMessage::ai(header, ai));
    }
}

/// Display name of the bot that produced a subtask, when the server sent one.
fn bot_name(subtask: &Subtask) -> Option<String> {
    subtask
        .bots
        .first()
        .and_then(|bot| bot.get("name"))
        .and_then(|name| name.as_str())
        .map(String::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wegent_gateway::protocol::Block;

    fn start(subtask_id: i64) -> ChatEvent {
        ChatEvent::Start {
            subtask_id,
            shell_type: None,
        }
    }

    fn chunk(subtask_id: i64, content: &str) -> ChatEvent {
        ChatEvent::Chunk {
            subtask_id,
            content: content.to_string(),
            result: None,
            sources: None,
            block_id: None,
        }
    }

    fn done(subtask_id: i64, message_id: Option<i64>) -> ChatEvent {
        ChatEvent::Done {
            subtask_id,
            content: None,
            result: None,
            message_id,
            sources: None,
            has_error: false,
            error_message: None,
        }
    }

    fn user_subtask(id: i64, prompt: &str, message_id: i64) -> Subtask {
        serde_json::from_value(json!({
            "id": id,
            "role": "USER",
            "status": "COMPLETED",
            "prompt": prompt,
            "message_id": message_id,
        }))
        .unwrap()
    }

    fn ai_subtask(id: i64, status: &str, value: Option<&str>, message_id: Option<i64>) -> Subtask {
        serde_json::from_value(json!({
            "id": id,
            "role": "ASSISTANT",
            "status": status,
            "message_id": message_id,
            "result": value.map(|v| json!({"value": v})),
        }))
        .unwrap()
    }

    /// Drive a machine through an immediate successful join.
    fn joined(machine: &mut TaskStateMachine, reply: JoinReply) {
        let action = machine.begin_recover_at(RecoverOptions { force: true }, 0);
        assert!(matches!(action, RecoverAction::Join(_)));
        machine.apply_join_success(reply);
    }

    // -----------------------------------------------------------------------
    // Recovery: debounce and queueing
    // -----------------------------------------------------------------------

    #[test]
    fn recover_within_debounce_window_is_dropped() {
        let mut machine = TaskStateMachine::new(1);
        let first = machine.begin_recover_at(RecoverOptions::default(), 0);
        assert!(matches!(first, RecoverAction::Join(_)));
        machine.apply_join_success(JoinReply::default());

        let second = machine.begin_recover_at(RecoverOptions::default(), 500);
        assert_eq!(second, RecoverAction::Debounced);

        let third = machine.begin_recover_at(RecoverOptions::default(), 1500);
        assert!(matches!(third, RecoverAction::Join(_)));
    }

    #[test]
    fn forced_recover_bypasses_debounce() {
        let mut machine = TaskStateMachine::new(1);
        machine.begin_recover_at(RecoverOptions::default(), 0);
        machine.apply_join_success(JoinReply::default());

        let action = machine.begin_recover_at(RecoverOptions { force: true }, 100);
        assert!(matches!(action, RecoverAction::Join(_)));
    }

    #[test]
    fn recover_during_join_is_queued_and_handed_back() {
        let mut machine = TaskStateMachine::new(1);
        machine.begin_recover_at(RecoverOptions::default(), 0);
        assert_eq!(machine.status(), TaskStatus::Joining);

        let queued = machine.begin_recover_at(RecoverOptions { force: true }, 10);
        assert_eq!(queued, RecoverAction::Queued);
        // Last one wins.
        let queued = machine.begin_recover_at(RecoverOptions { force: false }, 20);
        assert_eq!(queued, RecoverAction::Queued);

        let handed_back = machine.apply_join_success(JoinReply::default());
        assert_eq!(handed_back, Some(RecoverOptions { force: false }));
        // Consumed exactly once.
        assert!(machine.apply_join_success(JoinReply::default()).is_none());
    }

    #[test]
    fn first_recover_joins_later_recovers_sync() {
        let mut machine = TaskStateMachine::new(1);
        machine.begin_recover_at(RecoverOptions::default(), 0);
        assert_eq!(machine.status(), TaskStatus::Joining);
        machine.apply_join_success(JoinReply::default());
        assert_eq!(machine.status(), TaskStatus::Ready);

        machine.begin_recover_at(RecoverOptions { force: true }, 2000);
        assert_eq!(machine.status(), TaskStatus::Syncing);
    }

    #[test]
    fn incremental_resync_uses_high_water_mark() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![
                    user_subtask(1, "q", 16),
                    ai_subtask(2, "COMPLETED", Some("a"), Some(17)),
                ]),
                ..Default::default()
            },
        );

        let action = machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        match action {
            RecoverAction::Join(options) => {
                assert!(options.force_refresh);
                assert_eq!(options.after_message_id, Some(17));
            }
            other => panic!("expected Join, got {other:?}"),
        }

        // Scenario: the reply holds only rows past the watermark.
        machine.apply_join_success(JoinReply {
            subtasks: Some(vec![
                user_subtask(3, "next", 18),
                ai_subtask(4, "COMPLETED", Some("reply"), Some(19)),
            ]),
            ..Default::default()
        });

        assert_eq!(machine.message_count(), 4);
        assert_eq!(machine.max_known_message_id(), Some(19));
        // Existing rows untouched.
        assert_eq!(machine.message("ai-2").unwrap().header().content, "a");
    }

    #[test]
    fn join_failure_enters_error_and_recover_retries() {
        let mut machine = TaskStateMachine::new(1);
        machine.begin_recover_at(RecoverOptions::default(), 0);
        machine.apply_join_failure("room unavailable");

        assert_eq!(machine.status(), TaskStatus::Error);
        assert_eq!(machine.error_message(), Some("room unavailable"));

        let action = machine.begin_recover_at(RecoverOptions { force: true }, 10);
        assert!(matches!(action, RecoverAction::Join(_)));
        assert_eq!(machine.status(), TaskStatus::Syncing);
        machine.apply_join_success(JoinReply::default());
        assert_eq!(machine.status(), TaskStatus::Ready);
        assert!(machine.error_message().is_none());
    }

    #[test]
    fn join_reply_carrying_error_is_a_failure() {
        let mut machine = TaskStateMachine::new(1);
        machine.begin_recover_at(RecoverOptions::default(), 0);
        machine.apply_join_success(JoinReply {
            error: Some("task not found".into()),
            ..Default::default()
        });
        assert_eq!(machine.status(), TaskStatus::Error);
    }

    // -----------------------------------------------------------------------
    // Streaming lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn happy_path_stream_builds_one_message() {
        let mut machine = TaskStateMachine::new(42);
        joined(&mut machine, JoinReply::default());

        let local = "user-local-1";
        machine.add_pending_user_message(local, "hi", PendingMessageOptions::default());
        machine.confirm_user_message(local, 99, 1);

        machine.handle_event(start(100));
        assert_eq!(machine.status(), TaskStatus::Streaming);
        assert_eq!(machine.streaming_subtask_id(), Some(100));

        machine.handle_event(chunk(100, "He"));
        machine.handle_event(chunk(100, "llo"));
        machine.handle_event(done(100, Some(2)));

        assert_eq!(machine.status(), TaskStatus::Ready);
        assert!(machine.streaming_subtask_id().is_none());

        let ordered = machine.ordered_messages();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].header().content, "hi");
        assert_eq!(ordered[0].header().status, MessageStatus::Completed);
        assert_eq!(ordered[1].header().content, "Hello");
        assert_eq!(ordered[1].header().status, MessageStatus::Completed);
        assert_eq!(ordered[1].header().message_id, Some(2));
    }

    #[test]
    fn at_most_one_streaming_assistant_message() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "first"));
        machine.handle_event(start(101));

        let streaming: Vec<_> = machine
            .ordered_messages()
            .into_iter()
            .filter(|m| m.is_streaming_ai())
            .collect();
        assert_eq!(streaming.len(), 1);
        assert_eq!(streaming[0].header().subtask_id, Some(101));
        assert_eq!(machine.streaming_subtask_id(), Some(101));
    }

    #[test]
    fn chunk_for_unknown_subtask_is_dropped() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(chunk(555, "lost"));
        assert_eq!(machine.message_count(), 0);
        assert_eq!(machine.status(), TaskStatus::Ready);
    }

    #[test]
    fn chunk_after_done_never_mutates_content() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "final"));
        machine.handle_event(done(100, Some(5)));
        machine.handle_event(chunk(100, " stale"));

        assert_eq!(machine.message("ai-100").unwrap().header().content, "final");
    }

    #[test]
    fn done_without_start_synthesizes_completed_slot() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(ChatEvent::Done {
            subtask_id: 100,
            content: Some("full answer".into()),
            result: None,
            message_id: Some(8),
            sources: None,
            has_error: false,
            error_message: None,
        });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Completed);
        assert_eq!(message.header().content, "full answer");
        assert_eq!(message.header().message_id, Some(8));
    }

    #[test]
    fn replayed_stream_sequence_is_idempotent() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        let sequence = || {
            vec![
                start(100),
                chunk(100, "He"),
                chunk(100, "llo"),
                done(100, Some(2)),
            ]
        };

        for event in sequence() {
            machine.handle_event(event);
        }
        let first_pass = machine.message("ai-100").unwrap().clone();

        for event in sequence() {
            machine.handle_event(event);
        }
        let second_pass = machine.message("ai-100").unwrap();

        assert_eq!(second_pass.header().content, first_pass.header().content);
        assert_eq!(second_pass.header().status, first_pass.header().status);
        assert_eq!(second_pass.header().message_id, first_pass.header().message_id);
        assert_eq!(machine.message_count(), 1);
    }

    #[test]
    fn chat_error_marks_slot_and_machine() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(ChatEvent::Error {
            subtask_id: 100,
            error: "model exploded".into(),
            message_id: Some(3),
        });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Error);
        assert_eq!(message.header().error.as_deref(), Some("model exploded"));
        assert_eq!(machine.status(), TaskStatus::Error);
        assert!(machine.streaming_subtask_id().is_none());
    }

    #[test]
    fn cancel_keeps_accumulated_content() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "Hel"));
        machine.set_stopping(true);
        machine.handle_event(ChatEvent::Cancelled { subtask_id: 100 });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Completed);
        assert_eq!(message.header().content, "Hel");
        assert_eq!(
            message.as_ai().unwrap().subtask_status,
            Some(SubtaskState::Cancelled)
        );
        assert_eq!(machine.status(), TaskStatus::Ready);
        assert!(!machine.is_stopping());
    }

    #[test]
    fn chunk_with_block_id_accumulates_blocks_and_content() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(ChatEvent::Chunk {
            subtask_id: 100,
            content: "He".into(),
            result: None,
            sources: None,
            block_id: Some("b1".into()),
        });
        machine.handle_event(ChatEvent::Chunk {
            subtask_id: 100,
            content: "llo".into(),
            result: None,
            sources: None,
            block_id: Some("b1".into()),
        });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().content, "Hello");
        let blocks = &message.as_ai().unwrap().result.as_ref().unwrap().blocks;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "Hello");
    }

    #[test]
    fn reasoning_chunks_accumulate() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());
        machine.handle_event(start(100));

        let reasoning = |text: &str| ChatEvent::Chunk {
            subtask_id: 100,
            content: String::new(),
            result: Some(SubtaskResult {
                reasoning_chunk: Some(text.into()),
                ..Default::default()
            }),
            sources: None,
            block_id: None,
        };
        machine.handle_event(reasoning("thinking"));
        machine.handle_event(reasoning(" harder"));

        let message = machine.message("ai-100").unwrap();
        assert_eq!(
            message.as_ai().unwrap().reasoning_content.as_deref(),
            Some("thinking harder")
        );
    }

    #[test]
    fn tool_block_replaces_by_id() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());
        machine.handle_event(start(100));

        let tool_chunk = |status: &str| {
            let block: Block = serde_json::from_value(json!({
                "id": "t1", "type": "tool_use", "content": "", "status": status
            }))
            .unwrap();
            ChatEvent::Chunk {
                subtask_id: 100,
                content: String::new(),
                result: Some(SubtaskResult {
                    blocks: vec![block],
                    ..Default::default()
                }),
                sources: None,
                block_id: None,
            }
        };
        machine.handle_event(tool_chunk("running"));
        machine.handle_event(tool_chunk("done"));

        let message = machine.message("ai-100").unwrap();
        let blocks = &message.as_ai().unwrap().result.as_ref().unwrap().blocks;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].status.as_deref(), Some("done"));
    }

    // -----------------------------------------------------------------------
    // Pending chunks across a sync
    // -----------------------------------------------------------------------

    #[test]
    fn chunks_during_sync_are_buffered_and_replayed_in_order() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        assert_eq!(machine.status(), TaskStatus::Syncing);

        machine.handle_event(chunk(100, "X"));
        machine.handle_event(chunk(100, "Y"));
        assert_eq!(machine.pending_chunk_count(), 2);

        machine.apply_join_success(JoinReply {
            streaming: Some(StreamingInfo {
                subtask_id: 100,
                offset: 0,
                cached_content: "He".into(),
            }),
            subtasks: Some(vec![ai_subtask(100, "RUNNING", Some("He"), None)]),
            ..Default::default()
        });

        assert_eq!(machine.pending_chunk_count(), 0);
        assert_eq!(machine.message("ai-100").unwrap().header().content, "HeXY");
        assert_eq!(machine.status(), TaskStatus::Streaming);
    }

    #[test]
    fn done_buffered_during_sync_settles_to_ready() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.handle_event(done(100, Some(4)));

        machine.apply_join_success(JoinReply {
            streaming: Some(StreamingInfo {
                subtask_id: 100,
                offset: 0,
                cached_content: "Hello".into(),
            }),
            subtasks: Some(vec![ai_subtask(100, "RUNNING", Some("Hello"), None)]),
            ..Default::default()
        });

        // The buffered finalizer ran after the merge entered streaming.
        assert_eq!(machine.status(), TaskStatus::Ready);
        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Completed);
        assert_eq!(message.header().message_id, Some(4));
    }

    // -----------------------------------------------------------------------
    // Content-priority merge
    // -----------------------------------------------------------------------

    #[test]
    fn mid_stream_refresh_prefers_longest_content() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "Hello"));

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(JoinReply {
            streaming: Some(StreamingInfo {
                subtask_id: 100,
                offset: 11,
                cached_content: "Hello world".into(),
            }),
            subtasks: Some(vec![ai_subtask(100, "RUNNING", Some("Hel"), None)]),
            ..Default::default()
        });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().content, "Hello world");
        assert_eq!(machine.status(), TaskStatus::Streaming);
        assert_eq!(machine.streaming_subtask_id(), Some(100));

        // Later chunks keep appending to the reconciled content.
        machine.handle_event(chunk(100, "!"));
        assert_eq!(machine.message("ai-100").unwrap().header().content, "Hello world!");
    }

    #[test]
    fn local_content_wins_when_longer_than_cache() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "Hello world and more"));

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(JoinReply {
            streaming: Some(StreamingInfo {
                subtask_id: 100,
                offset: 5,
                cached_content: "Hello".into(),
            }),
            subtasks: Some(vec![ai_subtask(100, "RUNNING", Some("He"), None)]),
            ..Default::default()
        });

        assert_eq!(
            machine.message("ai-100").unwrap().header().content,
            "Hello world and more"
        );
    }

    #[test]
    fn merge_skips_pending_placeholders() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![ai_subtask(100, "PENDING", None, None)]),
                ..Default::default()
            },
        );
        assert_eq!(machine.message_count(), 0);
    }

    #[test]
    fn merge_maps_failed_and_cancelled_to_error() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![
                    ai_subtask(10, "FAILED", Some("partial"), Some(1)),
                    ai_subtask(11, "CANCELLED", Some("stopped"), Some(2)),
                ]),
                ..Default::default()
            },
        );

        assert_eq!(
            machine.message("ai-10").unwrap().header().status,
            MessageStatus::Error
        );
        assert_eq!(
            machine.message("ai-11").unwrap().header().status,
            MessageStatus::Error
        );
    }

    #[test]
    fn merge_never_downgrades_terminal_slot() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(start(100));
        machine.handle_event(chunk(100, "final answer"));
        machine.handle_event(done(100, Some(3)));

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        // Stale snapshot still believes the subtask is running.
        machine.apply_join_success(JoinReply {
            subtasks: Some(vec![ai_subtask(100, "RUNNING", Some("fin"), Some(3))]),
            ..Default::default()
        });

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Completed);
        assert_eq!(message.header().content, "final answer");
        assert_eq!(machine.status(), TaskStatus::Ready);
    }

    #[test]
    fn merge_is_idempotent() {
        let reply = JoinReply {
            subtasks: Some(vec![
                user_subtask(1, "question", 1),
                ai_subtask(2, "COMPLETED", Some("answer"), Some(2)),
                ai_subtask(3, "RUNNING", Some("part"), None),
            ]),
            streaming: Some(StreamingInfo {
                subtask_id: 3,
                offset: 4,
                cached_content: "parti".into(),
            }),
            ..Default::default()
        };

        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, reply.clone());
        let first: Vec<_> = machine
            .ordered_messages()
            .iter()
            .map(|m| (m.header().id.clone(), m.header().content.clone(), m.header().status))
            .collect();

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(reply);
        let second: Vec<_> = machine
            .ordered_messages()
            .iter()
            .map(|m| (m.header().id.clone(), m.header().content.clone(), m.header().status))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn streaming_info_without_snapshot_row_synthesizes_slot() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                streaming: Some(StreamingInfo {
                    subtask_id: 100,
                    offset: 11,
                    cached_content: "Hello world".into(),
                }),
                subtasks: Some(vec![]),
                ..Default::default()
            },
        );

        let message = machine.message("ai-100").unwrap();
        assert_eq!(message.header().status, MessageStatus::Streaming);
        assert_eq!(message.header().content, "Hello world");
        assert_eq!(machine.status(), TaskStatus::Streaming);
        assert_eq!(machine.streaming_subtask_id(), Some(100));
    }

    // -----------------------------------------------------------------------
    // Optimistic sends
    // -----------------------------------------------------------------------

    #[test]
    fn pending_message_sorts_last_until_confirmed() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![
                    user_subtask(1, "old", 1),
                    ai_subtask(2, "COMPLETED", Some("answer"), Some(2)),
                ]),
                ..Default::default()
            },
        );

        machine.add_pending_user_message("user-local-9", "new question", PendingMessageOptions::default());

        let ordered = machine.ordered_messages();
        assert_eq!(ordered.last().unwrap().header().id, "user-local-9");
        assert_eq!(ordered.last().unwrap().header().status, MessageStatus::Pending);

        machine.confirm_user_message("user-local-9", 5, 3);
        let ordered = machine.ordered_messages();
        let confirmed = ordered.last().unwrap();
        assert_eq!(confirmed.header().status, MessageStatus::Completed);
        assert_eq!(confirmed.header().subtask_id, Some(5));
        assert_eq!(confirmed.header().message_id, Some(3));
    }

    #[test]
    fn snapshot_does_not_duplicate_confirmed_send() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.add_pending_user_message("user-local-1", "hi", PendingMessageOptions::default());
        machine.confirm_user_message("user-local-1", 99, 1);

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(JoinReply {
            subtasks: Some(vec![user_subtask(99, "hi", 1)]),
            ..Default::default()
        });

        assert_eq!(machine.message_count(), 1);
    }

    #[test]
    fn unconfirmed_sends_survive_resync() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.add_pending_user_message("user-local-2", "still typing", PendingMessageOptions::default());

        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(JoinReply {
            subtasks: Some(vec![user_subtask(1, "other", 1)]),
            ..Default::default()
        });

        let pending = machine.message("user-local-2").unwrap();
        assert_eq!(pending.header().status, MessageStatus::Pending);
        assert_eq!(machine.message_count(), 2);
    }

    #[test]
    fn failed_send_is_marked() {
        let mut machine = TaskStateMachine::new(1);
        machine.add_pending_user_message("user-local-3", "hi", PendingMessageOptions::default());
        machine.mark_user_message_error("user-local-3", "network down");

        let message = machine.message("user-local-3").unwrap();
        assert_eq!(message.header().status, MessageStatus::Error);
        assert_eq!(message.header().error.as_deref(), Some("network down"));
    }

    // -----------------------------------------------------------------------
    // Peer messages (group chat)
    // -----------------------------------------------------------------------

    #[test]
    fn peer_message_inserts_completed_user_message() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());

        machine.handle_event(ChatEvent::Message {
            subtask_id: 50,
            content: "hello from a colleague".into(),
            message_id: 6,
            sender_user_id: Some(7),
            sender_user_name: Some("dana".into()),
            contexts: vec![],
        });

        let message = machine.message("user-backend-50").unwrap();
        assert_eq!(message.header().status, MessageStatus::Completed);
        assert_eq!(message.header().message_id, Some(6));
        match message {
            TaskMessage::User { user, .. } => {
                assert!(user.should_show_sender);
                assert_eq!(user.sender_user_name.as_deref(), Some("dana"));
            }
            other => panic!("expected user message, got {other:?}"),
        }

        // Snapshot double-observation of the same subtask merges, not dupes.
        machine.begin_recover_at(RecoverOptions { force: true }, 5000);
        machine.apply_join_success(JoinReply {
            subtasks: Some(vec![user_subtask(50, "hello from a colleague", 6)]),
            ..Default::default()
        });
        assert_eq!(machine.message_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Edit cascade and pagination
    // -----------------------------------------------------------------------

    #[test]
    fn edit_cascade_drops_tail_from_edited_message() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![
                    user_subtask(1, "first", 1),
                    ai_subtask(2, "COMPLETED", Some("a1"), Some(2)),
                    user_subtask(3, "second", 3),
                    ai_subtask(4, "COMPLETED", Some("a2"), Some(4)),
                ]),
                ..Default::default()
            },
        );

        machine.cleanup_messages_after_edit(3);

        let remaining: Vec<i64> = machine
            .ordered_messages()
            .iter()
            .filter_map(|m| m.header().message_id)
            .collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[test]
    fn edit_cascade_keeps_uncommitted_messages() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![
                    user_subtask(1, "first", 1),
                    user_subtask(3, "second", 3),
                ]),
                ..Default::default()
            },
        );
        machine.add_pending_user_message("user-local-4", "draft", PendingMessageOptions::default());

        machine.cleanup_messages_after_edit(3);

        assert!(machine.message("user-local-4").is_some());
        assert!(machine.message("user-backend-3").is_none());
    }

    #[test]
    fn older_messages_never_overwrite_existing() {
        let mut machine = TaskStateMachine::new(1);
        joined(
            &mut machine,
            JoinReply {
                subtasks: Some(vec![ai_subtask(2, "COMPLETED", Some("fresh"), Some(2))]),
                ..Default::default()
            },
        );

        let mut stale_header = MessageHeader::new("ai-2", MessageStatus::Completed, "stale");
        stale_header.message_id = Some(2);
        let mut old_header = MessageHeader::new("ai-1", MessageStatus::Completed, "history");
        old_header.message_id = Some(1);
        machine.merge_older_messages(vec![
            TaskMessage::ai(stale_header, AiMessage::default()),
            TaskMessage::ai(old_header, AiMessage::default()),
        ]);

        assert_eq!(machine.message("ai-2").unwrap().header().content, "fresh");
        assert_eq!(machine.message("ai-1").unwrap().header().content, "history");
    }

    #[test]
    fn leave_returns_to_idle() {
        let mut machine = TaskStateMachine::new(1);
        joined(&mut machine, JoinReply::default());
        machine.handle_event(start(100));

        machine.leave();
        assert_eq!(machine.status(), TaskStatus::Idle);
        assert!(machine.streaming_subtask_id().is_none());
        assert_eq!(machine.pending_chunk_count(), 0);
    }
}
