//! The correction engine.
//!
//! For each completed assistant reply (when correction mode is enabled for
//! the task with a chosen evaluator model) the engine submits the original
//! question/answer pair for evaluation, caches the result in memory and on
//! the message's structured result, and supports applying the improved
//! answer in place, undoing it, and forcing a re-evaluation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use wegent_api::client::{ApiClient, ApiError};
use wegent_task::manager::TaskStateManager;
use wegent_task::message::{MessageStatus, TaskMessage};

use crate::mode::CorrectionMode;
use crate::types::CorrectionResult;

const CORRECTION_PATH: &str = "/chat/correction";
const CORRECTION_APPLY_PATH: &str = "/chat/correction/apply";
const CORRECTION_UNDO_PATH: &str = "/chat/correction/undo";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CorrectionError {
    #[error("Correction mode is not enabled for this task")]
    Disabled,

    #[error("Message is not eligible for correction: {0}")]
    NotEligible(String),

    #[error("No correction result for this message")]
    NoResult,

    #[error("Correction request failed: {0}")]
    Api(String),
}

impl From<ApiError> for CorrectionError {
    fn from(e: ApiError) -> Self {
        Self::Api(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire types and the API seam
// ---------------------------------------------------------------------------

/// Body of an evaluation request.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionRequest {
    pub task_id: i64,
    pub message_id: i64,
    pub original_question: String,
    pub original_answer: String,
    pub correction_model_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_retry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_web_search: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ApplyRequest<'a> {
    subtask_id: i64,
    improved_answer: &'a str,
}

#[derive(Debug, Serialize)]
struct UndoRequest {
    subtask_id: i64,
}

#[derive(Debug, Deserialize)]
struct UndoReply {
    original_value: String,
}

/// The HTTP surface the engine talks to; injected so the engine can be
/// driven without a server.
#[async_trait]
pub trait CorrectionApi: Send + Sync {
    async fn evaluate(
        &self,
        request: &CorrectionRequest,
    ) -> Result<CorrectionResult, CorrectionError>;

    /// Persist the improved answer as the visible content. The server keeps
    /// the original value for reversal.
    async fn apply(&self, subtask_id: i64, improved_answer: &str) -> Result<(), CorrectionError>;

    /// Restore the server-kept original; returns it for local display.
    async fn undo(&self, subtask_id: i64) -> Result<String, CorrectionError>;
}

/// The production implementation over the shared [`ApiClient`].
pub struct HttpCorrectionApi {
    client: Arc<ApiClient>,
}

impl HttpCorrectionApi {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CorrectionApi for HttpCorrectionApi {
    async fn evaluate(
        &self,
        request: &CorrectionRequest,
    ) -> Result<CorrectionResult, CorrectionError> {
        let reply: Option<CorrectionResult> = self.client.post(CORRECTION_PATH, request).await?;
        reply.ok_or(CorrectionError::NoResult)
    }

    async fn apply(&self, subtask_id: i64, improved_answer: &str) -> Result<(), CorrectionError> {
        let body = ApplyRequest {
            subtask_id,
            improved_answer,
        };
        let _: Option<serde_json::Value> = self.client.post(CORRECTION_APPLY_PATH, &body).await?;
        Ok(())
    }

    async fn undo(&self, subtask_id: i64) -> Result<String, CorrectionError> {
        let reply: Option<UndoReply> = self
            .client
            .post(CORRECTION_UNDO_PATH, &UndoRequest { subtask_id })
            .await?;
        Ok(reply.ok_or(CorrectionError::NoResult)?.original_value)
    }
}

// ---------------------------------------------------------------------------
// CorrectionEngine
// ---------------------------------------------------------------------------

/// Per-message second opinions, keyed by subtask id.
pub struct CorrectionEngine {
    api: Arc<dyn CorrectionApi>,
    manager: TaskStateManager,
    /// Subtasks already submitted once; prevents retry storms.
    attempted: Mutex<HashSet<i64>>,
    cache: Mutex<HashMap<i64, CorrectionResult>>,
}

impl CorrectionEngine {
    pub fn new(api: Arc<dyn CorrectionApi>, manager: TaskStateManager) -> Self {
        Self {
            api,
            manager,
            attempted: Mutex::new(HashSet::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The cached result for a subtask, if an evaluation already ran.
    pub fn cached(&self, subtask_id: i64) -> Option<CorrectionResult> {
        self.cache.lock().get(&subtask_id).cloned()
    }

    /// Evaluate a completed assistant reply. Returns the cached result on a
    /// repeated call; a subtask is only submitted once unless retried.
    pub async fn evaluate(
        &self,
        task_id: i64,
        subtask_id: i64,
        mode: &CorrectionMode,
    ) -> Result<CorrectionResult, CorrectionError> {
        self.evaluate_inner(task_id, subtask_id, mode, false).await
    }

    /// Clear the cached result and attempted flag, then re-evaluate with
    /// `force_retry` so the server bypasses its own cache too.
    pub async fn retry(
        &self,
        task_id: i64,
        subtask_id: i64,
        mode: &CorrectionMode,
    ) -> Result<CorrectionResult, CorrectionError> {
        self.cache.lock().remove(&subtask_id);
        self.attempted.lock().remove(&subtask_id);
        self.evaluate_inner(task_id, subtask_id, mode, true).await
    }

    /// Replace the visible assistant content with the improved answer.
    pub async fn apply(&self, task_id: i64, subtask_id: i64) -> Result<(), CorrectionError> {
        let improved = self
            .cached(subtask_id)
            .ok_or(CorrectionError::NoResult)?
            .improved_answer;
        if improved.is_empty() {
            return Err(CorrectionError::NoResult);
        }

        self.api.apply(subtask_id, &improved).await?;
        self.rewrite_content(task_id, subtask_id, &improved, true);
        Ok(())
    }

    /// Restore the original answer the server kept on apply.
    pub async fn undo(&self, task_id: i64, subtask_id: i64) -> Result<(), CorrectionError> {
        let original = self.api.undo(subtask_id).await?;
        self.rewrite_content(task_id, subtask_id, &original, false);
        Ok(())
    }

    // -- Internals -----------------------------------------------------------

    async fn evaluate_inner(
        &self,
        task_id: i64,
        subtask_id: i64,
        mode: &CorrectionMode,
        force_retry: bool,
    ) -> Result<CorrectionResult, CorrectionError> {
        if !mode.enabled {
            return Err(CorrectionError::Disabled);
        }
        let Some(model_id) = mode.correction_model_id else {
            return Err(CorrectionError::Disabled);
        };

        if let Some(cached) = self.cached(subtask_id) {
            return Ok(cached);
        }

        let (question, answer, message_id) = self.eligible_pair(task_id, subtask_id)?;

        if !self.attempted.lock().insert(subtask_id) {
            // Already in flight or failed once; do not hammer the endpoint.
            debug!("Correction for subtask {subtask_id} already attempted");
            return Err(CorrectionError::NoResult);
        }

        let request = CorrectionRequest {
            task_id,
            message_id,
            original_question: question,
            original_answer: answer,
            correction_model_id: model_id,
            force_retry: force_retry.then_some(true),
            enable_web_search: mode.enable_web_search.then_some(true),
        };

        let result = self.api.evaluate(&request).await?;

        self.cache.lock().insert(subtask_id, result.clone());
        if let Some(machine) = self.manager.machine(task_id) {
            match serde_json::to_value(&result) {
                Ok(value) => machine.lock().set_correction(subtask_id, value),
                Err(e) => warn!("Correction record not serializable: {e}"),
            }
        }

        Ok(result)
    }

    /// The question/answer pair for an eligible reply, plus its message id.
    fn eligible_pair(
        &self,
        task_id: i64,
        subtask_id: i64,
    ) -> Result<(String, String, i64), CorrectionError> {
        let machine = self
            .manager
            .machine(task_id)
            .ok_or_else(|| CorrectionError::NotEligible("unknown task".into()))?;
        let machine = machine.lock();

        let message = machine
            .ai_message_by_subtask(subtask_id)
            .ok_or_else(|| CorrectionError::NotEligible("unknown subtask".into()))?;

        let header = message.header();
        if header.status != MessageStatus::Completed {
            return Err(CorrectionError::NotEligible("reply is not completed".into()));
        }
        if header.content.is_empty() {
            return Err(CorrectionError::NotEligible("reply is empty".into()));
        }
        if header.error.is_some() {
            return Err(CorrectionError::NotEligible("reply carries an error".into()));
        }
        let message_id = header
            .message_id
            .ok_or_else(|| CorrectionError::NotEligible("reply not committed yet".into()))?;

        // The original question: the closest preceding user message.
        let ordered = machine.ordered_messages();
        let position = ordered
            .iter()
            .position(|m| m.header().id == header.id)
            .unwrap_or(0);
        let question = ordered[..position]
            .iter()
            .rev()
            .find(|m| matches!(m, TaskMessage::User { .. }))
            .map(|m| m.header().content.clone())
            .unwrap_or_default();

        Ok((question, header.content.clone(), message_id))
    }

    fn rewrite_content(&self, task_id: i64, subtask_id: i64, content: &str, applied: bool) {
        if let Some(machine) = self.manager.machine(task_id) {
            machine.lock().replace_ai_content(subtask_id, content);
        }
        let mut cache = self.cache.lock();
        if let Some(result) = cache.get_mut(&subtask_id) {
            result.applied = applied;
            let updated = result.clone();
            drop(cache);
            if let Some(machine) = self.manager.machine(task_id) {
                if let Ok(value) = serde_json::to_value(&updated) {
                    machine.lock().set_correction(subtask_id, value);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
