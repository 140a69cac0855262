//! Per-task correction-mode settings.
//!
//! The enabled flag, the chosen evaluator model, and the web-search flag are
//! persisted in the local key-value store, keyed by task id. A "new chat"
//! placeholder uses the `new` key until the server assigns a real task id,
//! at which point the record migrates, the same idiom as temporary task ids
//! in the state manager.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use wegent_core::kv::KvStore;

const MODE_KEY_PREFIX: &str = "wegent_correction_mode_task_";

/// The storage key for a task's correction-mode record. `None` is the "new
/// chat" placeholder.
pub fn correction_mode_key(task_id: Option<i64>) -> String {
    match task_id {
        Some(task_id) => format!("{MODE_KEY_PREFIX}{task_id}"),
        None => format!("{MODE_KEY_PREFIX}new"),
    }
}

/// Correction settings for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionMode {
    pub enabled: bool,
    pub correction_model_id: Option<i64>,
    pub correction_model_name: Option<String>,
    pub enable_web_search: bool,
}

/// Store for per-task correction-mode records.
pub struct CorrectionModeStore {
    kv: Arc<Mutex<KvStore>>,
}

impl CorrectionModeStore {
    pub fn new(kv: Arc<Mutex<KvStore>>) -> Self {
        Self { kv }
    }

    /// The task's settings; defaults when absent or unreadable.
    pub fn load(&self, task_id: Option<i64>) -> CorrectionMode {
        self.kv
            .lock()
            .get_json(&correction_mode_key(task_id))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    /// Persist the task's settings.
    pub fn save(&self, task_id: Option<i64>, mode: &CorrectionMode) -> Result<()> {
        self.kv.lock().set_json(&correction_mode_key(task_id), mode)
    }

    /// Remove the task's settings.
    pub fn clear(&self, task_id: Option<i64>) -> Result<()> {
        self.kv.lock().remove(&correction_mode_key(task_id))
    }

    /// Move a record to a new task id, e.g. when the "new chat" placeholder
    /// is replaced by the server-assigned id. A missing source is a no-op;
    /// an existing destination record is preserved.
    pub fn migrate(&self, from: Option<i64>, to: i64) -> Result<()> {
        let kv = self.kv.lock();
        let from_key = correction_mode_key(from);
        let to_key = correction_mode_key(Some(to));

        let Some(record) = kv.get(&from_key)? else {
            return Ok(());
        };
        if kv.get(&to_key)?.is_none() {
            kv.set(&to_key, &record)?;
            debug!("Migrated correction mode {from_key} -> {to_key}");
        }
        kv.remove(&from_key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
