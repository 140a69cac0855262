//! Second-opinion corrections for completed assistant replies.
//!
//! When correction mode is enabled for a task, each finished reply can be
//! evaluated by a chosen model: per-dimension scores, a list of issues with
//! suggestions, and an improved rewrite that can be applied in place (and
//! undone, since the server keeps the original). Runs alongside the task
//! state machine; results are cached on the message's structured result.

/// The engine: evaluate, apply, undo, retry.
pub mod engine;
/// Per-task correction-mode settings with temp-id migration.
pub mod mode;
/// Correction result shapes.
pub mod types;

pub use engine::{CorrectionApi, CorrectionEngine, CorrectionError, CorrectionRequest,
    HttpCorrectionApi};
pub use mode::{CorrectionMode, CorrectionModeStore, correction_mode_key};
pub use types::{CorrectionItem, CorrectionResult, CorrectionScores};
