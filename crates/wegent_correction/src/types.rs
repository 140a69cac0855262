use serde::{Deserialize, Serialize};

/// Per-dimension evaluation scores for an assistant reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionScores {
    pub accuracy: f64,
    pub logic: f64,
    pub completeness: f64,
}

/// One identified issue and the reviewer model's suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionItem {
    pub issue: String,
    pub suggestion: String,
}

/// The full second-opinion record for one assistant reply. Persisted on the
/// message's structured result as `correction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResult {
    #[serde(default)]
    pub scores: CorrectionScores,
    #[serde(default)]
    pub corrections: Vec<CorrectionItem>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub improved_answer: String,
    #[serde(default)]
    pub is_correct: bool,
    /// Whether the improved answer currently replaces the visible content.
    #[serde(default)]
    pub applied: bool,
}
