use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a batch within Stage 2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One completed attack against one batch. The primary ROI record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttackResult {
    pub attack: String,
    pub new_cracks: u64,
    pub duration_seconds: u64,
    /// new_cracks / batch hashCount at completion time.
    pub crack_rate: f64,
}

/// Summary written by the feedback stage after it runs for a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSummary {
    pub new_roots: u64,
    pub cohort_matched: u64,
    pub oracle_promoted: u64,
    pub rules_added: u64,
    /// Cracks attributable to feedback-derived attacks in this batch.
    #[serde(default)]
    pub feedback_cracks: u64,
    pub ran_at: DateTime<Utc>,
}

/// Per-batch record in the Stage 2 state store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    /// Identifier assigned by the coordination service at hashlist registration.
    pub hashlist_id: Option<i64>,
    /// Hashes in the batch's SAND file at submission time.
    pub hash_count: u64,
    /// Attack names already run to completion, in execution order.
    pub attacks_applied: Vec<String>,
    /// Attack names not yet run, in execution order.
    pub attacks_remaining: Vec<String>,
    /// Attack name -> coordination-service task id.
    #[serde(default)]
    pub task_ids: BTreeMap<String, i64>,
    /// Total plaintexts recovered across applied attacks. Monotonic.
    pub cracked: u64,
    #[serde(default)]
    pub attack_results: Vec<AttackResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_attack_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackSummary>,
}

impl BatchRecord {
    pub fn is_fully_processed(&self) -> bool {
        self.status == BatchStatus::Completed && self.feedback.is_some()
    }
}

/// Cross-batch aggregate statistics for one attack.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttackStats {
    pub attempted: u64,
    pub total_cracked: u64,
    pub total_hashes: u64,
    /// totalCracked / totalHashes, recomputed on each update.
    pub avg_rate: f64,
    pub avg_time_seconds: f64,
}

impl AttackStats {
    /// Fold in one attack run against a batch of `hash_count` hashes.
    pub fn record(&mut self, cracked: u64, hash_count: u64, duration_seconds: u64) {
        let prev_attempts = self.attempted as f64;
        self.attempted += 1;
        self.total_cracked += cracked;
        self.total_hashes += hash_count;
        self.avg_rate = if self.total_hashes > 0 {
            self.total_cracked as f64 / self.total_hashes as f64
        } else {
            0.0
        };
        self.avg_time_seconds = (self.avg_time_seconds * prev_attempts
            + duration_seconds as f64)
            / self.attempted as f64;
    }

    /// Reorder score: effective crack rate normalized by GPU time, with a
    /// one-minute floor to avoid division explosions on brand-new attacks.
    pub fn roi_score(&self) -> f64 {
        self.avg_rate / self.avg_time_seconds.max(60.0)
    }
}

/// The Stage 2 state file (`sand-state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    /// Attack execution order consulted when initializing FUTURE batches.
    /// The in-memory `attacksRemaining` of a running batch is never affected.
    #[serde(default)]
    pub attack_order: Vec<String>,
    #[serde(default)]
    pub batches: BTreeMap<String, BatchRecord>,
    #[serde(default)]
    pub attack_stats: BTreeMap<String, AttackStats>,
}

/// Per-batch record in the Stage 1 state store (`gravel-state.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GravelBatchRecord {
    pub status: BatchStatus,
    pub hash_count: u64,
    pub pearl_count: u64,
    pub sand_count: u64,
    /// Percentage with two decimals, e.g. "30.00".
    pub crack_rate: String,
    pub duration_seconds: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The Stage 1 state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GravelState {
    #[serde(default)]
    pub batches: BTreeMap<String, GravelBatchRecord>,
}
