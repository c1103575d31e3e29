use super::model::{
    AttackResult, AttackStats, BatchRecord, BatchStatus, GravelBatchRecord, GravelState,
    PipelineState,
};
use crate::errors::StateError;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Copy the existing file to `.bak` (if present), then write `json` through a
/// temp file and an atomic rename. A failed write leaves the `.bak` intact.
fn backup_and_write(path: &Path, json: &str) -> Result<(), StateError> {
    if path.exists() {
        let bak = path.with_extension("json.bak");
        fs::copy(path, &bak).map_err(|source| StateError::BackupFailed {
            path: bak,
            source,
        })?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|source| StateError::WriteFailed {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// The Stage 2 state store. Single-writer: the orchestrator exclusively owns
/// the record of the batch it is driving.
pub struct StateStore {
    path: PathBuf,
    state: PipelineState,
    dirty: bool,
    save_due: Option<Instant>,
}

impl StateStore {
    /// Read the state file if present. A missing or unparseable file yields a
    /// fresh default state with a warning; it is never an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PipelineState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "State file {} is unparseable ({}); starting fresh",
                        path.display(),
                        e
                    );
                    PipelineState::default()
                }
            },
            Err(_) => PipelineState::default(),
        };
        Self {
            path,
            state,
            dirty: false,
            save_due: None,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn batch(&self, name: &str) -> Option<&BatchRecord> {
        self.state.batches.get(name)
    }

    /// Persist now. Validation warnings are logged but never block the write.
    pub fn save(&mut self) -> Result<(), StateError> {
        for warning in self.validate() {
            warn!("state validation: {}", warning);
        }
        let json = serde_json::to_string_pretty(&self.state)
            .context("Failed to serialize pipeline state")?;
        backup_and_write(&self.path, &json)?;
        self.dirty = false;
        self.save_due = None;
        Ok(())
    }

    /// Coalesce rapid updates: mark the store dirty and schedule a save
    /// `delay` from now. The deadline is extended on each call; `flush` (or
    /// `flush_if_due` from the driver loop) performs the actual write.
    pub fn save_debounced(&mut self, delay: Duration) {
        self.dirty = true;
        self.save_due = Some(Instant::now() + delay);
    }

    /// Write out a pending debounced save whose deadline has passed.
    pub fn flush_if_due(&mut self) -> Result<(), StateError> {
        if let Some(due) = self.save_due {
            if Instant::now() >= due {
                return self.save();
            }
        }
        Ok(())
    }

    /// Unconditionally write out any pending changes. Called on shutdown.
    pub fn flush(&mut self) -> Result<(), StateError> {
        if self.dirty {
            return self.save();
        }
        Ok(())
    }

    /// Create a batch record with status `pending`. `attacksRemaining` is
    /// seeded from the compiled-in default order passed by the scheduler,
    /// NOT from the on-disk `attackOrder`, which may be stale.
    pub fn init_batch(
        &mut self,
        name: &str,
        hashlist_id: i64,
        hash_count: u64,
        default_order: &[&str],
    ) -> &BatchRecord {
        let record = BatchRecord {
            hashlist_id: Some(hashlist_id),
            hash_count,
            attacks_remaining: default_order.iter().map(|s| s.to_string()).collect(),
            started_at: Some(Utc::now()),
            status: BatchStatus::Pending,
            ..Default::default()
        };
        self.state.batches.insert(name.to_string(), record);
        self.dirty = true;
        &self.state.batches[name]
    }

    pub fn start_attack(
        &mut self,
        batch: &str,
        attack: &str,
        task_id: i64,
    ) -> Result<(), StateError> {
        let record = self
            .state
            .batches
            .get_mut(batch)
            .ok_or_else(|| StateError::UnknownBatch(batch.to_string()))?;
        record.status = BatchStatus::InProgress;
        record.task_ids.insert(attack.to_string(), task_id);
        record.last_attack_at = Some(Utc::now());
        self.dirty = true;
        Ok(())
    }

    /// Record a finished attack: move it from remaining to applied, append the
    /// ROI entry, bump the aggregate stats, and auto-complete the batch when
    /// nothing remains. A duplicate call for the same (batch, attack) is a
    /// logged no-op.
    pub fn complete_attack(
        &mut self,
        batch: &str,
        attack: &str,
        cracked_count: u64,
        duration_seconds: u64,
    ) -> Result<(), StateError> {
        let record = self
            .state
            .batches
            .get_mut(batch)
            .ok_or_else(|| StateError::UnknownBatch(batch.to_string()))?;

        if record.attacks_applied.iter().any(|a| a == attack) {
            info!("{}: attack {} already applied, skipping", batch, attack);
            return Ok(());
        }

        record.attacks_remaining.retain(|a| a != attack);
        record.attacks_applied.push(attack.to_string());
        let crack_rate = if record.hash_count > 0 {
            cracked_count as f64 / record.hash_count as f64
        } else {
            0.0
        };
        record.attack_results.push(AttackResult {
            attack: attack.to_string(),
            new_cracks: cracked_count,
            duration_seconds,
            crack_rate,
        });
        record.cracked += cracked_count;
        record.last_attack_at = Some(Utc::now());

        if record.attacks_remaining.is_empty() {
            record.status = BatchStatus::Completed;
            record.completed_at = Some(Utc::now());
        }

        let hash_count = record.hash_count;
        self.state
            .attack_stats
            .entry(attack.to_string())
            .or_insert_with(AttackStats::default)
            .record(cracked_count, hash_count, duration_seconds);

        self.dirty = true;
        Ok(())
    }

    pub fn fail_batch(&mut self, name: &str, error: &str) -> Result<(), StateError> {
        let record = self
            .state
            .batches
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownBatch(name.to_string()))?;
        record.status = BatchStatus::Failed;
        record.error = Some(error.to_string());
        self.dirty = true;
        Ok(())
    }

    pub fn set_feedback(
        &mut self,
        name: &str,
        summary: super::FeedbackSummary,
    ) -> Result<(), StateError> {
        let record = self
            .state
            .batches
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownBatch(name.to_string()))?;
        record.feedback = Some(summary);
        self.dirty = true;
        Ok(())
    }

    /// Rewrite the top-level attack order by descending ROI score. Consulted
    /// only when initializing future batches.
    pub fn apply_roi_reorder(&mut self) {
        let stats = &self.state.attack_stats;
        let mut order = self.state.attack_order.clone();
        order.sort_by(|a, b| {
            let sa = stats.get(a).map(AttackStats::roi_score).unwrap_or(0.0);
            let sb = stats.get(b).map(AttackStats::roi_score).unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        self.state.attack_order = order;
        self.dirty = true;
    }

    /// Attacks with at least three attempts and a negligible average crack
    /// rate. Reported for the operator; the scheduler never auto-drops.
    pub fn ineffective_attacks(&self) -> Vec<String> {
        self.state
            .attack_stats
            .iter()
            .filter(|(_, s)| s.attempted >= 3 && s.avg_rate < 0.001)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Best-effort invariant checks, run on every save.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (name, record) in &self.state.batches {
            for attack in &record.attacks_applied {
                if record.attacks_remaining.contains(attack) {
                    warnings.push(format!(
                        "{}: attack {} present in both applied and remaining",
                        name, attack
                    ));
                }
            }
            if record.cracked > record.hash_count {
                warnings.push(format!(
                    "{}: cracked {} exceeds hashCount {}",
                    name, record.cracked, record.hash_count
                ));
            }
            if record.status == BatchStatus::Completed {
                if record.completed_at.is_none() {
                    warnings.push(format!("{}: completed without completedAt", name));
                }
                if !record.attacks_remaining.is_empty() {
                    warnings.push(format!(
                        "{}: completed with {} attacks remaining",
                        name,
                        record.attacks_remaining.len()
                    ));
                }
            }
            let result_attacks: Vec<&String> =
                record.attack_results.iter().map(|r| &r.attack).collect();
            let applied: Vec<&String> = record.attacks_applied.iter().collect();
            if result_attacks != applied {
                warnings.push(format!(
                    "{}: attackResults do not align with attacksApplied",
                    name
                ));
            }
            if record.cracked == 0 && !record.attacks_applied.is_empty() {
                warnings.push(format!(
                    "{}: zero cracks after {} attacks (suspicious, not fatal)",
                    name,
                    record.attacks_applied.len()
                ));
            }
        }
        warnings
    }

    pub fn state_mut(&mut self) -> &mut PipelineState {
        self.dirty = true;
        &mut self.state
    }
}

/// The Stage 1 state store. Smaller record type, same write discipline.
pub struct GravelStore {
    path: PathBuf,
    state: GravelState,
}

impl GravelStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(
                    "Gravel state {} is unparseable ({}); starting fresh",
                    path.display(),
                    e
                );
                GravelState::default()
            }),
            Err(_) => GravelState::default(),
        };
        Self { path, state }
    }

    pub fn batch(&self, name: &str) -> Option<&GravelBatchRecord> {
        self.state.batches.get(name)
    }

    pub fn record_batch(&mut self, name: &str, record: GravelBatchRecord) {
        self.state.batches.insert(name.to_string(), record);
    }

    pub fn save(&self) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(&self.state)
            .context("Failed to serialize gravel state")?;
        backup_and_write(&self.path, &json)
    }

    pub fn state(&self) -> &GravelState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ORDER: &[&str] = &["brute-3", "brute-4", "brute-6"];

    fn store_in(dir: &Path) -> StateStore {
        StateStore::load(dir.join("sand-state.json"))
    }

    #[test]
    fn test_load_missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.state().batches.is_empty());
    }

    #[test]
    fn test_load_unparseable_file_yields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sand-state.json");
        fs::write(&path, "{ not json").unwrap();
        let store = StateStore::load(&path);
        assert!(store.state().batches.is_empty());
    }

    #[test]
    fn test_init_batch_seeds_from_passed_order_not_disk_order() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        // A stale on-disk order must not leak into new batches.
        store.state_mut().attack_order = vec!["stale-attack".to_string()];
        store.init_batch("batch-0001", 10, 500_000, ORDER);
        let record = store.batch("batch-0001").unwrap();
        assert_eq!(record.attacks_remaining, ORDER);
        assert_eq!(record.status, BatchStatus::Pending);
        assert_eq!(record.hashlist_id, Some(10));
    }

    #[test]
    fn test_complete_attack_moves_exactly_one_entry() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.init_batch("batch-0001", 10, 1000, ORDER);
        store.complete_attack("batch-0001", "brute-3", 42, 90).unwrap();

        let record = store.batch("batch-0001").unwrap();
        assert_eq!(record.attacks_applied, vec!["brute-3"]);
        assert_eq!(record.attacks_remaining, vec!["brute-4", "brute-6"]);
        assert_eq!(record.cracked, 42);
        assert_eq!(record.attack_results.len(), 1);
        assert_eq!(record.attack_results[0].new_cracks, 42);
        assert_eq!(store.state().attack_stats["brute-3"].attempted, 1);
    }

    #[test]
    fn test_complete_attack_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.init_batch("batch-0001", 10, 1000, ORDER);
        store.complete_attack("batch-0001", "brute-3", 42, 90).unwrap();
        store.complete_attack("batch-0001", "brute-3", 42, 90).unwrap();

        let record = store.batch("batch-0001").unwrap();
        assert_eq!(record.attacks_applied.len(), 1);
        assert_eq!(record.attack_results.len(), 1);
        assert_eq!(record.cracked, 42);
        assert_eq!(store.state().attack_stats["brute-3"].attempted, 1);
    }

    #[test]
    fn test_batch_auto_completes_when_remaining_empties() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.init_batch("batch-0001", 10, 1000, ORDER);
        for attack in ORDER {
            store.complete_attack("batch-0001", attack, 10, 30).unwrap();
        }
        let record = store.batch("batch-0001").unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert!(record.completed_at.is_some());
        assert!(record.attacks_remaining.is_empty());
        // cracked equals the sum of per-attack newCracks
        let sum: u64 = record.attack_results.iter().map(|r| r.new_cracks).sum();
        assert_eq!(record.cracked, sum);
    }

    #[test]
    fn test_save_creates_backup_of_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sand-state.json");
        let mut store = StateStore::load(&path);
        store.init_batch("batch-0001", 10, 1000, ORDER);
        store.save().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.bak").exists());

        store.complete_attack("batch-0001", "brute-3", 5, 30).unwrap();
        store.save().unwrap();
        let bak = path.with_extension("json.bak");
        assert!(bak.exists());
        // Backup holds the previous good state (no applied attacks yet).
        let prev: PipelineState =
            serde_json::from_str(&fs::read_to_string(&bak).unwrap()).unwrap();
        assert!(prev.batches["batch-0001"].attacks_applied.is_empty());
    }

    #[test]
    fn test_save_round_trips_through_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sand-state.json");
        let mut store = StateStore::load(&path);
        store.init_batch("batch-0003", 44, 2000, ORDER);
        store.complete_attack("batch-0003", "brute-3", 7, 61).unwrap();
        store.save().unwrap();

        let reloaded = StateStore::load(&path);
        let record = reloaded.batch("batch-0003").unwrap();
        assert_eq!(record.cracked, 7);
        assert_eq!(record.attacks_applied, vec!["brute-3"]);
        assert_eq!(reloaded.state().attack_stats["brute-3"].total_hashes, 2000);
    }

    #[test]
    fn test_validate_flags_overlap_and_overcount() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.init_batch("batch-0001", 10, 100, ORDER);
        {
            let record = store.state_mut().batches.get_mut("batch-0001").unwrap();
            record.attacks_applied.push("brute-3".to_string());
            record.cracked = 500;
        }
        let warnings = store.validate();
        assert!(warnings.iter().any(|w| w.contains("both applied and remaining")));
        assert!(warnings.iter().any(|w| w.contains("exceeds hashCount")));
    }

    #[test]
    fn test_validate_flags_completed_without_timestamp() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.init_batch("batch-0001", 10, 100, &[]);
        {
            let record = store.state_mut().batches.get_mut("batch-0001").unwrap();
            record.status = BatchStatus::Completed;
        }
        let warnings = store.validate();
        assert!(warnings.iter().any(|w| w.contains("without completedAt")));
    }

    #[test]
    fn test_validation_warnings_do_not_block_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sand-state.json");
        let mut store = StateStore::load(&path);
        store.init_batch("batch-0001", 10, 100, ORDER);
        store.state_mut().batches.get_mut("batch-0001").unwrap().cracked = 999;
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_debounced_save_flushes_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sand-state.json");
        let mut store = StateStore::load(&path);
        store.init_batch("batch-0001", 10, 100, ORDER);
        store.save_debounced(Duration::from_secs(60));
        assert!(!path.exists());
        store.flush().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_apply_roi_reorder_sorts_by_score() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.state_mut().attack_order =
            vec!["slow".to_string(), "fast".to_string()];
        store
            .state_mut()
            .attack_stats
            .insert("slow".to_string(), {
                let mut s = AttackStats::default();
                s.record(10, 10_000, 3600);
                s
            });
        store
            .state_mut()
            .attack_stats
            .insert("fast".to_string(), {
                let mut s = AttackStats::default();
                s.record(500, 10_000, 120);
                s
            });
        store.apply_roi_reorder();
        assert_eq!(store.state().attack_order, vec!["fast", "slow"]);
    }

    #[test]
    fn test_ineffective_attacks_need_three_attempts() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        let mut dud = AttackStats::default();
        dud.record(0, 100_000, 60);
        dud.record(1, 100_000, 60);
        store.state_mut().attack_stats.insert("dud".to_string(), dud.clone());
        assert!(store.ineffective_attacks().is_empty());

        dud.record(0, 100_000, 60);
        store.state_mut().attack_stats.insert("dud".to_string(), dud);
        assert_eq!(store.ineffective_attacks(), vec!["dud"]);
    }

    #[test]
    fn test_gravel_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gravel-state.json");
        let mut store = GravelStore::load(&path);
        store.record_batch(
            "batch-0001",
            GravelBatchRecord {
                status: BatchStatus::Completed,
                hash_count: 2_500_000,
                pearl_count: 750_000,
                sand_count: 1_750_000,
                crack_rate: "30.00".to_string(),
                duration_seconds: 5400,
                completed_at: Some(Utc::now()),
            },
        );
        store.save().unwrap();

        let reloaded = GravelStore::load(&path);
        let record = reloaded.batch("batch-0001").unwrap();
        assert_eq!(record.pearl_count, 750_000);
        assert_eq!(record.crack_rate, "30.00");
    }
}
