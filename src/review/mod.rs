//! Review / ROI engine. Read-only: joins per-attack data from the state file
//! into an ROI table and applies decision rules to emit recommendations. It
//! never mutates the attack order or the state.

use crate::stage2::attacks;
use crate::state::PipelineState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

const DROP_MIN_BATCHES: u64 = 3;
const DROP_MAX_RATE: f64 = 0.0001;
const DROP_MAX_CRACKS: u64 = 10;
const BUDGET_ALERT_COST_PCT: f64 = 50.0;
const BUDGET_ALERT_MAX_CRACK_SHARE: f64 = 0.3;
const REORDER_FACTOR: f64 = 1.5;
const STALL_WINDOW: usize = 5;

/// One attack's joined ROI figures across all batches.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiRow {
    pub attack: String,
    pub batches: u64,
    pub cracks: u64,
    /// cracks / summed hashCount of the batches it ran against.
    pub rate: f64,
    pub duration_seconds: u64,
    /// None for deferred attacks that never consumed GPU time.
    pub cracks_per_min: Option<f64>,
    pub cost_share_pct: f64,
    pub marginal_roi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recommendation {
    Drop { attack: String, reason: String },
    KeepOnTrial { attack: String },
    BudgetAlert { attack: String, reason: String },
    Reorder { reason: String },
    Investigate { reason: String },
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop { attack, reason } => write!(f, "DROP {}: {}", attack, reason),
            Self::KeepOnTrial { attack } => write!(f, "KEEP_ON_TRIAL {}", attack),
            Self::BudgetAlert { attack, reason } => {
                write!(f, "BUDGET_ALERT {}: {}", attack, reason)
            }
            Self::Reorder { reason } => write!(f, "REORDER: {}", reason),
            Self::Investigate { reason } => write!(f, "INVESTIGATE: {}", reason),
        }
    }
}

#[derive(Debug, Default)]
pub struct Review {
    pub rows: Vec<RoiRow>,
    pub recommendations: Vec<Recommendation>,
}

/// Join per-attack results from every batch record. `attackResults` is the
/// primary ROI record; aggregate stats are not consulted.
fn collect_rows(state: &PipelineState) -> Vec<RoiRow> {
    struct Acc {
        batches: u64,
        cracks: u64,
        hashes: u64,
        duration: u64,
    }
    let mut by_attack: BTreeMap<String, Acc> = BTreeMap::new();
    for record in state.batches.values() {
        for result in &record.attack_results {
            let acc = by_attack.entry(result.attack.clone()).or_insert(Acc {
                batches: 0,
                cracks: 0,
                hashes: 0,
                duration: 0,
            });
            acc.batches += 1;
            acc.cracks += result.new_cracks;
            acc.hashes += record.hash_count;
            acc.duration += result.duration_seconds;
        }
    }

    // Deferred attacks (zero duration) contribute nothing to the cost base.
    let total_duration: u64 = by_attack.values().map(|a| a.duration).sum();

    by_attack
        .into_iter()
        .map(|(attack, acc)| {
            let rate = if acc.hashes > 0 {
                acc.cracks as f64 / acc.hashes as f64
            } else {
                0.0
            };
            let cracks_per_min = if acc.duration > 0 {
                Some(acc.cracks as f64 / (acc.duration as f64 / 60.0))
            } else {
                None
            };
            let cost_share_pct = if total_duration > 0 {
                acc.duration as f64 / total_duration as f64 * 100.0
            } else {
                0.0
            };
            let marginal_roi = if cost_share_pct > 0.0 {
                Some(rate * 100.0 / cost_share_pct)
            } else {
                None
            };
            RoiRow {
                attack,
                batches: acc.batches,
                cracks: acc.cracks,
                rate,
                duration_seconds: acc.duration,
                cracks_per_min,
                cost_share_pct,
                marginal_roi,
            }
        })
        .collect()
}

/// Cracks attributable to the feedback attacks, per batch in name order.
/// Used to judge whether the feedback loop still pays off.
fn feedback_cracks_by_batch(state: &PipelineState) -> Vec<(String, u64)> {
    state
        .batches
        .iter()
        .map(|(name, record)| {
            let cracks = record
                .attack_results
                .iter()
                .filter(|r| r.attack.starts_with("feedback-"))
                .map(|r| r.new_cracks)
                .sum();
            (name.clone(), cracks)
        })
        .collect()
}

pub fn analyze(state: &PipelineState) -> Review {
    let rows = collect_rows(state);
    let total_cracks: u64 = rows.iter().map(|r| r.cracks).sum();
    let mut recommendations = Vec::new();

    for row in &rows {
        if row.batches < DROP_MIN_BATCHES {
            recommendations.push(Recommendation::KeepOnTrial {
                attack: row.attack.clone(),
            });
            continue;
        }
        if row.rate < DROP_MAX_RATE && row.cracks < DROP_MAX_CRACKS {
            recommendations.push(Recommendation::Drop {
                attack: row.attack.clone(),
                reason: format!(
                    "{} batches, rate {:.5}, only {} cracks",
                    row.batches, row.rate, row.cracks
                ),
            });
        }
        if row.cost_share_pct > BUDGET_ALERT_COST_PCT
            && total_cracks > 0
            && (row.cracks as f64 / total_cracks as f64) < BUDGET_ALERT_MAX_CRACK_SHARE
        {
            recommendations.push(Recommendation::BudgetAlert {
                attack: row.attack.clone(),
                reason: format!(
                    "{:.0}% of GPU time for {:.0}% of cracks",
                    row.cost_share_pct,
                    row.cracks as f64 / total_cracks as f64 * 100.0
                ),
            });
        }
    }

    // Adjacent inversions within the current order, same or adjacent tier.
    let order: Vec<String> = if state.attack_order.is_empty() {
        attacks::default_order()
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        state.attack_order.clone()
    };
    let per_min: BTreeMap<&str, f64> = rows
        .iter()
        .filter_map(|r| r.cracks_per_min.map(|m| (r.attack.as_str(), m)))
        .collect();
    for pair in order.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        let tier_gap = attacks::tier_of(upper).abs_diff(attacks::tier_of(lower));
        if tier_gap > 1 {
            continue;
        }
        if let (Some(&upper_rate), Some(&lower_rate)) =
            (per_min.get(upper.as_str()), per_min.get(lower.as_str()))
        {
            if upper_rate > 0.0 && lower_rate >= upper_rate * REORDER_FACTOR {
                recommendations.push(Recommendation::Reorder {
                    reason: format!(
                        "{} ({:.0}/min) above {} ({:.0}/min)",
                        lower, lower_rate, upper, upper_rate
                    ),
                });
            }
        }
    }

    // Feedback-loop health over the last five batches.
    let by_batch = feedback_cracks_by_batch(state);
    if by_batch.len() >= STALL_WINDOW {
        let window = &by_batch[by_batch.len() - STALL_WINDOW..];
        let first = window[0].1;
        let last = window[STALL_WINDOW - 1].1;
        if last <= first {
            recommendations.push(Recommendation::Investigate {
                reason: format!(
                    "feedback cracks not improving ({} -> {} over last {} batches); \
                     review BETA.txt quality",
                    first, last, STALL_WINDOW
                ),
            });
        }
    }

    Review {
        rows,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AttackResult, BatchRecord, BatchStatus, PipelineState};

    fn record_with(hash_count: u64, results: &[(&str, u64, u64)]) -> BatchRecord {
        BatchRecord {
            hash_count,
            status: BatchStatus::Completed,
            attacks_applied: results.iter().map(|(a, _, _)| a.to_string()).collect(),
            attack_results: results
                .iter()
                .map(|(attack, cracks, duration)| AttackResult {
                    attack: attack.to_string(),
                    new_cracks: *cracks,
                    duration_seconds: *duration,
                    crack_rate: *cracks as f64 / hash_count as f64,
                })
                .collect(),
            cracked: results.iter().map(|(_, c, _)| c).sum(),
            ..Default::default()
        }
    }

    #[test]
    fn test_roi_rows_join_across_batches() {
        let mut state = PipelineState::default();
        state
            .batches
            .insert("batch-0001".into(), record_with(1000, &[("brute-6", 100, 600)]));
        state
            .batches
            .insert("batch-0002".into(), record_with(1000, &[("brute-6", 50, 600)]));

        let review = analyze(&state);
        let row = review.rows.iter().find(|r| r.attack == "brute-6").unwrap();
        assert_eq!(row.batches, 2);
        assert_eq!(row.cracks, 150);
        assert!((row.rate - 0.075).abs() < 1e-9);
        assert!((row.cracks_per_min.unwrap() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_deferred_attack_has_no_per_minute_figure() {
        let mut state = PipelineState::default();
        state
            .batches
            .insert("batch-0001".into(), record_with(1000, &[("brute-6", 10, 0)]));
        let review = analyze(&state);
        assert!(review.rows[0].cracks_per_min.is_none());
        assert!(review.rows[0].marginal_roi.is_none());
    }

    #[test]
    fn test_drop_recommendation_for_persistent_dud() {
        let mut state = PipelineState::default();
        for n in 1..=3 {
            state.batches.insert(
                format!("batch-{:04}", n),
                record_with(30_000, &[("attackA", 1, 60), ("brute-6", 5000, 60)]),
            );
        }
        // attackA: 3 batches, rate 3/90000, 3 cracks total.
        let review = analyze(&state);
        assert!(review.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::Drop { attack, .. } if attack == "attackA"
        )));
        assert!(!review.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::Drop { attack, .. } if attack == "brute-6"
        )));
    }

    #[test]
    fn test_keep_on_trial_under_three_batches() {
        let mut state = PipelineState::default();
        state
            .batches
            .insert("batch-0001".into(), record_with(1000, &[("brute-6", 0, 60)]));
        let review = analyze(&state);
        assert!(review.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::KeepOnTrial { attack } if attack == "brute-6"
        )));
    }

    #[test]
    fn test_budget_alert_for_expensive_low_yield_attack() {
        let mut state = PipelineState::default();
        for n in 1..=3 {
            state.batches.insert(
                format!("batch-{:04}", n),
                record_with(10_000, &[("brute-7", 200, 10_000), ("brute-3", 3000, 100)]),
            );
        }
        // brute-7 eats ~99% of GPU time for under 30% of cracks.
        let review = analyze(&state);
        assert!(review.recommendations.iter().any(|r| matches!(
            r,
            Recommendation::BudgetAlert { attack, .. } if attack == "brute-7"
        )));
    }

    #[test]
    fn test_reorder_flags_adjacent_inversion() {
        let mut state = PipelineState::default();
        state.attack_order = vec!["attackC".into(), "attackB".into()];
        for n in 1..=3 {
            state.batches.insert(
                format!("batch-{:04}", n),
                // attackC: 100/min at the upper position; attackB: 400/min below.
                record_with(100_000, &[("attackC", 100, 60), ("attackB", 400, 60)]),
            );
        }
        let review = analyze(&state);
        let reorder = review
            .recommendations
            .iter()
            .find_map(|r| match r {
                Recommendation::Reorder { reason } => Some(reason.clone()),
                _ => None,
            })
            .expect("expected a REORDER recommendation");
        assert!(reorder.contains("attackB (400/min) above attackC (100/min)"));
    }

    #[test]
    fn test_no_reorder_below_factor() {
        let mut state = PipelineState::default();
        state.attack_order = vec!["attackC".into(), "attackB".into()];
        state.batches.insert(
            "batch-0001".into(),
            record_with(100_000, &[("attackC", 100, 60), ("attackB", 140, 60)]),
        );
        let review = analyze(&state);
        assert!(
            !review
                .recommendations
                .iter()
                .any(|r| matches!(r, Recommendation::Reorder { .. }))
        );
    }

    #[test]
    fn test_investigate_when_feedback_cracks_stall() {
        let mut state = PipelineState::default();
        let series = [210u64, 215, 208, 220, 205];
        for (i, cracks) in series.iter().enumerate() {
            state.batches.insert(
                format!("batch-{:04}", i + 1),
                record_with(100_000, &[("feedback-beta", *cracks, 60)]),
            );
        }
        let review = analyze(&state);
        let investigate = review
            .recommendations
            .iter()
            .find_map(|r| match r {
                Recommendation::Investigate { reason } => Some(reason.clone()),
                _ => None,
            })
            .expect("expected an INVESTIGATE recommendation");
        assert!(investigate.contains("not improving (210 -> 205"));
        assert!(investigate.contains("BETA.txt"));
    }

    #[test]
    fn test_no_investigate_when_feedback_grows() {
        let mut state = PipelineState::default();
        let series = [210u64, 215, 230, 245, 260];
        for (i, cracks) in series.iter().enumerate() {
            state.batches.insert(
                format!("batch-{:04}", i + 1),
                record_with(100_000, &[("feedback-beta", *cracks, 60)]),
            );
        }
        let review = analyze(&state);
        assert!(
            !review
                .recommendations
                .iter()
                .any(|r| matches!(r, Recommendation::Investigate { .. }))
        );
    }

    #[test]
    fn test_analyze_never_mutates_state() {
        let mut state = PipelineState::default();
        state
            .batches
            .insert("batch-0001".into(), record_with(1000, &[("brute-6", 10, 60)]));
        let before = serde_json::to_string(&state).unwrap();
        let _ = analyze(&state);
        assert_eq!(serde_json::to_string(&state).unwrap(), before);
    }
}
