//! Integration tests for the tumbler CLI.
//!
//! These drive the binary end to end against a temporary data directory;
//! everything that would touch the remote host or the coordination service
//! stays behind --dry-run or read-only commands.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn tumbler() -> Command {
    cargo_bin_cmd!("tumbler")
}

fn fake_hash(n: u32) -> String {
    format!("{:040X}", n)
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        tumbler().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        tumbler().arg("--version").assert().success();
    }

    #[test]
    fn test_status_on_empty_data_dir() {
        let dir = TempDir::new().unwrap();
        tumbler()
            .args(["--data-dir", dir.path().to_str().unwrap(), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("no batches processed"))
            .stdout(predicate::str::contains("no batches started"));
    }

    #[test]
    fn test_review_with_no_state() {
        let dir = TempDir::new().unwrap();
        tumbler()
            .args(["--data-dir", dir.path().to_str().unwrap(), "review"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No recommendations"));
    }

    #[test]
    fn test_run_rejects_inverted_range() {
        let dir = TempDir::new().unwrap();
        tumbler()
            .args([
                "--data-dir",
                dir.path().to_str().unwrap(),
                "run",
                "--batch",
                "5",
                "--through",
                "3",
            ])
            .assert()
            .failure();
    }
}

// =============================================================================
// Dry-run and resume-step resolution
// =============================================================================

mod dry_run {
    use super::*;

    #[test]
    fn test_fresh_batch_plans_all_steps() {
        let dir = TempDir::new().unwrap();
        tumbler()
            .args([
                "--data-dir",
                dir.path().to_str().unwrap(),
                "run",
                "--batch",
                "1",
                "--dry-run",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("batch-0001: resume step Sync"))
            .stdout(predicate::str::contains("would run Attacks"))
            .stdout(predicate::str::contains("would run Rebuild"));
    }

    #[test]
    fn test_in_progress_batch_resumes_at_collect() {
        let dir = TempDir::new().unwrap();
        // A record mid-run with nothing remaining resumes at COLLECT.
        let state = serde_json::json!({
            "attackOrder": [],
            "batches": {
                "batch-0005": {
                    "hashlistId": 9,
                    "hashCount": 1000,
                    "attacksApplied": ["brute-3", "brute-4"],
                    "attacksRemaining": [],
                    "cracked": 120,
                    "status": "in_progress"
                }
            },
            "attackStats": {}
        });
        fs::write(
            dir.path().join("sand-state.json"),
            serde_json::to_string_pretty(&state).unwrap(),
        )
        .unwrap();

        tumbler()
            .args([
                "--data-dir",
                dir.path().to_str().unwrap(),
                "run",
                "--batch",
                "5",
                "--resume",
                "--dry-run",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("batch-0005: resume step Collect"))
            .stdout(
                predicate::str::contains("would run Collect")
                    .and(predicate::str::contains("would run Sync").not()),
            );
    }
}

// =============================================================================
// Sieve end to end
// =============================================================================

mod sieve_cli {
    use super::*;

    #[test]
    fn test_sieve_splits_gravel_against_pearls() {
        let dir = TempDir::new().unwrap();
        let gravel_dir = dir.path().join("gravel");
        let pearls_dir = dir.path().join("pearls");
        fs::create_dir_all(&gravel_dir).unwrap();
        fs::create_dir_all(&pearls_dir).unwrap();

        let hashes: Vec<String> = (0..10).map(fake_hash).collect();
        fs::write(gravel_dir.join("batch-0001.txt"), hashes.join("\n")).unwrap();
        // Pearls cover two of the ten.
        fs::write(
            pearls_dir.join("hash_plaintext_pairs.jsonl"),
            format!(
                "{{\"hash\":\"{}\",\"plain\":\"one\"}}\n{{\"hash\":\"{}\",\"plain\":\"two\"}}\n",
                fake_hash(1),
                fake_hash(4)
            ),
        )
        .unwrap();

        tumbler()
            .args([
                "--data-dir",
                dir.path().to_str().unwrap(),
                "sieve",
                "--batch-size",
                "5",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("10 gravel lines"))
            .stdout(predicate::str::contains("2 matched"));

        assert!(dir.path().join("sand/batch-0001.txt.gz").exists());
        assert!(dir.path().join("sand/batch-0002.txt.gz").exists());
    }
}

// =============================================================================
// Status report with populated state
// =============================================================================

mod status_report {
    use super::*;

    #[test]
    fn test_status_shows_both_stages() {
        let dir = TempDir::new().unwrap();
        let gravel_state = serde_json::json!({
            "batches": {
                "batch-0001": {
                    "status": "completed",
                    "hashCount": 2_500_000,
                    "pearlCount": 750_000,
                    "sandCount": 1_750_000,
                    "crackRate": "30.00",
                    "durationSeconds": 5400,
                    "completedAt": "2026-07-01T12:00:00Z"
                }
            }
        });
        fs::write(
            dir.path().join("gravel-state.json"),
            serde_json::to_string_pretty(&gravel_state).unwrap(),
        )
        .unwrap();
        let sand_state = serde_json::json!({
            "attackOrder": [],
            "batches": {
                "batch-0001": {
                    "hashlistId": 3,
                    "hashCount": 1_750_000,
                    "attacksApplied": ["brute-3"],
                    "attacksRemaining": ["brute-4"],
                    "cracked": 40_000,
                    "status": "in_progress"
                }
            },
            "attackStats": {}
        });
        fs::write(
            dir.path().join("sand-state.json"),
            serde_json::to_string_pretty(&sand_state).unwrap(),
        )
        .unwrap();

        tumbler()
            .args(["--data-dir", dir.path().to_str().unwrap(), "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("750000 pearls"))
            .stdout(predicate::str::contains("40000 cracked"))
            .stdout(predicate::str::contains("1/2 attacks"));
    }
}
