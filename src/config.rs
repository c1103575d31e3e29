use anyhow::{Context, Result};
use std::path::PathBuf;

/// Runtime configuration for Tumbler.
///
/// Resolution order for every setting: explicit CLI value, then environment
/// variable (a `.env` file is honored via dotenvy), then the compiled default.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub gravel_dir: PathBuf,
    pub sand_dir: PathBuf,
    pub pearls_dir: PathBuf,
    pub diamonds_dir: PathBuf,
    pub glass_dir: PathBuf,
    pub feedback_dir: PathBuf,
    /// Stage 2 state store (`sand-state.json`, plus `.bak`).
    pub sand_state_file: PathBuf,
    /// Stage 1 state store (`gravel-state.json`), same write discipline.
    pub gravel_state_file: PathBuf,
    pub lock_file: PathBuf,

    pub remote_host: String,
    pub remote_user: String,
    pub remote_work_dir: String,
    pub ssh_timeout_secs: u64,

    pub service_url: String,
    pub service_api_key: String,
    pub oracle_url: String,

    pub classifier: ClassifierConfig,

    /// Maximum lines per SAND output chunk.
    pub sieve_batch_size: usize,

    pub oracle_max_queries: usize,
    pub oracle_batch_size: usize,
    pub oracle_batch_gap_ms: u64,

    pub verbose: bool,
}

/// Thresholds for the structured-vs-random password classifier.
///
/// The defaults are deliberate: 3.8 bits/char separates random from structured
/// globally, and short roots (3-4 chars) additionally need a vowel-ratio of at
/// least 0.25 and root entropy under 2.5 to exclude garbage like `xfr`.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub entropy_threshold: f64,
    pub short_root_entropy: f64,
    pub min_vowel_ratio: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: 3.8,
            short_root_entropy: 2.5,
            min_vowel_ratio: 0.25,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn new(data_dir: Option<PathBuf>, verbose: bool) -> Result<Self> {
        // A missing .env file is fine; an unreadable one is not.
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e).context("Failed to parse .env file"),
        }

        let data_dir = data_dir
            .or_else(|| std::env::var("TUMBLER_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));

        Ok(Self {
            gravel_dir: data_dir.join("gravel"),
            sand_dir: data_dir.join("sand"),
            pearls_dir: data_dir.join("pearls"),
            diamonds_dir: data_dir.join("diamonds"),
            glass_dir: data_dir.join("glass"),
            feedback_dir: data_dir.join("feedback"),
            sand_state_file: data_dir.join("sand-state.json"),
            gravel_state_file: data_dir.join("gravel-state.json"),
            lock_file: data_dir.join(".tumbler.lock"),
            data_dir,

            remote_host: env_or("TUMBLER_REMOTE_HOST", "cracker"),
            remote_user: env_or("TUMBLER_REMOTE_USER", "crack"),
            remote_work_dir: env_or("TUMBLER_REMOTE_WORK_DIR", "/srv/cracking"),
            ssh_timeout_secs: std::env::var("TUMBLER_SSH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),

            service_url: env_or("TUMBLER_SERVICE_URL", "http://localhost:8080/api"),
            service_api_key: env_or("TUMBLER_SERVICE_API_KEY", ""),
            oracle_url: env_or("TUMBLER_ORACLE_URL", "https://api.pwnedpasswords.com"),

            classifier: ClassifierConfig::default(),

            sieve_batch_size: 1_000_000,
            oracle_max_queries: 200,
            oracle_batch_size: 20,
            oracle_batch_gap_ms: 200,

            verbose,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.gravel_dir,
            &self.sand_dir,
            &self.pearls_dir,
            &self.diamonds_dir,
            &self.glass_dir,
            &self.feedback_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Global PEARLS pair file, append-only JSONL.
    pub fn pearls_file(&self) -> PathBuf {
        self.pearls_dir.join("hash_plaintext_pairs.jsonl")
    }

    /// Global DIAMONDS pair file, append-only JSONL.
    pub fn diamonds_file(&self) -> PathBuf {
        self.diamonds_dir.join("hash_plaintext_pairs.jsonl")
    }

    /// The grown wordlist of newly discovered roots.
    pub fn beta_file(&self) -> PathBuf {
        self.feedback_dir.join("BETA.txt")
    }

    /// The grown append-rule file.
    pub fn rule_file(&self) -> PathBuf {
        self.feedback_dir.join("unobtainium.rule")
    }

    /// ssh destination string (`user@host`).
    pub fn remote_dest(&self) -> String {
        format!("{}@{}", self.remote_user, self.remote_host)
    }
}
