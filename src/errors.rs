//! Typed error hierarchy for the Tumbler orchestrator.
//!
//! Three top-level enums cover the three external-facing subsystems:
//! - `RemoteError` — SSH shell and remote job failures, classified
//! - `ServiceError` — coordination-service API and SQL introspection failures
//! - `StateError` — state-store persistence failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the remote shell and job controller.
///
/// Every variant carries its classification so callers can decide between
/// retry (network), operator escalation (orphan) and abort (launch, timeout).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("SSH command failed after {attempts} attempts: {message}")]
    Network { message: String, attempts: u32 },

    #[error("Failed to launch remote job for {batch}: {message}")]
    Launch { batch: String, message: String },

    #[error(
        "Cracking process running on remote host outside session {session} — refusing to proceed"
    )]
    Orphan { session: String },

    #[error("Gave up reconnecting after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("Failed to spawn ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    /// Short classification tag used in user-facing failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } | Self::Spawn(_) => "network",
            Self::Launch { .. } => "launch",
            Self::Orphan { .. } => "orphan",
            Self::Timeout { .. } => "timeout",
            Self::Other(_) => "other",
        }
    }

    /// Network failures during a poll do not abort the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Spawn(_))
    }
}

/// Errors from the coordination-service adapter.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service request failed ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Service unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    #[error("Hashlist {hashlist_id} not found")]
    HashlistNotFound { hashlist_id: i64 },

    #[error("Unexpected response shape: {0}")]
    Malformed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    /// Transient errors are retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to write state file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to back up state file at {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown batch {0}")]
    UnknownBatch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
