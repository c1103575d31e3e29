//! Remote job controller: runs one long-lived cracking process inside a
//! detached screen session and reports its true outcome.
//!
//! The session is the ground truth, not the orchestrator process — launch and
//! reattach are symmetric, and an SSH drop mid-attack only pauses polling.
//! The process exit code is never used as truth either: the log may lag, so
//! the result is the potfile line-count delta.

use super::shell::Shell;
use crate::errors::RemoteError;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything needed to run one attack on the remote host.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Batch being attacked; the session is named `tumbler-<batch>`.
    pub batch: String,
    /// Full command line for the remote cracking binary.
    pub command: String,
    /// Remote working directory.
    pub work_dir: String,
    /// Remote log file, overwritten at launch.
    pub log_path: String,
    /// Remote potfile whose line count is the authoritative crack counter.
    pub potfile_path: String,
}

impl JobSpec {
    pub fn session_name(&self) -> String {
        format!("tumbler-{}", self.batch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub new_cracks: u64,
    pub duration_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct JobControllerConfig {
    pub poll_interval: Duration,
    /// Wait after launch before checking that anything started.
    pub settle_delay: Duration,
    /// Reconnect backoff is 10s x attempt, capped here.
    pub reconnect_cap: Duration,
    /// Total reconnect budget before giving up.
    pub reconnect_give_up: Duration,
    /// Gap between potfile re-reads while waiting for a stable count.
    pub potfile_reread_gap: Duration,
    /// Process name matched by the liveness probe.
    pub cracker_binary: String,
}

impl Default for JobControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(3),
            reconnect_cap: Duration::from_secs(30),
            reconnect_give_up: Duration::from_secs(300),
            potfile_reread_gap: Duration::from_secs(5),
            cracker_binary: "hashcat".to_string(),
        }
    }
}

enum PollDecision {
    Running,
    MissedOnce,
    Done,
}

pub struct JobController<'a, S: Shell> {
    shell: &'a S,
    config: JobControllerConfig,
}

impl<'a, S: Shell> JobController<'a, S> {
    pub fn new(shell: &'a S, config: JobControllerConfig) -> Self {
        Self { shell, config }
    }

    /// Drive one attack to completion: launch or adopt the session, poll to
    /// termination, and reconcile the result against the potfile.
    pub async fn run_attack(&self, spec: &JobSpec) -> Result<JobOutcome, RemoteError> {
        let started = Instant::now();
        let potfile_before = self.stable_potfile_count(&spec.potfile_path).await?;

        self.ensure_running(spec).await?;
        self.poll_to_completion(spec).await?;

        let potfile_after = self.stable_potfile_count(&spec.potfile_path).await?;
        let new_cracks = potfile_after.saturating_sub(potfile_before);
        let duration_seconds = started.elapsed().as_secs();
        info!(
            "{}: job finished with {} new cracks in {}s",
            spec.batch, new_cracks, duration_seconds
        );
        Ok(JobOutcome {
            new_cracks,
            duration_seconds,
        })
    }

    /// Kill the session. Not called on normal shutdown: the default is to
    /// leave the detached job running for a later `--resume` to re-adopt.
    pub async fn quit_session(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        let cmd = format!("screen -S {} -X quit", spec.session_name());
        self.shell.exec_status(&cmd).await?;
        Ok(())
    }

    async fn ensure_running(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        if self.session_exists(spec).await? {
            info!("{}: adopting existing session {}", spec.batch, spec.session_name());
            return Ok(());
        }
        if self.process_count().await? > 0 {
            // A cracker we did not start is someone else's work.
            return Err(RemoteError::Orphan {
                session: spec.session_name(),
            });
        }
        self.launch(spec).await
    }

    async fn launch(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        self.shell
            .exec(&format!("rm -f {}", spec.log_path))
            .await?;
        let launch_cmd = format!(
            "screen -dmS {} bash -c 'cd {} && {} > {} 2>&1'",
            spec.session_name(),
            spec.work_dir,
            spec.command,
            spec.log_path,
        );
        info!("{}: launching {}", spec.batch, spec.command);
        self.shell.exec(&launch_cmd).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        if self.process_count().await? == 0 && !self.session_exists(spec).await? {
            let tail = self.log_tail(spec).await.unwrap_or_default();
            return Err(RemoteError::Launch {
                batch: spec.batch.clone(),
                message: format!("nothing started; log tail: {}", tail),
            });
        }
        Ok(())
    }

    async fn poll_to_completion(&self, spec: &JobSpec) -> Result<(), RemoteError> {
        let mut missed = 0u32;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.poll_once(spec).await {
                Ok(PollDecision::Running) => {
                    missed = 0;
                }
                Ok(PollDecision::Done) => return Ok(()),
                Ok(PollDecision::MissedOnce) => {
                    missed += 1;
                    // Two consecutive missed polls with no terminal marker:
                    // the process exited without one, the potfile is truth.
                    if missed >= 2 {
                        debug!("{}: no process after {} polls, treating as done", spec.batch, missed);
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("{}: poll failed ({}), reconnecting", spec.batch, e);
                    self.reconnect().await?;
                    missed = 0;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn poll_once(&self, spec: &JobSpec) -> Result<PollDecision, RemoteError> {
        let processes = self.process_count().await?;
        if processes > 0 {
            debug!("{}: job running ({} processes)", spec.batch, processes);
            return Ok(PollDecision::Running);
        }
        let session = self.session_exists(spec).await?;
        let log_done = self.log_shows_terminal_status(spec).await?;
        match (session, log_done) {
            (false, true) => Ok(PollDecision::Done),
            _ => Ok(PollDecision::MissedOnce),
        }
    }

    /// Exponential backoff 10s x attempt, capped at 30s; give up after 300s.
    async fn reconnect(&self) -> Result<(), RemoteError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let backoff = Duration::from_secs(10 * attempt as u64).min(self.config.reconnect_cap);
            info!("reconnect attempt {} (backoff {:?})", attempt, backoff);
            tokio::time::sleep(backoff).await;
            if started.elapsed() >= self.config.reconnect_give_up {
                return Err(RemoteError::Timeout {
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }
            match self.shell.exec_status("true").await {
                Ok(_) => {
                    info!("reconnected after {} attempts", attempt);
                    return Ok(());
                }
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_count(&self) -> Result<u64, RemoteError> {
        let cmd = format!("pgrep -c -f {}", self.config.cracker_binary);
        let (_, stdout) = self.shell.exec_status(&cmd).await?;
        Ok(stdout.trim().parse().unwrap_or(0))
    }

    async fn session_exists(&self, spec: &JobSpec) -> Result<bool, RemoteError> {
        // screen -ls exits nonzero when no sessions exist; the listing is
        // still what we want.
        let (_, stdout) = self.shell.exec_status("screen -ls").await?;
        Ok(stdout.contains(&spec.session_name()))
    }

    async fn log_shows_terminal_status(&self, spec: &JobSpec) -> Result<bool, RemoteError> {
        let tail = self.log_tail(spec).await?;
        Ok(tail.contains("Exhausted") || tail.contains("Cracked"))
    }

    async fn log_tail(&self, spec: &JobSpec) -> Result<String, RemoteError> {
        let cmd = format!("tail -n 20 {} 2>/dev/null", spec.log_path);
        let (_, stdout) = self.shell.exec_status(&cmd).await?;
        Ok(stdout)
    }

    /// Read the potfile line count up to three times, five seconds apart,
    /// until it stops growing. Protects against reading mid-append.
    async fn stable_potfile_count(&self, potfile: &str) -> Result<u64, RemoteError> {
        let mut last = self.potfile_count(potfile).await?;
        for _ in 0..2 {
            tokio::time::sleep(self.config.potfile_reread_gap).await;
            let next = self.potfile_count(potfile).await?;
            if next == last {
                break;
            }
            last = next.max(last);
        }
        Ok(last)
    }

    async fn potfile_count(&self, potfile: &str) -> Result<u64, RemoteError> {
        let cmd = format!("wc -l < {} 2>/dev/null || echo 0", potfile);
        let (_, stdout) = self.shell.exec_status(&cmd).await?;
        Ok(stdout.trim().parse().unwrap_or(0))
    }
}
