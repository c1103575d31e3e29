//! Remote host access: the SSH shell adapter and the detached job controller.
//!
//! The GPU host is reached exclusively through the system `ssh`/`scp`
//! binaries; long-running cracking jobs live inside detached screen sessions
//! that survive both SSH drops and orchestrator restarts.

mod job;
mod shell;

pub use job::{JobController, JobControllerConfig, JobOutcome, JobSpec};
pub use shell::{RemoteShell, Shell};
