use crate::config::Config;
use crate::errors::RemoteError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// ssh exits with 255 when the connection itself failed; any other nonzero
/// code came from the remote command.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Seam between the job controller and the network. Production uses
/// [`RemoteShell`]; tests script the responses.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Run a remote command, requiring exit 0. Stdout is returned trimmed.
    async fn exec(&self, cmd: &str) -> Result<String, RemoteError>;

    /// Run a remote command, returning `(exit_code, stdout)`. A nonzero exit
    /// from the remote command is data, not an error; only connection-level
    /// failures map to `RemoteError`.
    async fn exec_status(&self, cmd: &str) -> Result<(i32, String), RemoteError>;

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// Run a SQL statement through the remote SQL client. The statement
    /// travels base64-encoded to sidestep shell-quoting pitfalls.
    async fn exec_sql(&self, sql: &str) -> Result<String, RemoteError> {
        let encoded = BASE64.encode(sql);
        self.exec(&format!("echo {} | base64 -d | mysql -N -B coordinator", encoded))
            .await
    }
}

/// SSH adapter for the GPU host: timeouts, one retry on transient failures
/// (three for idempotent reads), and base64-encoded SQL delivery.
pub struct RemoteShell {
    dest: String,
    timeout: Duration,
    /// Remote command that reads SQL on stdin, e.g. `mysql -N -B coordinator`.
    sql_client: String,
}

impl RemoteShell {
    pub fn new(config: &Config) -> Self {
        Self {
            dest: config.remote_dest(),
            timeout: Duration::from_secs(config.ssh_timeout_secs),
            sql_client: std::env::var("TUMBLER_SQL_CLIENT")
                .unwrap_or_else(|_| "mysql -N -B coordinator".to_string()),
        }
    }

    async fn run_once(&self, program: &str, args: &[&str]) -> Result<(i32, String), RemoteError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| RemoteError::Network {
            message: format!("{} timed out after {:?}", program, self.timeout),
            attempts: 1,
        })?
        .map_err(RemoteError::Spawn)?;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if code == SSH_CONNECTION_FAILURE {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RemoteError::Network {
                message: stderr.trim().to_string(),
                attempts: 1,
            });
        }
        Ok((code, stdout))
    }

    async fn ssh_with_retries(
        &self,
        cmd: &str,
        max_attempts: u32,
    ) -> Result<(i32, String), RemoteError> {
        let args = [
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            self.dest.as_str(),
            cmd,
        ];
        let mut last_message = String::new();
        for attempt in 1..=max_attempts {
            match self.run_once("ssh", &args).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!("ssh attempt {}/{} failed: {}", attempt, max_attempts, e);
                    last_message = e.to_string();
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => {
                    if let RemoteError::Network { message, .. } = e {
                        return Err(RemoteError::Network {
                            message,
                            attempts: attempt,
                        });
                    }
                    return Err(e);
                }
            }
        }
        Err(RemoteError::Network {
            message: last_message,
            attempts: max_attempts,
        })
    }

    /// Idempotent read: safe to retry up to three times.
    pub async fn exec_read(&self, cmd: &str) -> Result<String, RemoteError> {
        let (code, stdout) = self.ssh_with_retries(cmd, 3).await?;
        if code != 0 {
            return Err(RemoteError::Other(anyhow::anyhow!(
                "Remote command exited {}: {}",
                code,
                cmd
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Shell for RemoteShell {
    async fn exec(&self, cmd: &str) -> Result<String, RemoteError> {
        let (code, stdout) = self.ssh_with_retries(cmd, 2).await?;
        if code != 0 {
            return Err(RemoteError::Other(anyhow::anyhow!(
                "Remote command exited {}: {}",
                code,
                cmd
            )));
        }
        Ok(stdout)
    }

    async fn exec_status(&self, cmd: &str) -> Result<(i32, String), RemoteError> {
        self.ssh_with_retries(cmd, 2).await
    }

    async fn exec_sql(&self, sql: &str) -> Result<String, RemoteError> {
        let encoded = BASE64.encode(sql);
        let cmd = format!("echo {} | base64 -d | {}", encoded, self.sql_client);
        debug!("exec_sql: {}", sql);
        self.exec_read(&cmd).await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let target = format!("{}:{}", self.dest, remote);
        let local_str = local.to_string_lossy();
        let args = ["-o", "BatchMode=yes", local_str.as_ref(), target.as_str()];
        let (code, _) = self.run_once("scp", &args).await?;
        if code != 0 {
            return Err(RemoteError::Other(anyhow::anyhow!(
                "scp upload of {} exited {}",
                local.display(),
                code
            )));
        }
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let source = format!("{}:{}", self.dest, remote);
        let local_str = local.to_string_lossy();
        let args = ["-o", "BatchMode=yes", source.as_str(), local_str.as_ref()];
        let (code, _) = self.run_once("scp", &args).await?;
        if code != 0 {
            return Err(RemoteError::Other(anyhow::anyhow!(
                "scp download of {} exited {}",
                remote,
                code
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_is_base64_wrapped() {
        let sql = "SELECT COUNT(*) FROM Task WHERE hashlistId = 5";
        let encoded = BASE64.encode(sql);
        // The wrapper decodes on the remote side and pipes into the client.
        let cmd = format!("echo {} | base64 -d | mysql -N -B coordinator", encoded);
        assert!(cmd.contains(&encoded));
        assert!(!cmd.contains("SELECT"));
        let round_trip = BASE64.decode(&encoded).unwrap();
        assert_eq!(String::from_utf8(round_trip).unwrap(), sql);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_classified_as_network_kind() {
        // Point at a binary that cannot exist to exercise the spawn path.
        let shell = RemoteShell {
            dest: "nobody@nowhere.invalid".to_string(),
            timeout: Duration::from_secs(1),
            sql_client: String::new(),
        };
        let result = shell
            .run_once("/nonexistent/tumbler-test-ssh", &["x"])
            .await;
        match result {
            Err(e) => assert_eq!(e.kind(), "network"),
            Ok(_) => panic!("spawn of a nonexistent binary should fail"),
        }
    }
}
