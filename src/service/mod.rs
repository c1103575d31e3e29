//! Coordination-service adapter.
//!
//! Wraps the external service's HTTP API (hashlist and task CRUD, progress
//! reads, cracked-hash bulk download) and its SQL introspection, which runs
//! through the SSH shell adapter with base64-encoded statements.

use crate::config::Config;
use crate::errors::ServiceError;
use crate::remote::Shell;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Seam between the Stage 2 scheduler and the coordination service.
/// Production uses [`CoordinatorClient`]; tests script the responses.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn create_hashlist(&self, name: &str, hashes: &[String]) -> Result<i64, ServiceError>;
    async fn create_task(&self, request: &TaskRequest) -> Result<i64, ServiceError>;
    async fn get_task_status(&self, task_id: i64) -> Result<TaskStatus, ServiceError>;
    async fn get_cracked_hashes(
        &self,
        hashlist_id: i64,
    ) -> Result<Vec<(String, String)>, ServiceError>;
    async fn get_cracked_count(&self, hashlist_id: i64) -> Result<u64, ServiceError>;
    async fn list_tasks(&self) -> Result<Vec<TaskSummary>, ServiceError>;
}

/// Writes are retried once on transient failures; idempotent reads three times.
const WRITE_ATTEMPTS: u32 = 2;
const READ_ATTEMPTS: u32 = 3;

/// Progress snapshot for a running task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub percent_complete: f64,
    pub keyspace: u64,
    pub keyspace_progress: u64,
    #[serde(default)]
    pub is_archived: bool,
}

impl TaskStatus {
    /// A task is finished once it reports full progress or was archived.
    pub fn is_finished(&self) -> bool {
        self.percent_complete >= 100.0 || self.is_archived
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: i64,
    pub name: String,
    pub attack_cmd: String,
    pub hashlist_id: i64,
}

/// Request body for task creation; mirrors the attack table entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub name: String,
    pub hashlist_id: i64,
    pub attack_cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wordlist_file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CrackedPair {
    hash: String,
    plain: String,
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CoordinatorClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: config.service_url.trim_end_matches('/').to_string(),
            api_key: config.service_api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ServiceError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn backoff_or_bail(
        e: ServiceError,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<(), ServiceError> {
        if e.is_transient() && attempt < max_attempts {
            warn!("service attempt {}/{} failed: {}", attempt, max_attempts, e);
            tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            Ok(())
        } else {
            Err(e)
        }
    }

    /// Register a hash file and return the service-assigned hashlist id.
    pub async fn create_hashlist(
        &self,
        name: &str,
        hashes: &[String],
    ) -> Result<i64, ServiceError> {
        let body = serde_json::json!({
            "name": name,
            "hashMode": 100,
            "hashes": hashes,
        });
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_post_id("/hashlists", &body).await {
                Ok(id) => return Ok(id),
                Err(e) => Self::backoff_or_bail(e, attempt, WRITE_ATTEMPTS).await?,
            }
        }
    }

    pub async fn create_task(&self, request: &TaskRequest) -> Result<i64, ServiceError> {
        debug!(
            "creating task {} on hashlist {}",
            request.name, request.hashlist_id
        );
        let body = serde_json::to_value(request)
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_post_id("/tasks", &body).await {
                Ok(id) => return Ok(id),
                Err(e) => Self::backoff_or_bail(e, attempt, WRITE_ATTEMPTS).await?,
            }
        }
    }

    async fn try_post_id(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<i64, ServiceError> {
        let response = self
            .http
            .post(self.url(path))
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(ServiceError::Transport)?;
        let parsed: IdResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        Ok(parsed.id)
    }

    pub async fn get_task_status(&self, task_id: i64) -> Result<TaskStatus, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_get_task_status(task_id).await {
                Ok(status) => return Ok(status),
                Err(e) => Self::backoff_or_bail(e, attempt, READ_ATTEMPTS).await?,
            }
        }
    }

    async fn try_get_task_status(&self, task_id: i64) -> Result<TaskStatus, ServiceError> {
        let response = self
            .http
            .get(self.url(&format!("/tasks/{}/status", task_id)))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(ServiceError::Transport)?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::TaskNotFound { task_id });
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))
    }

    /// Bulk download of recovered pairs for a hashlist.
    pub async fn get_cracked_hashes(
        &self,
        hashlist_id: i64,
    ) -> Result<Vec<(String, String)>, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_get_cracked(hashlist_id).await {
                Ok(pairs) => return Ok(pairs),
                Err(e) => Self::backoff_or_bail(e, attempt, READ_ATTEMPTS).await?,
            }
        }
    }

    async fn try_get_cracked(
        &self,
        hashlist_id: i64,
    ) -> Result<Vec<(String, String)>, ServiceError> {
        let response = self
            .http
            .get(self.url(&format!("/hashlists/{}/cracked", hashlist_id)))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(ServiceError::Transport)?;
        if response.status().as_u16() == 404 {
            return Err(ServiceError::HashlistNotFound { hashlist_id });
        }
        let pairs: Vec<CrackedPair> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        Ok(pairs.into_iter().map(|p| (p.hash, p.plain)).collect())
    }

    /// Count of cracked hashes on a hashlist; used for per-attack deltas.
    pub async fn get_cracked_count(&self, hashlist_id: i64) -> Result<u64, ServiceError> {
        Ok(self.get_cracked_hashes(hashlist_id).await?.len() as u64)
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskSummary>, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<Vec<TaskSummary>, ServiceError> = async {
                let response = self
                    .http
                    .get(self.url("/tasks"))
                    .header("X-Api-Key", &self.api_key)
                    .send()
                    .await
                    .map_err(ServiceError::Transport)?;
                Self::check(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ServiceError::Malformed(e.to_string()))
            }
            .await;
            match result {
                Ok(tasks) => return Ok(tasks),
                Err(e) => Self::backoff_or_bail(e, attempt, READ_ATTEMPTS).await?,
            }
        }
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn create_hashlist(&self, name: &str, hashes: &[String]) -> Result<i64, ServiceError> {
        CoordinatorClient::create_hashlist(self, name, hashes).await
    }

    async fn create_task(&self, request: &TaskRequest) -> Result<i64, ServiceError> {
        CoordinatorClient::create_task(self, request).await
    }

    async fn get_task_status(&self, task_id: i64) -> Result<TaskStatus, ServiceError> {
        CoordinatorClient::get_task_status(self, task_id).await
    }

    async fn get_cracked_hashes(
        &self,
        hashlist_id: i64,
    ) -> Result<Vec<(String, String)>, ServiceError> {
        CoordinatorClient::get_cracked_hashes(self, hashlist_id).await
    }

    async fn get_cracked_count(&self, hashlist_id: i64) -> Result<u64, ServiceError> {
        CoordinatorClient::get_cracked_count(self, hashlist_id).await
    }

    async fn list_tasks(&self) -> Result<Vec<TaskSummary>, ServiceError> {
        CoordinatorClient::list_tasks(self).await
    }
}

/// Read-mostly SQL introspection over the service's tables (`Hashlist`,
/// `Task`, `Chunk`, `Agent`), delivered base64-encoded through the shell
/// adapter. Used for checks the HTTP API does not expose.
pub struct SqlIntrospection<'a, S: Shell + ?Sized> {
    shell: &'a S,
}

impl<'a, S: Shell + ?Sized> SqlIntrospection<'a, S> {
    pub fn new(shell: &'a S) -> Self {
        Self { shell }
    }

    /// All chunks dispatched for the task are in a terminal state.
    pub async fn is_task_complete(&self, task_id: i64) -> anyhow::Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM Chunk WHERE taskId = {} AND state NOT IN (4, 6, 9)",
            task_id
        );
        let out = self.shell.exec_sql(&sql).await?;
        Ok(out.trim() == "0")
    }

    pub async fn cracked_count(&self, hashlist_id: i64) -> anyhow::Result<u64> {
        let sql = format!(
            "SELECT cracked FROM Hashlist WHERE hashlistId = {}",
            hashlist_id
        );
        let out = self.shell.exec_sql(&sql).await?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    /// Free work units stuck on a dead agent so the task can finish.
    pub async fn reset_stuck_chunks(&self, task_id: i64) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE Chunk SET state = 0, agentId = NULL WHERE taskId = {} AND state = 1 \
             AND solveTime < UNIX_TIMESTAMP() - 3600",
            task_id
        );
        self.shell.exec_sql(&sql).await?;
        Ok(())
    }

    pub async fn archive_hashlist(&self, hashlist_id: i64) -> anyhow::Result<()> {
        let sql = format!(
            "UPDATE Hashlist SET isArchived = 1 WHERE hashlistId = {}",
            hashlist_id
        );
        self.shell.exec_sql(&sql).await?;
        Ok(())
    }
}
