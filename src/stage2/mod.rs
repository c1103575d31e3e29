//! Stage 2 attack scheduler: drives one SAND batch through the ordered,
//! tiered attack list on the coordination service.
//!
//! Attacks execute strictly sequentially; the remaining list is never
//! reordered mid-batch. A successfully submitted attack is never cancelled —
//! the GPU host is exclusively ours and a restart costs more than waiting.

pub mod attacks;

use crate::config::Config;
use crate::errors::ServiceError;
use crate::service::Coordinator;
use crate::sieve;
use crate::state::StateStore;
use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SUBMIT_ATTEMPTS: u32 = 3;

/// Completion writes are debounced so a burst of instant Tier-0 attacks
/// coalesces into one save; `flush` runs at the end of the batch and from
/// the Ctrl-C handler.
const COMPLETE_SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

pub struct AttackScheduler<'a, C: Coordinator> {
    client: &'a C,
    config: &'a Config,
    poll_interval: Duration,
    submit_backoff: Duration,
}

impl<'a, C: Coordinator> AttackScheduler<'a, C> {
    pub fn new(client: &'a C, config: &'a Config) -> Self {
        Self {
            client,
            config,
            poll_interval: Duration::from_secs(30),
            submit_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[cfg(test)]
    fn with_submit_backoff(mut self, backoff: Duration) -> Self {
        self.submit_backoff = backoff;
        self
    }

    fn sand_file(&self, batch: &str) -> PathBuf {
        self.config.sand_dir.join(format!("{}.txt.gz", batch))
    }

    /// Run every remaining attack for one batch. Creates and registers the
    /// batch on first contact, seeding the remaining list from the compiled
    /// default order.
    pub async fn run_batch(&self, store: &mut StateStore, batch: &str) -> Result<()> {
        if store.batch(batch).is_none() {
            self.register_batch(store, batch).await?;
        }

        let hashlist_id = store
            .batch(batch)
            .and_then(|r| r.hashlist_id)
            .context("Batch record has no hashlist id")?;

        loop {
            store.flush_if_due()?;
            let Some(attack_name) = store
                .batch(batch)
                .and_then(|r| r.attacks_remaining.first().cloned())
            else {
                break;
            };
            self.run_one_attack(store, batch, hashlist_id, &attack_name)
                .await?;
        }
        store.flush()?;

        info!(
            "{}: all attacks applied, {} cracked",
            batch,
            store.batch(batch).map(|r| r.cracked).unwrap_or(0)
        );
        Ok(())
    }

    async fn register_batch(&self, store: &mut StateStore, batch: &str) -> Result<()> {
        let sand_file = self.sand_file(batch);
        let hashes = sieve::read_hash_lines(&sand_file)
            .with_context(|| format!("Failed to read SAND file {}", sand_file.display()))?;
        info!("{}: registering hashlist with {} hashes", batch, hashes.len());
        let hashlist_id = self
            .client
            .create_hashlist(batch, &hashes)
            .await
            .context("Failed to register hashlist")?;
        store.init_batch(batch, hashlist_id, hashes.len() as u64, &attacks::default_order());
        store.save()?;
        Ok(())
    }

    async fn run_one_attack(
        &self,
        store: &mut StateStore,
        batch: &str,
        hashlist_id: i64,
        attack_name: &str,
    ) -> Result<()> {
        let Some(spec) = attacks::get_attack(attack_name) else {
            let message = format!("No command form for attack {}", attack_name);
            store.fail_batch(batch, &message)?;
            store.save()?;
            bail!(message);
        };

        let cracked_before = self.client.get_cracked_count(hashlist_id).await?;
        let request = spec.to_task_request(hashlist_id);

        let task_id = match self.submit_with_retries(&request).await {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Submission of {} failed: {}", attack_name, e);
                store.fail_batch(batch, &message)?;
                store.save()?;
                return Err(anyhow::Error::new(e).context(message));
            }
        };

        store.start_attack(batch, attack_name, task_id)?;
        store.save()?;
        info!("{}: {} submitted as task {}", batch, attack_name, task_id);

        let started = Instant::now();
        self.wait_for_task(task_id).await?;

        let cracked_after = self.client.get_cracked_count(hashlist_id).await?;
        let delta = cracked_after.saturating_sub(cracked_before);
        let duration = started.elapsed().as_secs();
        info!(
            "{}: {} finished with {} new cracks in {}s",
            batch, attack_name, delta, duration
        );

        store.complete_attack(batch, attack_name, delta, duration)?;
        store.save_debounced(COMPLETE_SAVE_DEBOUNCE);
        Ok(())
    }

    async fn submit_with_retries(&self, request: &crate::service::TaskRequest) -> Result<i64, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.create_task(request).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < SUBMIT_ATTEMPTS => {
                    warn!(
                        "submit attempt {}/{} for {} failed: {}",
                        attempt, SUBMIT_ATTEMPTS, request.name, e
                    );
                    tokio::time::sleep(self.submit_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll until the task reports full progress or is archived. Transient
    /// poll failures never abort a submitted attack.
    async fn wait_for_task(&self, task_id: i64) -> Result<()> {
        loop {
            match self.client.get_task_status(task_id).await {
                Ok(status) if status.is_finished() => return Ok(()),
                Ok(status) => {
                    tracing::debug!(
                        "task {}: {:.1}% ({}/{})",
                        task_id,
                        status.percent_complete,
                        status.keyspace_progress,
                        status.keyspace
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!("task {} poll failed ({}), retrying", task_id, e);
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
