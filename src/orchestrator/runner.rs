use crate::batch_name;
use crate::config::Config;
use crate::feedback::{BreachCounts, FeedbackAnalyzer};
use crate::potfile::PairRecord;
use crate::remote::Shell;
use crate::service::{Coordinator, SqlIntrospection};
use crate::sieve;
use crate::stage2::AttackScheduler;
use crate::state::{BatchStatus, FeedbackSummary, StateStore};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::Duration;
use tracing::{info, warn};

/// The five orchestrator steps plus the terminal marker for batches that
/// have already been fully processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Sync,
    Attacks,
    Collect,
    Feedback,
    Rebuild,
    Done,
}

/// Compute the resume point from state alone — no sidecar file.
pub fn resume_step(record: Option<&crate::state::BatchRecord>) -> Step {
    let Some(record) = record else {
        return Step::Sync;
    };
    match record.status {
        BatchStatus::Pending | BatchStatus::Failed => Step::Sync,
        BatchStatus::InProgress => {
            if record.attacks_remaining.is_empty() {
                Step::Collect
            } else {
                Step::Attacks
            }
        }
        BatchStatus::Completed => {
            if record.feedback.is_none() {
                Step::Feedback
            } else {
                Step::Done
            }
        }
    }
}

/// The next batch ordinal (by SAND file presence) that is not yet fully
/// processed.
pub fn next_unprocessed(config: &Config, store: &StateStore) -> Result<Option<u32>> {
    let pattern = config
        .sand_dir
        .join("batch-*.txt.gz")
        .to_string_lossy()
        .to_string();
    let mut ordinals: Vec<u32> = glob::glob(&pattern)
        .context("Failed to scan SAND directory")?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.strip_suffix(".txt.gz")?.to_string();
            crate::parse_batch_name(&name)
        })
        .collect();
    ordinals.sort_unstable();
    for ordinal in ordinals {
        let name = batch_name(ordinal);
        if resume_step(store.batch(&name)) != Step::Done {
            return Ok(Some(ordinal));
        }
    }
    Ok(None)
}

pub struct BatchRunner<'a, C: Coordinator, S: Shell> {
    config: &'a Config,
    client: &'a C,
    shell: &'a S,
    oracle: Option<&'a dyn BreachCounts>,
    poll_interval: Duration,
}

impl<'a, C: Coordinator, S: Shell> BatchRunner<'a, C, S> {
    pub fn new(
        config: &'a Config,
        client: &'a C,
        shell: &'a S,
        oracle: Option<&'a dyn BreachCounts>,
    ) -> Self {
        Self {
            config,
            client,
            shell,
            oracle,
            poll_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Print the planned steps without touching anything.
    pub fn dry_run(&self, store: &StateStore, ordinal: u32) {
        let batch = batch_name(ordinal);
        let start = resume_step(store.batch(&batch));
        println!("{}: resume step {:?}", batch, start);
        if start == Step::Done {
            println!("  nothing to do (fully processed)");
            return;
        }
        for step in [Step::Sync, Step::Attacks, Step::Collect, Step::Feedback, Step::Rebuild] {
            if step >= start {
                println!("  would run {:?}", step);
            }
        }
        if let Some(record) = store.batch(&batch) {
            if !record.attacks_remaining.is_empty() {
                println!("  attacks remaining: {}", record.attacks_remaining.join(", "));
            }
        }
    }

    /// Drive the batch to fully-processed. SYNC/ATTACKS/COLLECT failures are
    /// fatal and print a copy-pasteable resume command; FEEDBACK/REBUILD
    /// failures are not — the cracks are already durable.
    pub async fn run(&self, store: &mut StateStore, ordinal: u32) -> Result<()> {
        let batch = batch_name(ordinal);
        let start = resume_step(store.batch(&batch));
        if start == Step::Done {
            info!("{}: already fully processed", batch);
            return Ok(());
        }
        info!("{}: starting at {:?}", batch, start);

        let fatal = async {
            if start <= Step::Sync {
                self.sync(store, &batch).await?;
            }
            if start <= Step::Attacks {
                let scheduler = AttackScheduler::new(self.client, self.config)
                    .with_poll_interval(self.poll_interval);
                scheduler.run_batch(store, &batch).await?;
            }
            if start <= Step::Collect {
                self.collect(store, &batch).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if let Err(e) = fatal {
            eprintln!(
                "{} failed: {:#}\n  resume with: tumbler run --batch {} --resume",
                batch, e, ordinal
            );
            return Err(e);
        }

        if start <= Step::Feedback {
            if let Err(e) = self.feedback(store, &batch).await {
                warn!("{}: feedback stage failed: {:#}", batch, e);
                eprintln!(
                    "{} feedback failed (cracks are durable)\n  retry with: tumbler feedback --batch {}",
                    batch, ordinal
                );
                return Ok(());
            }
        }
        if let Err(e) = self.rebuild(&batch).await {
            warn!("{}: rebuild stage failed: {:#}", batch, e);
            eprintln!(
                "{} rebuild failed (cracks are durable)\n  retry with: tumbler feedback --batch {}",
                batch, ordinal
            );
        }

        // Maintenance: reorder by ROI for FUTURE batches; the finished
        // batch's record is untouched. Best effort.
        if store.state().attack_order.is_empty() {
            store.state_mut().attack_order = crate::stage2::attacks::default_order()
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        store.apply_roi_reorder();
        let ineffective = store.ineffective_attacks();
        if !ineffective.is_empty() {
            info!(
                "ineffective attacks (>=3 attempts, rate < 0.001): {}",
                ineffective.join(", ")
            );
        }
        if let Err(e) = store.save() {
            warn!("attack-order maintenance save failed: {:#}", e);
        }
        Ok(())
    }

    /// Re-run FEEDBACK and REBUILD alone. The batch's cracks are already
    /// durable, so this is safe at any point after COLLECT.
    pub async fn feedback_and_rebuild(&self, store: &mut StateStore, ordinal: u32) -> Result<()> {
        let batch = batch_name(ordinal);
        self.feedback(store, &batch).await?;
        self.rebuild(&batch).await?;
        Ok(())
    }

    /// SYNC: check the batch's SAND file and clear a failed marker so the
    /// scheduler can take over. Hashlist registration happens in the
    /// scheduler on first contact.
    async fn sync(&self, store: &mut StateStore, batch: &str) -> Result<()> {
        let sand = self.config.sand_dir.join(format!("{}.txt.gz", batch));
        if !sand.exists() {
            bail!("SAND file {} missing; run stage 1 first", sand.display());
        }
        if let Some(record) = store.batch(batch) {
            if record.status == BatchStatus::Failed {
                info!("{}: clearing failed marker and retrying", batch);
                let record = store
                    .state_mut()
                    .batches
                    .get_mut(batch)
                    .expect("record checked above");
                record.status = if record.attacks_applied.is_empty() {
                    BatchStatus::Pending
                } else {
                    BatchStatus::InProgress
                };
                record.error = None;
                store.save()?;
            }
        }
        Ok(())
    }

    /// COLLECT: pull the batch's cracked pairs, write the per-batch
    /// diamonds files, append the global JSONL, and write GLASS.
    async fn collect(&self, store: &mut StateStore, batch: &str) -> Result<()> {
        let record = store
            .batch(batch)
            .context("No state record at collect time")?;
        let hashlist_id = record.hashlist_id.context("Record has no hashlist id")?;

        // A record caught mid-transition (saved between the last attack and
        // the status write) has nothing remaining: it is complete.
        if record.attacks_remaining.is_empty() && record.status != BatchStatus::Completed {
            let record = store
                .state_mut()
                .batches
                .get_mut(batch)
                .expect("record fetched above");
            record.status = BatchStatus::Completed;
            record.completed_at = Some(Utc::now());
            store.save()?;
        }

        let pairs = self.client.get_cracked_hashes(hashlist_id).await?;
        info!("{}: collected {} cracked pairs", batch, pairs.len());

        let pairs_path = self.config.diamonds_dir.join(format!("{}.txt", batch));
        let mut out = String::new();
        for (hash, plain) in &pairs {
            out.push_str(hash);
            out.push(':');
            out.push_str(plain);
            out.push('\n');
        }
        fs::write(&pairs_path, out)
            .with_context(|| format!("Failed to write {}", pairs_path.display()))?;

        let passwords_path = self
            .config
            .diamonds_dir
            .join(format!("passwords-{}.txt", batch));
        let mut seen = HashSet::new();
        let mut passwords = String::new();
        for (_, plain) in &pairs {
            if seen.insert(plain.clone()) {
                passwords.push_str(plain);
                passwords.push('\n');
            }
        }
        fs::write(&passwords_path, passwords)
            .with_context(|| format!("Failed to write {}", passwords_path.display()))?;

        let mut jsonl = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.diamonds_file())?;
        for (hash, plain) in &pairs {
            let record = PairRecord {
                hash: hash.clone(),
                plain: plain.clone(),
            };
            writeln!(jsonl, "{}", serde_json::to_string(&record)?)?;
        }

        // GLASS = SAND minus everything Stage 2 recovered.
        let sand = self.config.sand_dir.join(format!("{}.txt.gz", batch));
        let cracked: HashSet<String> =
            pairs.iter().map(|(h, _)| h.to_ascii_uppercase()).collect();
        let glass_path = self.config.glass_dir.join(format!("{}.txt", batch));
        let mut glass = String::new();
        let mut glass_count = 0u64;
        for hash in sieve::read_hash_lines(&sand)? {
            if !cracked.contains(&hash.to_ascii_uppercase()) {
                glass.push_str(&hash);
                glass.push('\n');
                glass_count += 1;
            }
        }
        fs::write(&glass_path, glass)
            .with_context(|| format!("Failed to write {}", glass_path.display()))?;
        info!("{}: {} hashes remain as GLASS", batch, glass_count);

        // Results are captured locally; archive the hashlist on the service.
        let introspection = SqlIntrospection::new(self.shell);
        if let Err(e) = introspection.archive_hashlist(hashlist_id).await {
            warn!("{}: hashlist archival failed: {:#}", batch, e);
        }
        Ok(())
    }

    /// FEEDBACK: mine the batch's plaintexts for new roots and rules. Reads
    /// the pair file, not the deduplicated password list — how many hashes a
    /// plaintext cracked is exactly the frequency signal the analyzer needs.
    async fn feedback(&self, store: &mut StateStore, batch: &str) -> Result<()> {
        let pairs_path = self.config.diamonds_dir.join(format!("{}.txt", batch));
        let content = fs::read_to_string(&pairs_path)
            .with_context(|| format!("Failed to read {}", pairs_path.display()))?;
        let (entries, malformed) = crate::potfile::parse(&content);
        if malformed > 0 {
            warn!("{}: {} malformed diamond lines skipped", batch, malformed);
        }
        let plaintexts: Vec<String> = entries.iter().map(|e| e.plain_lossy()).collect();

        let analyzer = FeedbackAnalyzer::new(self.config)?;
        let report = analyzer.run(&plaintexts, self.oracle).await?;

        let feedback_cracks = store
            .batch(batch)
            .map(|r| {
                r.attack_results
                    .iter()
                    .filter(|res| res.attack.starts_with("feedback-"))
                    .map(|res| res.new_cracks)
                    .sum()
            })
            .unwrap_or(0);
        store.set_feedback(
            batch,
            FeedbackSummary {
                new_roots: report.new_roots,
                cohort_matched: report.cohort_matched.len() as u64,
                oracle_promoted: report.oracle_promoted.len() as u64,
                rules_added: report.rules_added.len() as u64,
                feedback_cracks,
                ran_at: Utc::now(),
            },
        )?;
        store.save()?;
        Ok(())
    }

    /// REBUILD: push the grown wordlist and rules to the remote host so the
    /// next batch's feedback attacks use them.
    async fn rebuild(&self, batch: &str) -> Result<()> {
        let uploads = [
            (self.config.beta_file(), "wordlists/BETA.txt"),
            (self.config.rule_file(), "rules/unobtainium.rule"),
        ];
        for (local, rel) in uploads {
            if !local.exists() {
                continue;
            }
            let remote = format!("{}/{}", self.config.remote_work_dir, rel);
            self.shell
                .upload_file(&local, &remote)
                .await
                .with_context(|| format!("Failed to upload {}", rel))?;
        }
        info!("{}: feedback assets rebuilt and uploaded", batch);
        Ok(())
    }
}
