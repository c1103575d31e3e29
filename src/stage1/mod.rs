//! Stage 1 processor: drives GRAVEL → PEARLS + SAND for one batch with the
//! fixed universal attack (dictionary x large rule file) on the remote host.

use crate::config::Config;
use crate::potfile::{self, PairRecord};
use crate::remote::{JobController, JobControllerConfig, JobSpec, Shell};
use crate::sieve;
use crate::state::{BatchStatus, GravelBatchRecord, GravelStore};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// The universal attack assets, expected under the remote work directory.
const BASELINE_WORDLIST: &str = "wordlists/baseline.txt";
const UNIVERSAL_RULE: &str = "rules/universal.rule";

pub struct Stage1Processor<'a, S: Shell> {
    shell: &'a S,
    config: &'a Config,
    job_config: JobControllerConfig,
}

impl<'a, S: Shell> Stage1Processor<'a, S> {
    pub fn new(shell: &'a S, config: &'a Config) -> Self {
        Self {
            shell,
            config,
            job_config: JobControllerConfig::default(),
        }
    }

    pub fn with_job_config(mut self, job_config: JobControllerConfig) -> Self {
        self.job_config = job_config;
        self
    }

    fn remote_path(&self, rel: &str) -> String {
        format!("{}/{}", self.config.remote_work_dir, rel)
    }

    /// The batch's GRAVEL file, plain or gzipped.
    fn local_gravel(&self, batch: &str) -> Result<PathBuf> {
        let plain = self.config.gravel_dir.join(format!("{}.txt", batch));
        if plain.exists() {
            return Ok(plain);
        }
        let gz = self.config.gravel_dir.join(format!("{}.txt.gz", batch));
        if gz.exists() {
            return Ok(gz);
        }
        bail!(
            "No GRAVEL file for {} in {}",
            batch,
            self.config.gravel_dir.display()
        )
    }

    /// Run the full Stage 1 pipeline for one batch. Re-running a completed
    /// batch returns the stored result without touching the remote host.
    pub async fn process(&self, store: &mut GravelStore, batch: &str) -> Result<GravelBatchRecord> {
        if let Some(record) = store.batch(batch) {
            if record.status == BatchStatus::Completed {
                info!("{}: already completed, returning stored result", batch);
                return Ok(record.clone());
            }
        }

        let local_gravel = self.local_gravel(batch)?;
        let remote_hashes = self.remote_path(&format!("hashlists/{}.txt", batch));
        let potfile_path = self.remote_path(&format!("potfiles/{}.pot", batch));
        let log_path = self.remote_path(&format!("logs/{}.log", batch));

        self.ensure_uploaded(&local_gravel, &remote_hashes).await?;
        self.ensure_assets().await?;

        let spec = JobSpec {
            batch: batch.to_string(),
            command: format!(
                "hashcat -m 100 -a 0 -w 3 --status --status-timer 60 \
                 --potfile-path {} {} {} -r {}",
                potfile_path, remote_hashes, BASELINE_WORDLIST, UNIVERSAL_RULE
            ),
            work_dir: self.config.remote_work_dir.clone(),
            log_path: log_path.clone(),
            potfile_path: potfile_path.clone(),
        };

        let controller = JobController::new(self.shell, self.job_config.clone());
        let outcome = controller.run_attack(&spec).await?;

        let local_pot = self.config.data_dir.join(format!("{}.pot", batch));
        self.shell
            .download_file(&potfile_path, &local_pot)
            .await
            .context("Failed to download potfile")?;
        let pot_content = fs::read_to_string(&local_pot).unwrap_or_default();

        let record = self.finalize_local(
            store,
            batch,
            &local_gravel,
            &pot_content,
            outcome.duration_seconds,
        )?;

        // Remote cleanup; the potfile has already been captured locally.
        self.shell
            .exec(&format!("rm -f {} {}", remote_hashes, potfile_path))
            .await?;
        let _ = fs::remove_file(&local_pot);

        Ok(record)
    }

    /// Upload `local` unless the remote copy already has the same size.
    async fn ensure_uploaded(&self, local: &std::path::Path, remote: &str) -> Result<()> {
        let local_size = fs::metadata(local)
            .with_context(|| format!("Failed to stat {}", local.display()))?
            .len();
        let cmd = format!("stat -c %s {} 2>/dev/null || echo -1", remote);
        let (_, stdout) = self.shell.exec_status(&cmd).await?;
        let remote_size: i64 = stdout.trim().parse().unwrap_or(-1);
        if remote_size == local_size as i64 {
            return Ok(());
        }
        info!(
            "uploading {} ({} bytes, remote has {})",
            local.display(),
            local_size,
            remote_size
        );
        self.shell.upload_file(local, remote).await?;
        Ok(())
    }

    /// Upload the dictionary and rule if the remote host is missing them.
    async fn ensure_assets(&self) -> Result<()> {
        for rel in [BASELINE_WORDLIST, UNIVERSAL_RULE] {
            let remote = self.remote_path(rel);
            let (code, _) = self
                .shell
                .exec_status(&format!("test -f {}", remote))
                .await?;
            if code != 0 {
                let local = self.config.data_dir.join(rel);
                if !local.exists() {
                    bail!(
                        "Attack asset {} missing both remotely and locally at {}",
                        rel,
                        local.display()
                    );
                }
                info!("uploading missing asset {}", rel);
                self.shell.upload_file(&local, &remote).await?;
            }
        }
        Ok(())
    }

    /// The pure-local tail of the pipeline: parse the potfile, split GRAVEL
    /// into PEARLS and SAND, verify counts, and write the state record.
    pub fn finalize_local(
        &self,
        store: &mut GravelStore,
        batch: &str,
        local_gravel: &std::path::Path,
        pot_content: &str,
        duration_seconds: u64,
    ) -> Result<GravelBatchRecord> {
        let (entries, malformed) = potfile::parse(pot_content);
        if malformed > 0 {
            warn!("{}: skipped {} malformed potfile lines", batch, malformed);
        }

        let cracked: HashSet<[u8; 20]> = entries
            .iter()
            .filter_map(|e| sieve::parse_hash_key(&e.hash))
            .collect();

        let sand_file = self.config.sand_dir.join(format!("{}.txt.gz", batch));
        let report = sieve::filter_file(local_gravel, &cracked, &sand_file)?;

        let pearls_file = self.config.pearls_file();
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&pearls_file)
            .with_context(|| format!("Failed to open {}", pearls_file.display()))?;
        for entry in &entries {
            let line = serde_json::to_string(&PairRecord::from(entry))?;
            writeln!(out, "{}", line)?;
        }

        let pearl_count = entries.len() as u64;
        if pearl_count + report.written != report.gravel_lines {
            // The state is written anyway; the operator must investigate.
            warn!(
                "{}: |PEARLS| {} + |SAND| {} != |GRAVEL| {}",
                batch, pearl_count, report.written, report.gravel_lines
            );
        }

        let crack_rate = if report.gravel_lines > 0 {
            format!(
                "{:.2}",
                pearl_count as f64 / report.gravel_lines as f64 * 100.0
            )
        } else {
            "0.00".to_string()
        };
        let record = GravelBatchRecord {
            status: BatchStatus::Completed,
            hash_count: report.gravel_lines,
            pearl_count,
            sand_count: report.written,
            crack_rate,
            duration_seconds,
            completed_at: Some(Utc::now()),
        };
        store.record_batch(batch, record.clone());
        store.save()?;
        info!(
            "{}: {} pearls, {} sand, crack rate {}%",
            batch, record.pearl_count, record.sand_count, record.crack_rate
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// A shell that records calls and fails anything unscripted; the local
    /// finalize path must never touch it.
    #[derive(Default)]
    struct RecordingShell {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Shell for RecordingShell {
        async fn exec(&self, cmd: &str) -> Result<String, RemoteError> {
            self.commands.lock().unwrap().push(cmd.to_string());
            Ok(String::new())
        }

        async fn exec_status(&self, cmd: &str) -> Result<(i32, String), RemoteError> {
            self.commands.lock().unwrap().push(cmd.to_string());
            Ok((0, String::new()))
        }

        async fn upload_file(
            &self,
            _local: &std::path::Path,
            remote: &str,
        ) -> Result<(), RemoteError> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("upload {}", remote));
            Ok(())
        }

        async fn download_file(
            &self,
            remote: &str,
            _local: &std::path::Path,
        ) -> Result<(), RemoteError> {
            self.commands
                .lock()
                .unwrap()
                .push(format!("download {}", remote));
            Ok(())
        }
    }

    fn fake_hash(n: u32) -> String {
        format!("{:040X}", n)
    }

    fn setup(dir: &std::path::Path) -> (Config, GravelStore) {
        let config = Config::new(Some(dir.to_path_buf()), false).unwrap();
        config.ensure_directories().unwrap();
        let store = GravelStore::load(&config.gravel_state_file);
        (config, store)
    }

    fn write_gravel(config: &Config, batch: &str, count: u32) -> PathBuf {
        let path = config.gravel_dir.join(format!("{}.txt", batch));
        let lines: Vec<String> = (0..count).map(fake_hash).collect();
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_completed_batch_short_circuits_without_remote_calls() {
        let dir = tempdir().unwrap();
        let (config, mut store) = setup(dir.path());
        store.record_batch(
            "batch-0001",
            GravelBatchRecord {
                status: BatchStatus::Completed,
                hash_count: 100,
                pearl_count: 30,
                sand_count: 70,
                crack_rate: "30.00".to_string(),
                duration_seconds: 60,
                completed_at: Some(Utc::now()),
            },
        );

        let shell = RecordingShell::default();
        let processor = Stage1Processor::new(&shell, &config);
        let record = processor.process(&mut store, "batch-0001").await.unwrap();

        assert_eq!(record.pearl_count, 30);
        assert!(shell.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_finalize_splits_pearls_and_sand() {
        let dir = tempdir().unwrap();
        let (config, mut store) = setup(dir.path());
        let gravel = write_gravel(&config, "batch-0001", 10);

        // Crack hashes 2, 5 and 7.
        let pot: String = [2u32, 5, 7]
            .iter()
            .map(|n| format!("{}:plain{}\n", fake_hash(*n), n))
            .collect();

        let shell = RecordingShell::default();
        let processor = Stage1Processor::new(&shell, &config);
        let record = processor
            .finalize_local(&mut store, "batch-0001", &gravel, &pot, 90)
            .unwrap();

        assert_eq!(record.hash_count, 10);
        assert_eq!(record.pearl_count, 3);
        assert_eq!(record.sand_count, 7);
        assert_eq!(record.crack_rate, "30.00");
        assert_eq!(record.status, BatchStatus::Completed);

        // PEARLS appended as JSONL pairs.
        let pearls = fs::read_to_string(config.pearls_file()).unwrap();
        assert_eq!(pearls.lines().count(), 3);
        assert!(pearls.contains("plain2"));

        // SAND written gzipped next to the other batches.
        assert!(config.sand_dir.join("batch-0001.txt.gz").exists());

        // State persisted.
        let reloaded = GravelStore::load(&config.gravel_state_file);
        assert_eq!(reloaded.batch("batch-0001").unwrap().pearl_count, 3);
    }

    #[test]
    fn test_finalize_rerun_yields_same_counts() {
        let dir = tempdir().unwrap();
        let (config, mut store) = setup(dir.path());
        let gravel = write_gravel(&config, "batch-0002", 20);
        let pot = format!("{}:onlyone\n", fake_hash(4));

        let shell = RecordingShell::default();
        let processor = Stage1Processor::new(&shell, &config);
        let first = processor
            .finalize_local(&mut store, "batch-0002", &gravel, &pot, 30)
            .unwrap();
        let second = processor
            .finalize_local(&mut store, "batch-0002", &gravel, &pot, 30)
            .unwrap();

        assert_eq!(first.pearl_count, second.pearl_count);
        assert_eq!(first.sand_count, second.sand_count);
        assert_eq!(first.crack_rate, second.crack_rate);
    }

    #[test]
    fn test_finalize_decodes_hex_plaintexts() {
        let dir = tempdir().unwrap();
        let (config, mut store) = setup(dir.path());
        let gravel = write_gravel(&config, "batch-0003", 5);
        let pot = format!("{}:$HEX[68656c6c6f]\n", fake_hash(1));

        let shell = RecordingShell::default();
        let processor = Stage1Processor::new(&shell, &config);
        processor
            .finalize_local(&mut store, "batch-0003", &gravel, &pot, 10)
            .unwrap();

        let pearls = fs::read_to_string(config.pearls_file()).unwrap();
        assert!(pearls.contains("\"plain\":\"hello\""));
    }

    #[test]
    fn test_missing_gravel_file_is_an_error() {
        let dir = tempdir().unwrap();
        let (config, _) = setup(dir.path());
        let shell = RecordingShell::default();
        let processor = Stage1Processor::new(&shell, &config);
        let err = processor.local_gravel("batch-9999").unwrap_err();
        assert!(err.to_string().contains("batch-9999"));
    }
}
