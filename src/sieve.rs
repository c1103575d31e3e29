//! Streaming set-difference engine: SAND = GRAVEL − PEARLS.
//!
//! GRAVEL may hold two billion hashes and PEARLS two hundred million, so the
//! only thing held in memory is the PEARLS set — 20-byte binary keys, roughly
//! 8 GB including hash-table overhead at the top end. GRAVEL is streamed line
//! by line and survivors are flushed in fixed-size output chunks.

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct SieveConfig {
    /// Directory of GRAVEL batch files, plain or gzipped, one uppercase
    /// 40-char hex hash per line.
    pub gravel_dir: PathBuf,
    /// PEARLS file: lines of `HASH:PLAIN`.
    pub pearls_file: PathBuf,
    pub output_dir: PathBuf,
    /// Maximum lines per output chunk.
    pub batch_size: usize,
    pub show_progress: bool,
}

#[derive(Debug, Default)]
pub struct SieveReport {
    pub gravel_lines: u64,
    pub matched: u64,
    pub written: u64,
    pub malformed: u64,
    pub output_files: Vec<PathBuf>,
}

/// Open a batch file, transparently ungzipping by extension.
fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Parse a GRAVEL line into a 20-byte binary key. `None` for malformed lines
/// (anything that is not 40 hex chars after trim).
pub fn parse_hash_key(line: &str) -> Option<[u8; 20]> {
    let line = line.trim();
    if line.len() != 40 {
        return None;
    }
    let mut key = [0u8; 20];
    hex::decode_to_slice(line.to_ascii_uppercase(), &mut key).ok()?;
    Some(key)
}

/// Load the PEARLS hash set. Lines are either `HASH:PLAIN` or the pair file's
/// JSONL records; only the hash matters.
pub fn load_pearls_set(path: &Path) -> Result<HashSet<[u8; 20]>> {
    let mut set = HashSet::new();
    if !path.exists() {
        warn!("PEARLS file {} missing; sieving against empty set", path.display());
        return Ok(set);
    }
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    for line in reader.lines() {
        let line = line?;
        let hash_part = if line.trim_start().starts_with('{') {
            match serde_json::from_str::<crate::potfile::PairRecord>(&line) {
                Ok(record) => record.hash,
                Err(_) => continue,
            }
        } else {
            line.split(':').next().unwrap_or("").to_string()
        };
        if let Some(key) = parse_hash_key(&hash_part) {
            set.insert(key);
        }
    }
    Ok(set)
}

/// Read every line of a hash file, plain or gzipped, skipping blanks.
pub fn read_hash_lines(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(open_maybe_gz(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}

/// Rolling gzipped output writer producing `batch-NNNN.txt.gz` in sequence.
struct ChunkWriter {
    output_dir: PathBuf,
    batch_size: usize,
    current: Option<BufWriter<GzEncoder<File>>>,
    current_path: Option<PathBuf>,
    lines_in_chunk: usize,
    next_ordinal: u32,
    files: Vec<PathBuf>,
}

impl ChunkWriter {
    fn new(output_dir: &Path, batch_size: usize) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            batch_size,
            current: None,
            current_path: None,
            lines_in_chunk: 0,
            next_ordinal: 1,
            files: Vec::new(),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if self.current.is_none() {
            let path = self
                .output_dir
                .join(format!("batch-{:04}.txt.gz", self.next_ordinal));
            self.next_ordinal += 1;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            self.current = Some(BufWriter::new(GzEncoder::new(file, Compression::fast())));
            self.current_path = Some(path);
            self.lines_in_chunk = 0;
        }
        let writer = self.current.as_mut().expect("writer just ensured");
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        self.lines_in_chunk += 1;
        if self.lines_in_chunk >= self.batch_size {
            self.finish_chunk()?;
        }
        Ok(())
    }

    fn finish_chunk(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("Failed to flush chunk: {}", e))?
                .finish()
                .context("Failed to finish gzip stream")?;
            self.files
                .push(self.current_path.take().expect("path tracked with writer"));
        }
        Ok(())
    }

    /// Remove the partially written chunk after a mid-write failure.
    fn abort(&mut self) {
        self.current = None;
        if let Some(path) = self.current_path.take() {
            let _ = fs::remove_file(&path);
        }
    }
}

/// List the GRAVEL batch files in lexical order, which preserves the
/// concatenated input order and keeps the stage deterministic.
fn list_gravel_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.ends_with(".txt") || name.ends_with(".txt.gz")
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Stream every GRAVEL file through the PEARLS set, writing survivors to
/// fixed-size SAND chunks. Output order preserves input order.
pub fn run(config: &SieveConfig) -> Result<SieveReport> {
    let pearls = load_pearls_set(&config.pearls_file)?;
    info!("Loaded {} PEARLS hashes", pearls.len());

    let gravel_files = list_gravel_files(&config.gravel_dir)?;
    if gravel_files.is_empty() {
        bail!("No GRAVEL batch files in {}", config.gravel_dir.display());
    }
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    let bar = if config.show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:.bold.dim} {spinner} {msg}")
                .expect("static template"),
        );
        bar.set_prefix("Sieve");
        Some(bar)
    } else {
        None
    };

    let mut report = SieveReport::default();
    let mut writer = ChunkWriter::new(&config.output_dir, config.batch_size);

    for path in &gravel_files {
        let reader = BufReader::new(open_maybe_gz(path)?);
        for line in reader.lines() {
            let line = line.with_context(|| format!("Read error in {}", path.display()))?;
            report.gravel_lines += 1;
            let Some(key) = parse_hash_key(&line) else {
                report.malformed += 1;
                continue;
            };
            if pearls.contains(&key) {
                report.matched += 1;
            } else {
                if let Err(e) = writer.write_line(line.trim()) {
                    writer.abort();
                    return Err(e.context("SAND write failed; partial chunk removed"));
                }
                report.written += 1;
            }
            if report.gravel_lines % 1_000_000 == 0 {
                if let Some(ref bar) = bar {
                    bar.set_message(format!(
                        "{}M lines, {} written",
                        report.gravel_lines / 1_000_000,
                        report.written
                    ));
                }
            }
        }
    }
    writer.finish_chunk()?;
    report.output_files = writer.files;

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    // |SAND| + |PEARLS ∩ GRAVEL| = |GRAVEL| minus whatever was malformed.
    let accounted = report.written + report.matched + report.malformed;
    if accounted != report.gravel_lines {
        warn!(
            "Sieve count mismatch: {} written + {} matched + {} malformed != {} input lines",
            report.written, report.matched, report.malformed, report.gravel_lines
        );
    }
    if report.malformed > 0 {
        info!("Skipped {} malformed GRAVEL lines", report.malformed);
    }
    Ok(report)
}

/// Filter a single GRAVEL file against an in-memory cracked set, writing the
/// survivors gzipped. Used by Stage 1, which already holds the potfile hashes.
pub fn filter_file(
    gravel_path: &Path,
    cracked: &HashSet<[u8; 20]>,
    output_path: &Path,
) -> Result<SieveReport> {
    let mut report = SieveReport::default();
    let reader = BufReader::new(open_maybe_gz(gravel_path)?);
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    let mut writer = BufWriter::new(GzEncoder::new(file, Compression::fast()));

    for line in reader.lines() {
        let line = line?;
        report.gravel_lines += 1;
        let Some(key) = parse_hash_key(&line) else {
            report.malformed += 1;
            continue;
        };
        if cracked.contains(&key) {
            report.matched += 1;
        } else {
            if let Err(e) = writer
                .write_all(line.trim().as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
            {
                drop(writer);
                let _ = fs::remove_file(output_path);
                return Err(anyhow::Error::from(e)
                    .context("SAND write failed; partial file removed"));
            }
            report.written += 1;
        }
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush SAND file: {}", e))?
        .finish()
        .context("Failed to finish gzip stream")?;
    report.output_files.push(output_path.to_path_buf());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_hash(n: u32) -> String {
        format!("{:040X}", n)
    }

    fn read_gz_lines(path: &Path) -> Vec<String> {
        let mut content = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        content.lines().map(|l| l.to_string()).collect()
    }

    fn write_gravel(dir: &Path, name: &str, hashes: &[String]) {
        fs::write(dir.join(name), hashes.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_parse_hash_key_accepts_40_hex_only() {
        assert!(parse_hash_key(&fake_hash(1)).is_some());
        assert!(parse_hash_key("  too short  ").is_none());
        assert!(parse_hash_key(&"G".repeat(40)).is_none());
        // Lowercase input normalizes to the same key.
        assert_eq!(
            parse_hash_key(&fake_hash(255).to_lowercase()),
            parse_hash_key(&fake_hash(255))
        );
    }

    #[test]
    fn test_sieve_output_plus_matched_equals_input() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        let hashes: Vec<String> = (0..100).map(fake_hash).collect();
        write_gravel(&gravel_dir, "batch-0001.txt", &hashes);

        // PEARLS covers every third hash.
        let pearls_file = dir.path().join("pearls.txt");
        let pearls: Vec<String> = (0..100)
            .step_by(3)
            .map(|n| format!("{}:plain{}", fake_hash(n), n))
            .collect();
        fs::write(&pearls_file, pearls.join("\n")).unwrap();

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file,
            output_dir: dir.path().join("sand"),
            batch_size: 1000,
            show_progress: false,
        })
        .unwrap();

        assert_eq!(report.gravel_lines, 100);
        assert_eq!(report.matched, 34);
        assert_eq!(report.written + report.matched, report.gravel_lines);

        // Every output hash is in GRAVEL and not in PEARLS.
        let out = read_gz_lines(&report.output_files[0]);
        assert_eq!(out.len() as u64, report.written);
        for line in &out {
            let n = u32::from_str_radix(line, 16).unwrap();
            assert_ne!(n % 3, 0, "hash {} should have been sieved out", line);
        }
    }

    #[test]
    fn test_sieve_chunks_output_at_batch_size() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        let hashes: Vec<String> = (0..25).map(fake_hash).collect();
        write_gravel(&gravel_dir, "batch-0001.txt", &hashes);
        let pearls_file = dir.path().join("pearls.txt");
        fs::write(&pearls_file, "").unwrap();

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file,
            output_dir: dir.path().join("sand"),
            batch_size: 10,
            show_progress: false,
        })
        .unwrap();

        assert_eq!(report.output_files.len(), 3);
        assert_eq!(read_gz_lines(&report.output_files[0]).len(), 10);
        assert_eq!(read_gz_lines(&report.output_files[2]).len(), 5);
        // Sequential naming.
        assert!(report.output_files[0].ends_with("batch-0001.txt.gz"));
        assert!(report.output_files[2].ends_with("batch-0003.txt.gz"));
    }

    #[test]
    fn test_sieve_preserves_input_order() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        // Two files; lexical file order then line order.
        write_gravel(&gravel_dir, "batch-0001.txt", &[fake_hash(5), fake_hash(3)]);
        write_gravel(&gravel_dir, "batch-0002.txt", &[fake_hash(9), fake_hash(1)]);
        let pearls_file = dir.path().join("pearls.txt");
        fs::write(&pearls_file, "").unwrap();

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file,
            output_dir: dir.path().join("sand"),
            batch_size: 1000,
            show_progress: false,
        })
        .unwrap();

        let out = read_gz_lines(&report.output_files[0]);
        assert_eq!(out, vec![fake_hash(5), fake_hash(3), fake_hash(9), fake_hash(1)]);
    }

    #[test]
    fn test_sieve_counts_malformed_lines() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        fs::write(
            gravel_dir.join("batch-0001.txt"),
            format!("{}\nnot-a-hash\n{}\n", fake_hash(1), fake_hash(2)),
        )
        .unwrap();
        let pearls_file = dir.path().join("pearls.txt");
        fs::write(&pearls_file, "").unwrap();

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file,
            output_dir: dir.path().join("sand"),
            batch_size: 1000,
            show_progress: false,
        })
        .unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.written, 2);
    }

    #[test]
    fn test_sieve_reads_gzipped_gravel() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        let path = gravel_dir.join("batch-0001.txt.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        for n in 0..5 {
            writeln!(enc, "{}", fake_hash(n)).unwrap();
        }
        enc.finish().unwrap();
        let pearls_file = dir.path().join("pearls.txt");
        fs::write(&pearls_file, "").unwrap();

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file,
            output_dir: dir.path().join("sand"),
            batch_size: 1000,
            show_progress: false,
        })
        .unwrap();
        assert_eq!(report.written, 5);
    }

    #[test]
    fn test_filter_file_splits_cracked_from_survivors() {
        let dir = tempdir().unwrap();
        let gravel = dir.path().join("batch-0001.txt");
        fs::write(
            &gravel,
            (0..10).map(fake_hash).collect::<Vec<_>>().join("\n"),
        )
        .unwrap();

        let mut cracked = HashSet::new();
        cracked.insert(parse_hash_key(&fake_hash(2)).unwrap());
        cracked.insert(parse_hash_key(&fake_hash(7)).unwrap());

        let out = dir.path().join("sand.txt.gz");
        let report = filter_file(&gravel, &cracked, &out).unwrap();
        assert_eq!(report.gravel_lines, 10);
        assert_eq!(report.matched, 2);
        assert_eq!(report.written, 8);
        assert_eq!(read_gz_lines(&out).len(), 8);
    }

    #[test]
    fn test_missing_pearls_file_sieves_everything_through() {
        let dir = tempdir().unwrap();
        let gravel_dir = dir.path().join("gravel");
        fs::create_dir_all(&gravel_dir).unwrap();
        write_gravel(&gravel_dir, "batch-0001.txt", &[fake_hash(1)]);

        let report = run(&SieveConfig {
            gravel_dir,
            pearls_file: dir.path().join("nonexistent.txt"),
            output_dir: dir.path().join("sand"),
            batch_size: 1000,
            show_progress: false,
        })
        .unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.matched, 0);
    }
}
