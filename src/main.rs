use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tumbler::config::Config;
use tumbler::feedback::BreachOracle;
use tumbler::orchestrator::{BatchRunner, next_unprocessed};
use tumbler::remote::RemoteShell;
use tumbler::service::CoordinatorClient;
use tumbler::state::{GravelStore, StateStore};
use tumbler::{batch_name, review, sieve, stage1, ui};

#[derive(Parser)]
#[command(name = "tumbler")]
#[command(version, about = "Two-stage feedback-driven password-cracking orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Data directory holding the tiered material and state files.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run Stage 2 batches through SYNC, ATTACKS, COLLECT, FEEDBACK, REBUILD
    Run {
        /// Batch ordinal to run.
        #[arg(long)]
        batch: u32,
        /// Run the contiguous range batch..=through.
        #[arg(long)]
        through: Option<u32>,
        /// Resume from the step implied by state (this is also the default).
        #[arg(long)]
        resume: bool,
        /// Print the planned steps; touch nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the next unprocessed batch
    Next {
        /// Process this many batches, re-resolving "next" after each.
        #[arg(long, default_value = "1")]
        count: u32,
        #[arg(long)]
        dry_run: bool,
    },
    /// Read-only progress report
    Status,
    /// Run Stage 1 (GRAVEL -> PEARLS + SAND) for one batch
    Stage1 {
        #[arg(long)]
        batch: u32,
    },
    /// Recompute SAND = GRAVEL - PEARLS as a standalone pass
    Sieve {
        /// Maximum lines per output chunk.
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Re-run the feedback stage for an already-collected batch
    Feedback {
        #[arg(long)]
        batch: u32,
    },
    /// ROI table and recommendations (read-only)
    Review,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if cli.verbose { "tumbler=debug" } else { "tumbler=info" })
            }),
        )
        .with_target(false)
        .init();

    let config = Config::new(cli.data_dir.clone(), cli.verbose)?;

    match &cli.command {
        Commands::Run {
            batch,
            through,
            resume: _,
            dry_run,
        } => {
            let through = through.unwrap_or(*batch);
            if through < *batch {
                bail!("--through {} is before --batch {}", through, batch);
            }
            run_batches(&config, *batch..=through, *dry_run).await?;
        }
        Commands::Next { count, dry_run } => {
            run_next(&config, *count, *dry_run).await?;
        }
        Commands::Status => cmd_status(&config)?,
        Commands::Stage1 { batch } => cmd_stage1(&config, *batch).await?,
        Commands::Sieve { batch_size } => cmd_sieve(&config, *batch_size)?,
        Commands::Feedback { batch } => cmd_feedback(&config, *batch).await?,
        Commands::Review => cmd_review(&config)?,
    }

    Ok(())
}

/// Run `work` until it completes or Ctrl-C arrives. `None` means the user
/// interrupted; the detached remote session keeps running either way.
async fn until_ctrl_c<T>(work: impl std::future::Future<Output = T>) -> Option<T> {
    tokio::select! {
        result = work => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    }
}

/// Shutdown path for an interrupt: flush any pending debounced state save,
/// tell the user how to pick the batch back up, and exit nonzero.
fn interrupted(store: &mut StateStore, resume: &str) -> Result<()> {
    store.flush()?;
    eprintln!(
        "interrupted: remote work keeps running (detached)\n  resume with: {}",
        resume
    );
    std::process::exit(1);
}

/// Advisory only: a second orchestrator gets a warning, not a refusal.
fn try_advisory_lock(config: &Config) -> Option<std::fs::File> {
    use fs2::FileExt;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&config.lock_file)
        .ok()?;
    if file.try_lock_exclusive().is_err() {
        warn!(
            "another orchestrator appears to hold {}; continuing anyway",
            config.lock_file.display()
        );
        return None;
    }
    Some(file)
}

async fn run_batches(
    config: &Config,
    ordinals: std::ops::RangeInclusive<u32>,
    dry_run: bool,
) -> Result<()> {
    config.ensure_directories()?;
    let _lock = if dry_run { None } else { try_advisory_lock(config) };

    let shell = RemoteShell::new(config);
    let client = CoordinatorClient::new(config);
    let oracle = BreachOracle::new(config);
    let mut store = StateStore::load(&config.sand_state_file);
    let runner = BatchRunner::new(config, &client, &shell, Some(&oracle));

    for ordinal in ordinals {
        if dry_run {
            runner.dry_run(&store, ordinal);
            continue;
        }
        ui::print_batch_header(&batch_name(ordinal), "resume point from state");
        match until_ctrl_c(runner.run(&mut store, ordinal)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                store.flush()?;
                return Err(e);
            }
            None => {
                return interrupted(
                    &mut store,
                    &format!("tumbler run --batch {} --resume", ordinal),
                );
            }
        }
    }
    store.flush()?;
    Ok(())
}

async fn run_next(config: &Config, count: u32, dry_run: bool) -> Result<()> {
    config.ensure_directories()?;
    let _lock = if dry_run { None } else { try_advisory_lock(config) };

    let shell = RemoteShell::new(config);
    let client = CoordinatorClient::new(config);
    let oracle = BreachOracle::new(config);
    let mut store = StateStore::load(&config.sand_state_file);
    let runner = BatchRunner::new(config, &client, &shell, Some(&oracle));

    for _ in 0..count {
        let Some(ordinal) = next_unprocessed(config, &store)? else {
            println!("No unprocessed batches remain.");
            break;
        };
        if dry_run {
            runner.dry_run(&store, ordinal);
            break;
        }
        ui::print_batch_header(&batch_name(ordinal), "next unprocessed");
        match until_ctrl_c(runner.run(&mut store, ordinal)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                store.flush()?;
                return Err(e);
            }
            None => {
                return interrupted(
                    &mut store,
                    &format!("tumbler run --batch {} --resume", ordinal),
                );
            }
        }
    }
    store.flush()?;
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let gravel = GravelStore::load(&config.gravel_state_file);
    let sand = StateStore::load(&config.sand_state_file);
    ui::print_status(gravel.state(), sand.state());
    Ok(())
}

async fn cmd_stage1(config: &Config, ordinal: u32) -> Result<()> {
    config.ensure_directories()?;
    let _lock = try_advisory_lock(config);
    let shell = RemoteShell::new(config);
    let mut store = GravelStore::load(&config.gravel_state_file);
    let processor = stage1::Stage1Processor::new(&shell, config);
    let batch = batch_name(ordinal);
    // The gravel store saves eagerly; an interrupt only needs the hint that
    // the detached job survives.
    let Some(result) = until_ctrl_c(processor.process(&mut store, &batch)).await else {
        eprintln!(
            "interrupted: remote job keeps running (detached)\n  resume with: tumbler stage1 --batch {}",
            ordinal
        );
        std::process::exit(1);
    };
    let record = result?;
    println!(
        "{}: {} pearls, {} sand, crack rate {}%",
        batch, record.pearl_count, record.sand_count, record.crack_rate
    );
    Ok(())
}

fn cmd_sieve(config: &Config, batch_size: Option<usize>) -> Result<()> {
    config.ensure_directories()?;
    let report = sieve::run(&sieve::SieveConfig {
        gravel_dir: config.gravel_dir.clone(),
        pearls_file: config.pearls_file(),
        output_dir: config.sand_dir.clone(),
        batch_size: batch_size.unwrap_or(config.sieve_batch_size),
        show_progress: true,
    })?;
    println!(
        "{} gravel lines: {} matched pearls, {} written to {} sand files ({} malformed)",
        report.gravel_lines,
        report.matched,
        report.written,
        report.output_files.len(),
        report.malformed
    );
    Ok(())
}

async fn cmd_feedback(config: &Config, ordinal: u32) -> Result<()> {
    config.ensure_directories()?;
    let shell = RemoteShell::new(config);
    let client = CoordinatorClient::new(config);
    let oracle = BreachOracle::new(config);
    let mut store = StateStore::load(&config.sand_state_file);
    let runner = BatchRunner::new(config, &client, &shell, Some(&oracle));
    match until_ctrl_c(runner.feedback_and_rebuild(&mut store, ordinal)).await {
        Some(result) => {
            result.with_context(|| format!("Feedback stage failed for {}", batch_name(ordinal)))?
        }
        None => {
            return interrupted(
                &mut store,
                &format!("tumbler feedback --batch {}", ordinal),
            );
        }
    }
    store.flush()?;
    println!("{}: feedback and rebuild complete", batch_name(ordinal));
    Ok(())
}

fn cmd_review(config: &Config) -> Result<()> {
    let store = StateStore::load(&config.sand_state_file);
    let review = review::analyze(store.state());
    ui::print_review(&review);
    let ineffective = store.ineffective_attacks();
    if !ineffective.is_empty() {
        println!(
            "\nMarked ineffective (>=3 attempts, avg rate < 0.001): {}",
            ineffective.join(", ")
        );
    }
    Ok(())
}
