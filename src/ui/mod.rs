//! Console output for the orchestrator: batch headers, the status report,
//! and the review table.

use crate::review::Review;
use crate::state::{BatchStatus, GravelState, PipelineState};
use console::style;

pub fn print_batch_header(batch: &str, step: &str) {
    println!();
    println!("{}", style("═".repeat(70)).cyan());
    println!(
        "{} {} {}",
        style("▶").green().bold(),
        style(batch).yellow().bold(),
        style(format!("starting at {}", step)).dim()
    );
    println!("{}", style("═".repeat(70)).cyan());
}

fn status_label(status: BatchStatus) -> console::StyledObject<&'static str> {
    match status {
        BatchStatus::Pending => style("pending").dim(),
        BatchStatus::InProgress => style("in_progress").yellow(),
        BatchStatus::Completed => style("completed").green(),
        BatchStatus::Failed => style("failed").red(),
    }
}

/// Read-only progress report over both state files.
pub fn print_status(gravel: &GravelState, sand: &PipelineState) {
    println!("{}", style("Stage 1 (GRAVEL -> PEARLS + SAND)").bold());
    if gravel.batches.is_empty() {
        println!("  no batches processed");
    }
    let mut pearls_total = 0u64;
    for (name, record) in &gravel.batches {
        pearls_total += record.pearl_count;
        println!(
            "  {} {} {} pearls, {} sand, {}%",
            name,
            status_label(record.status),
            record.pearl_count,
            record.sand_count,
            record.crack_rate
        );
    }
    if pearls_total > 0 {
        println!("  total pearls: {}", style(pearls_total).green());
    }

    println!();
    println!("{}", style("Stage 2 (SAND -> DIAMONDS + GLASS)").bold());
    if sand.batches.is_empty() {
        println!("  no batches started");
    }
    for (name, record) in &sand.batches {
        let progress = format!(
            "{}/{} attacks",
            record.attacks_applied.len(),
            record.attacks_applied.len() + record.attacks_remaining.len()
        );
        let feedback = if record.feedback.is_some() {
            style("feedback done").green().to_string()
        } else {
            style("feedback pending").dim().to_string()
        };
        println!(
            "  {} {} {} cracked, {}, {}",
            name,
            status_label(record.status),
            record.cracked,
            progress,
            feedback
        );
        if let Some(error) = &record.error {
            println!("      {}", style(error).red());
        }
    }
}

/// The ROI table plus recommendations, most productive attacks first.
pub fn print_review(review: &Review) {
    println!(
        "{:<22} {:>7} {:>9} {:>9} {:>11} {:>9}",
        style("attack").bold(),
        "batches",
        "cracks",
        "rate",
        "cracks/min",
        "cost%"
    );
    let mut rows = review.rows.clone();
    rows.sort_by(|a, b| b.cracks.cmp(&a.cracks));
    for row in &rows {
        let per_min = row
            .cracks_per_min
            .map(|m| format!("{:.1}", m))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<22} {:>7} {:>9} {:>9.5} {:>11} {:>8.1}%",
            row.attack, row.batches, row.cracks, row.rate, per_min, row.cost_share_pct
        );
    }

    if review.recommendations.is_empty() {
        println!("\n{}", style("No recommendations.").dim());
        return;
    }
    println!("\n{}", style("Recommendations").bold());
    for recommendation in &review.recommendations {
        println!("  {}", recommendation);
    }
}
