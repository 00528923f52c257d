//! CSV batch mode.
//!
//! Reads a file with `Category` and `Comment` columns, runs the first few
//! comments of each chosen category through the pipeline and writes one row
//! per processed comment to `processed_comments_<timestamp>.csv`.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use advocate_pipeline::Orchestrator;
use advocate_types::TurnResult;

#[derive(Debug, Clone, Deserialize)]
pub struct CommentRow {
    #[serde(rename = "Category")]
    pub category: String,
    #[serde(rename = "Comment")]
    pub comment: String,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    timestamp: String,
    category: String,
    original_comment: String,
    reply: String,
    explanation: String,
    input_type: String,
    halted: bool,
    halt_reason: String,
}

pub struct BatchOptions {
    pub input: PathBuf,
    /// 1-based positions in the category listing.
    pub categories: Vec<usize>,
    pub per_category: usize,
    pub output_dir: PathBuf,
}

pub fn read_comments(path: &Path) -> anyhow::Result<Vec<CommentRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, result) in reader.deserialize().enumerate() {
        let row: CommentRow = result.with_context(|| format!("Failed to read row {}", idx + 1))?;
        if !row.comment.trim().is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Distinct categories in order of first appearance.
pub fn categories(rows: &[CommentRow]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for row in rows {
        if !seen.iter().any(|c| c == &row.category) {
            seen.push(row.category.clone());
        }
    }
    seen
}

/// The first `per_category` comments of each chosen category, in the order
/// the categories were chosen.
pub fn select<'a>(
    rows: &'a [CommentRow],
    listing: &[String],
    chosen: &[usize],
    per_category: usize,
) -> anyhow::Result<Vec<&'a CommentRow>> {
    let mut picked = Vec::new();
    for &number in chosen {
        let category = number
            .checked_sub(1)
            .and_then(|i| listing.get(i))
            .ok_or_else(|| {
                anyhow::anyhow!("category {number} not in 1..={}", listing.len())
            })?;
        picked.extend(
            rows.iter()
                .filter(|r| &r.category == category)
                .take(per_category),
        );
    }
    Ok(picked)
}

pub fn output_path(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("processed_comments_{stamp}.csv"))
}

fn output_row(item: &CommentRow, result: &TurnResult) -> OutputRow {
    let timestamp = chrono::Local::now().to_rfc3339();
    match result {
        TurnResult::Completed {
            reply,
            rationale,
            input_kind,
            ..
        } => OutputRow {
            timestamp,
            category: item.category.clone(),
            original_comment: item.comment.clone(),
            reply: reply.clone(),
            explanation: rationale.clone(),
            input_type: input_kind.as_str().to_string(),
            halted: false,
            halt_reason: String::new(),
        },
        TurnResult::Halted { reason, .. } => OutputRow {
            timestamp,
            category: item.category.clone(),
            original_comment: item.comment.clone(),
            reply: String::new(),
            explanation: String::new(),
            input_type: String::new(),
            halted: true,
            halt_reason: reason.clone(),
        },
    }
}

/// Returns the path written, or `None` when no categories were chosen.
pub async fn run(orchestrator: &Orchestrator, opts: &BatchOptions) -> anyhow::Result<Option<PathBuf>> {
    let rows = read_comments(&opts.input)?;
    let listing = categories(&rows);

    println!("Available categories:");
    for (i, cat) in listing.iter().enumerate() {
        println!("{}: {}", i + 1, cat);
    }

    if opts.categories.is_empty() {
        println!("\nPick categories with --categories, e.g. --categories 5,2");
        return Ok(None);
    }

    let picked = select(&rows, &listing, &opts.categories, opts.per_category)?;
    let mut written = Vec::with_capacity(picked.len());
    let mut failures = 0usize;

    for (i, item) in picked.iter().enumerate() {
        println!("\n--- Processing comment {} ({}) ---", i + 1, item.category);
        match orchestrator.submit(&item.comment, None).await {
            Ok(result) => {
                crate::print_result(&result);
                written.push(output_row(item, &result));
            }
            Err(e) => {
                failures += 1;
                tracing::error!(comment = i + 1, category = %item.category, error = %e, "Batch comment failed");
                println!("Error processing comment {}: {}", i + 1, e.user_message());
            }
        }
    }

    std::fs::create_dir_all(&opts.output_dir)?;
    let path = output_path(&opts.output_dir);
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in &written {
        writer.serialize(row)?;
    }
    writer.flush()?;

    println!(
        "\nResults saved to: {} ({} written, {} failed)",
        path.display(),
        written.len(),
        failures
    );
    Ok(Some(path))
}
