//! Progress bar and run-end reporting for the CLI.

use std::path::Path;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::ErrorKind;
use crate::run::{RunProgress, RunSummary};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates the overall run progress bar (one tick per terminal item).
#[must_use]
pub fn make_run_bar(total_items: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_items);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} items {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar
}

/// Progress reporter that drives an indicatif bar and prints per-item
/// outcome lines above it.
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    /// Creates a reporter over the given bar.
    #[must_use]
    pub const fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }

    /// Finishes and clears the bar.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }
}

impl RunProgress for CliProgress {
    fn on_item_start(&self, index: u32) {
        self.bar.set_message(format!("#{index}"));
    }

    fn on_item_downloaded(&self, index: u32, bytes: u64, attempts: u32) {
        if attempts > 1 {
            let _ = self.bar.println(format!(
                "  #{index}: {} after {attempts} attempts",
                format_bytes(bytes)
            ));
        }
    }

    fn on_item_skipped(&self, index: u32, path: &Path) {
        let _ = self.bar.println(format!(
            "{} #{index} -> {} (already exists)",
            style("[SKIP]").dim(),
            Self::file_name(path)
        ));
        self.bar.inc(1);
    }

    fn on_item_succeeded(&self, index: u32, path: &Path) {
        let _ = self.bar.println(format!(
            "{} #{index} -> {}",
            style("[OK]").green(),
            Self::file_name(path)
        ));
        self.bar.inc(1);
    }

    fn on_item_failed(&self, index: u32, kind: ErrorKind, detail: &str) {
        let _ = self.bar.println(format!(
            "{} #{index} ({kind}): {detail}",
            style("[FAIL]").red()
        ));
        self.bar.inc(1);
    }
}

/// Prints the run-end summary with the failure-kind breakdown.
pub fn print_summary(summary: &RunSummary) {
    println!("\n{SEPARATOR}");
    if summary.cancelled {
        println!("Run stopped early.");
    }
    println!(
        "  {} item(s) attempted in {}",
        summary.attempted,
        format_duration(summary.elapsed)
    );
    println!("  {} succeeded", summary.succeeded);
    if summary.skipped > 0 {
        println!("  {} skipped (already downloaded)", summary.skipped);
    }
    if summary.failed > 0 {
        println!("  {} failed:", summary.failed);
        for (kind, count) in summary.failure_breakdown() {
            println!("    {count} x {kind}");
        }
        let indices: Vec<String> = summary
            .failures
            .iter()
            .map(|f| f.index.to_string())
            .collect();
        println!("  failed indices: {}", indices.join(","));
        println!("  re-run with --retry-failed to retry them");
    }
    println!("{SEPARATOR}");
}

/// Formats a byte count as a human-readable string (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats a duration as a human-readable string (e.g. "5.0s", "1m 05s").
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!(
            "{}h {:02}m {:02}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    }
}
