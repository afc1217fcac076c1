//! CLI mode: wires the pipeline together for a single terminal run.

mod progress;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, SELECT_ENV};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::manifest::{self, MediaKind, WorkItem};
use crate::run::{Orchestrator, RunProgress};
use crate::select;
use crate::state::FailedRun;
use crate::storage::OutputTree;

pub use progress::{CliProgress, format_bytes, format_duration, make_run_bar, print_summary};

/// Options collected from the command line.
#[derive(Debug, Default)]
pub struct CliOptions {
    /// Root of the unpacked export.
    pub export_dir: Option<PathBuf>,
    /// Explicit manifest path override.
    pub manifest: Option<PathBuf>,
    /// Explicit output root override.
    pub output: Option<PathBuf>,
    /// Selection expression (`1,5-8`).
    pub select: Option<String>,
    /// Item-count limit.
    pub limit: Option<NonZeroUsize>,
    /// Use the persisted failure list as the selection.
    pub retry_failed: bool,
    /// Re-download items whose output already exists.
    pub force: bool,
    /// Concurrent fetch workers.
    pub jobs: Option<usize>,
    /// Concurrent transcoder processes.
    pub convert_jobs: Option<usize>,
    /// ffmpeg executable override.
    pub ffmpeg: Option<PathBuf>,
    /// ffprobe executable override.
    pub ffprobe: Option<PathBuf>,
}

impl CliOptions {
    fn into_config(self) -> (AppConfig, Option<String>, bool) {
        let mut config = AppConfig::default().with_env_overrides();
        if let Some(dir) = self.export_dir {
            config.paths.export_dir = dir;
        }
        config.paths.manifest_path = self.manifest;
        config.paths.output_root = self.output;
        if let Some(jobs) = self.jobs {
            config.fetch_jobs = jobs.max(1);
        }
        if let Some(jobs) = self.convert_jobs {
            config.convert_jobs = jobs.max(1);
        }
        if let Some(path) = self.ffmpeg {
            config.convert.ffmpeg = path;
        }
        if let Some(path) = self.ffprobe {
            config.convert.ffprobe = path;
        }
        config.force_overwrite = self.force;
        if self.limit.is_some() {
            config.limit = self.limit;
        }

        let selection = self
            .select
            .or_else(|| std::env::var(SELECT_ENV).ok().filter(|s| !s.trim().is_empty()));
        (config, selection, self.retry_failed)
    }
}

/// Runs the full pipeline for one invocation.
///
/// # Errors
///
/// Fatal errors (unreadable manifest, manifest format, selection range,
/// missing transcoder when videos are selected) abort before any item is
/// processed. Per-item failures are reported in the summary instead.
pub async fn run(options: CliOptions) -> Result<()> {
    let (config, select_expr, retry_failed) = options.into_config();

    let manifest_path = config.paths.manifest();
    let html = std::fs::read_to_string(&manifest_path).map_err(|e| {
        log::error!("cannot read manifest at {}", manifest_path.display());
        Error::Io(e)
    })?;
    let items = manifest::parse_manifest(&html)?;
    let total = u32::try_from(items.len()).unwrap_or(u32::MAX);

    let selection = if retry_failed {
        match FailedRun::load(&config.paths.state_dir) {
            Some(prior) => {
                if prior.manifest_items != total {
                    log::warn!(
                        "manifest now has {total} item(s), failure list was recorded against {}",
                        prior.manifest_items
                    );
                }
                let indices = usable_retry_indices(&prior, total);
                if indices.is_empty() {
                    println!("No failed items to retry.");
                    return Ok(());
                }
                println!(
                    "Retrying {} failed item(s) from {}",
                    indices.len(),
                    prior.created.format("%Y-%m-%d %H:%M UTC")
                );
                indices
            }
            None => {
                println!("No failure list found; nothing to retry.");
                return Ok(());
            }
        }
    } else {
        select::resolve_selection(select_expr.as_deref().unwrap_or(""), total)?
    };
    let selection = select::apply_limit(selection, config.limit);

    if selection.is_empty() {
        println!("No items selected.");
        return Ok(());
    }

    let converter = Converter::new(config.convert.clone());
    if has_declared_video(&items, &selection) {
        // Refuse to start video work without a working transcoder.
        converter.ensure_available().await?;
    }

    let tree = OutputTree::new(config.paths.output());
    println!(
        "Processing {} of {} item(s). Saving to {}",
        selection.len(),
        total,
        tree.root().display()
    );

    let orchestrator = Orchestrator::new(Fetcher::new(&config.fetch)?, converter, tree, &config);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received; finishing in-flight items");
            signal_cancel.cancel();
        }
    });

    let bar = make_run_bar(selection.len() as u64);
    let progress: Arc<dyn RunProgress> = Arc::new(CliProgress::new(bar.clone()));

    let summary = orchestrator
        .run(&items, &selection, &progress, cancel)
        .await?;

    bar.finish_and_clear();
    print_summary(&summary);

    if summary.failures.is_empty() {
        FailedRun::clear(&config.paths.state_dir)?;
    } else {
        FailedRun::new(total, summary.failures.clone()).save(&config.paths.state_dir)?;
    }

    Ok(())
}

/// Filters a persisted failure list down to indices the current manifest
/// can address. The file is user-editable, so 0 or past-the-end entries
/// must be dropped with a warning, not trusted.
fn usable_retry_indices(prior: &FailedRun, total: u32) -> Vec<u32> {
    let mut indices = prior.indices();
    let before = indices.len();
    indices.retain(|&i| (1..=total).contains(&i));
    if indices.len() < before {
        log::warn!(
            "ignoring {} failure-list index(es) outside 1..={total}",
            before - indices.len()
        );
    }
    indices
}

fn has_declared_video(items: &[WorkItem], selection: &[u32]) -> bool {
    selection.iter().any(|&i| {
        i.checked_sub(1)
            .and_then(|z| items.get(z as usize))
            .is_some_and(|item| item.declared_kind == MediaKind::Video)
    })
}
