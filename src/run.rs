//! Run orchestration: drives selected items through fetch, classification,
//! and conversion, tracking a per-item record and an aggregate summary.
//!
//! Workers process one item end-to-end and report exclusively by message;
//! the coordinator task is the only writer of the record table, so no
//! run state is ever shared mutably across workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::classify::{self, Classification};
use crate::config::AppConfig;
use crate::convert::Converter;
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{FetchedPayload, Fetcher};
use crate::manifest::{MediaKind, WorkItem};
use crate::state::FailedItem;
use crate::storage::{FileSystem, OutputTree, TokioFileSystem};

/// Per-item lifecycle state. Transitions are monotonic within one run
/// pass; `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Downloading,
    Downloaded,
    Converting,
    Succeeded,
    Failed,
}

impl ItemStatus {
    /// Whether this status ends the item's lifecycle for the current pass.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The outcome of attempting one work item in one pass. Owned and mutated
/// by the run coordinator only.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Manifest index of the item.
    pub item_index: u32,
    /// Current lifecycle state.
    pub status: ItemStatus,
    /// Fetch attempts spent, including the initial try.
    pub attempt_count: u32,
    /// Classified kind and detail of the last failure.
    pub last_error: Option<(ErrorKind, String)>,
    /// Final output location, set on success.
    pub output_path: Option<PathBuf>,
    /// Whether the item was skipped because its output already existed.
    pub skipped: bool,
}

impl RunRecord {
    const fn new(item_index: u32) -> Self {
        Self {
            item_index,
            status: ItemStatus::Pending,
            attempt_count: 0,
            last_error: None,
            output_path: None,
            skipped: false,
        }
    }
}

/// Trait for receiving run progress updates.
///
/// All methods have default no-op implementations.
pub trait RunProgress: Send + Sync {
    /// Called when an item's download starts.
    fn on_item_start(&self, _index: u32) {}

    /// Called when an item's payload has been retrieved and validated.
    fn on_item_downloaded(&self, _index: u32, _bytes: u64, _attempts: u32) {}

    /// Called when an item enters conversion.
    fn on_item_converting(&self, _index: u32) {}

    /// Called when an item is skipped because its output already exists.
    fn on_item_skipped(&self, _index: u32, _path: &Path) {}

    /// Called when an item reaches `Succeeded`.
    fn on_item_succeeded(&self, _index: u32, _path: &Path) {}

    /// Called when an item reaches `Failed`.
    fn on_item_failed(&self, _index: u32, _kind: ErrorKind, _detail: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl RunProgress for NoProgress {}

/// Aggregate outcome of one run pass, in ascending index order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Items that entered processing (skipped items included).
    pub attempted: usize,
    /// Items that reached `Succeeded`, skipped ones included.
    pub succeeded: usize,
    /// Items skipped because their output already existed.
    pub skipped: usize,
    /// Items that reached `Failed`.
    pub failed: usize,
    /// Whether the run was cancelled before all items started.
    pub cancelled: bool,
    /// Wall-clock duration of the pass.
    pub elapsed: Duration,
    /// Failed items with their last error kind, ascending by index; this
    /// is what gets persisted for a retry pass.
    pub failures: Vec<FailedItem>,
    /// All records for the pass, ascending by index.
    pub records: Vec<RunRecord>,
}

impl RunSummary {
    /// Failure counts per error kind.
    #[must_use]
    pub fn failure_breakdown(&self) -> BTreeMap<ErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for f in &self.failures {
            *counts.entry(f.kind).or_insert(0) += 1;
        }
        counts
    }
}

/// Worker-to-coordinator messages. Workers never touch run state directly.
enum ItemEvent {
    Started(u32),
    Skipped(u32, PathBuf),
    Downloaded(u32, u64, u32),
    Converting(u32),
    Finished(u32, ItemOutcome),
}

struct ItemOutcome {
    attempts: u32,
    result: std::result::Result<PathBuf, (ErrorKind, String)>,
}

impl ItemOutcome {
    fn from_error(e: &Error) -> Self {
        Self {
            attempts: e.attempts().unwrap_or(1),
            result: Err((e.kind(), e.to_string())),
        }
    }
}

/// Drives the selected work items through the pipeline.
pub struct Orchestrator {
    fetcher: Fetcher,
    converter: Converter,
    fs: Arc<dyn FileSystem>,
    tree: OutputTree,
    fetch_jobs: usize,
    convert_slots: Arc<Semaphore>,
    force_overwrite: bool,
}

impl Orchestrator {
    /// Creates an orchestrator with the default (real) file system.
    #[must_use]
    pub fn new(fetcher: Fetcher, converter: Converter, tree: OutputTree, config: &AppConfig) -> Self {
        Self::with_fs(fetcher, converter, tree, config, Arc::new(TokioFileSystem))
    }

    /// Creates an orchestrator with a custom file system implementation.
    #[must_use]
    pub fn with_fs(
        fetcher: Fetcher,
        converter: Converter,
        tree: OutputTree,
        config: &AppConfig,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            fetcher,
            converter,
            fs,
            tree,
            fetch_jobs: config.fetch_jobs.max(1),
            convert_slots: Arc::new(Semaphore::new(config.convert_jobs.max(1))),
            force_overwrite: config.force_overwrite,
        }
    }

    /// Returns the output tree this run writes into.
    #[must_use]
    pub const fn tree(&self) -> &OutputTree {
        &self.tree
    }

    /// Processes every selected item, isolating per-item failures, and
    /// returns the aggregate summary. Cancellation stops new items from
    /// starting; in-flight items finish.
    ///
    /// # Errors
    ///
    /// Only run-level failures (output directory creation) abort; item
    /// failures are recorded and the run continues.
    pub async fn run(
        &self,
        items: &[WorkItem],
        selection: &[u32],
        progress: &Arc<dyn RunProgress>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        self.tree.ensure(self.fs.as_ref()).await?;

        // Indices are 1-based; 0 or past-the-end indices map to no item
        // and are dropped rather than panicking.
        let selected: Vec<&WorkItem> = selection
            .iter()
            .filter_map(|&i| i.checked_sub(1).and_then(|z| items.get(z as usize)))
            .collect();
        let mut records: BTreeMap<u32, RunRecord> = selected
            .iter()
            .map(|item| (item.index, RunRecord::new(item.index)))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<ItemEvent>();
        let worker_cancel = cancel.clone();
        let workers = async move {
            stream::iter(selected)
                .for_each_concurrent(self.fetch_jobs, |item| {
                    let tx = tx.clone();
                    let cancel = worker_cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            log::info!("#{}: not started, run cancelled", item.index);
                            return;
                        }
                        self.process_item(item, &tx).await;
                    }
                })
                .await;
            // Workers done; dropping the last sender ends the coordinator.
            drop(tx);
        };

        let coordinator = async {
            while let Some(event) = rx.recv().await {
                Self::apply_event(&mut records, progress.as_ref(), event);
            }
        };

        let ((), ()) = tokio::join!(workers, coordinator);

        let records: Vec<RunRecord> = records.into_values().collect();
        let mut summary = RunSummary {
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: cancel.is_cancelled(),
            elapsed: started.elapsed(),
            failures: Vec::new(),
            records: Vec::new(),
        };
        for record in &records {
            if record.status != ItemStatus::Pending {
                summary.attempted += 1;
            }
            match record.status {
                ItemStatus::Succeeded if record.skipped => {
                    summary.succeeded += 1;
                    summary.skipped += 1;
                }
                ItemStatus::Succeeded => summary.succeeded += 1,
                ItemStatus::Failed => {
                    summary.failed += 1;
                    let (kind, detail) = record
                        .last_error
                        .clone()
                        .unwrap_or((ErrorKind::Other, "unknown failure".to_string()));
                    summary.failures.push(FailedItem {
                        index: record.item_index,
                        kind,
                        detail,
                    });
                }
                _ => {}
            }
        }
        summary.records = records;
        Ok(summary)
    }

    /// Applies one worker event to the record table. This is the only
    /// place run state is mutated.
    fn apply_event(
        records: &mut BTreeMap<u32, RunRecord>,
        progress: &dyn RunProgress,
        event: ItemEvent,
    ) {
        match event {
            ItemEvent::Started(index) => {
                if let Some(rec) = records.get_mut(&index) {
                    rec.status = ItemStatus::Downloading;
                }
                progress.on_item_start(index);
            }
            ItemEvent::Skipped(index, path) => {
                if let Some(rec) = records.get_mut(&index) {
                    rec.status = ItemStatus::Succeeded;
                    rec.skipped = true;
                    rec.output_path = Some(path.clone());
                }
                progress.on_item_skipped(index, &path);
            }
            ItemEvent::Downloaded(index, bytes, attempts) => {
                if let Some(rec) = records.get_mut(&index) {
                    rec.status = ItemStatus::Downloaded;
                    rec.attempt_count = attempts;
                }
                progress.on_item_downloaded(index, bytes, attempts);
            }
            ItemEvent::Converting(index) => {
                if let Some(rec) = records.get_mut(&index) {
                    rec.status = ItemStatus::Converting;
                }
                progress.on_item_converting(index);
            }
            ItemEvent::Finished(index, outcome) => {
                let Some(rec) = records.get_mut(&index) else {
                    return;
                };
                if rec.attempt_count == 0 {
                    rec.attempt_count = outcome.attempts;
                }
                match outcome.result {
                    Ok(path) => {
                        rec.status = ItemStatus::Succeeded;
                        rec.output_path = Some(path.clone());
                        progress.on_item_succeeded(index, &path);
                    }
                    Err((kind, detail)) => {
                        rec.status = ItemStatus::Failed;
                        progress.on_item_failed(index, kind, &detail);
                        rec.last_error = Some((kind, detail));
                    }
                }
            }
        }
    }

    /// One item, end to end. Reports by message only; never touches shared
    /// state.
    async fn process_item(&self, item: &WorkItem, tx: &mpsc::UnboundedSender<ItemEvent>) {
        let index = item.index;
        let _ = tx.send(ItemEvent::Started(index));

        // Idempotent reruns: an existing, non-empty final output means the
        // item is already complete.
        if !self.force_overwrite
            && let Some(existing) = self.existing_output(item).await
        {
            log::info!("#{index}: output already exists, skipping");
            let _ = tx.send(ItemEvent::Skipped(index, existing));
            return;
        }

        let payload = match self.fetcher.fetch(&item.url).await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("#{index}: {e}");
                let _ = tx.send(ItemEvent::Finished(index, ItemOutcome::from_error(&e)));
                return;
            }
        };
        let attempts = payload.attempts;

        let classification = classify::classify(&payload.bytes, payload.content_type.as_deref());
        let classification = match classification {
            Classification::Invalid(reason) => {
                match self
                    .tree
                    .capture_diagnostic(self.fs.as_ref(), index, &payload, reason)
                    .await
                {
                    Ok(sample) => log::error!(
                        "#{index}: {reason}; sample saved to {}",
                        sample.display()
                    ),
                    Err(e) => {
                        log::error!("#{index}: {reason}; diagnostic capture failed: {e}");
                    }
                }
                let outcome = ItemOutcome {
                    attempts,
                    result: Err((ErrorKind::InvalidPayload, reason.to_string())),
                };
                let _ = tx.send(ItemEvent::Finished(index, outcome));
                return;
            }
            valid => valid,
        };
        if classification.is_video() != (item.declared_kind == MediaKind::Video) {
            log::warn!(
                "#{index}: manifest declares {:?} but payload sniffed as {classification:?}",
                item.declared_kind
            );
        }

        let _ = tx.send(ItemEvent::Downloaded(
            index,
            payload.bytes.len() as u64,
            attempts,
        ));

        let ext = classify::choose_extension(
            classification,
            payload.content_type.as_deref(),
            payload.content_disposition.as_deref(),
            &payload.final_url,
        );

        let outcome = match classification {
            Classification::Image(_) => self.store_image(index, &ext, &payload, attempts).await,
            Classification::Video(_) => {
                self.store_and_convert_video(index, &ext, &payload, attempts, tx)
                    .await
            }
            Classification::Invalid(_) => return, // handled above
        };
        let _ = tx.send(ItemEvent::Finished(index, outcome));
    }

    /// Existing-output check used for idempotent reruns. Videos are judged
    /// by their canonical name; images by any known extension.
    async fn existing_output(&self, item: &WorkItem) -> Option<PathBuf> {
        match item.declared_kind {
            MediaKind::Video => {
                let path = self.tree.video_final_path(item.index);
                match self.fs.file_size(&path).await {
                    Some(len) if len > 0 => Some(path),
                    _ => None,
                }
            }
            MediaKind::Image => {
                self.tree
                    .existing_image_output(self.fs.as_ref(), item.index)
                    .await
            }
        }
    }

    async fn store_image(
        &self,
        index: u32,
        ext: &str,
        payload: &FetchedPayload,
        attempts: u32,
    ) -> ItemOutcome {
        let dest = self.tree.image_path(index, ext);
        let result = match self
            .tree
            .write_media(self.fs.as_ref(), &dest, &payload.bytes)
            .await
        {
            Ok(()) => Ok(dest),
            Err(e) => Err((ErrorKind::Io, e.to_string())),
        };
        ItemOutcome { attempts, result }
    }

    async fn store_and_convert_video(
        &self,
        index: u32,
        ext: &str,
        payload: &FetchedPayload,
        attempts: u32,
        tx: &mpsc::UnboundedSender<ItemEvent>,
    ) -> ItemOutcome {
        let raw = self.tree.video_raw_path(index, ext);
        let dest = self.tree.video_final_path(index);

        if let Err(e) = self
            .tree
            .write_media(self.fs.as_ref(), &raw, &payload.bytes)
            .await
        {
            return ItemOutcome {
                attempts,
                result: Err((ErrorKind::Io, e.to_string())),
            };
        }

        // External-process count stays bounded below the fetch ceiling.
        let Ok(_permit) = self.convert_slots.acquire().await else {
            // The semaphore is never closed while the orchestrator lives.
            let _ = self.fs.remove_file(&raw).await;
            return ItemOutcome {
                attempts,
                result: Err((ErrorKind::Cancelled, "converter unavailable".to_string())),
            };
        };
        let _ = tx.send(ItemEvent::Converting(index));

        let result = match self.converter.convert_to_canonical(&raw, &dest).await {
            Ok(()) => {
                let _ = self.fs.remove_file(&raw).await;
                Ok(dest)
            }
            Err(e) => {
                // Neither the raw source nor any partial output may stay
                // behind in the output tree.
                let _ = self.fs.remove_file(&raw).await;
                Err((e.kind(), e.to_string()))
            }
        };
        ItemOutcome { attempts, result }
    }
}
