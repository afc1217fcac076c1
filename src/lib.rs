//! memories-dl - bulk retrieval of media from a memories export.
//!
//! The library parses an exported manifest document into addressable work
//! items, downloads each item's signed URL with transient-failure retry,
//! validates that the bytes really are media, and normalizes every video
//! to H.264 MP4 through an external transcoder. Images and videos land in
//! separate output subtrees; invalid payloads are captured for inspection
//! and failed indices are persisted for a later retry pass.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use memories_dl::{
//!     AppConfig, Converter, Fetcher, NoProgress, Orchestrator, OutputTree, RunProgress,
//! };
//!
//! # async fn example() -> memories_dl::Result<()> {
//! let config = AppConfig::default();
//! let html = std::fs::read_to_string(config.paths.manifest())?;
//! let items = memories_dl::parse_manifest(&html)?;
//!
//! let selection = memories_dl::resolve_selection("1-10", items.len() as u32)?;
//!
//! let orchestrator = Orchestrator::new(
//!     Fetcher::new(&config.fetch)?,
//!     Converter::new(config.convert.clone()),
//!     OutputTree::new(config.paths.output()),
//!     &config,
//! );
//! let progress: Arc<dyn RunProgress> = Arc::new(NoProgress);
//! let summary = orchestrator
//!     .run(&items, &selection, &progress, CancellationToken::new())
//!     .await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod classify;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod run;
pub mod select;
pub mod state;
pub mod storage;

// Re-export main types for convenience
pub use classify::{Classification, ImageFormat, InvalidReason, VideoFormat, classify};
pub use config::{AppConfig, FetchConfig, PathConfig};
pub use convert::{ConvertConfig, Converter};
pub use error::{Error, ErrorKind, Result};
pub use fetch::{FetchedPayload, Fetcher, RetryPolicy};
pub use manifest::{MediaKind, WorkItem, parse_manifest};
pub use run::{ItemStatus, NoProgress, Orchestrator, RunProgress, RunRecord, RunSummary};
pub use select::{apply_limit, resolve_selection};
pub use state::{FailedItem, FailedRun};
pub use storage::{FileSystem, OutputTree, TokioFileSystem};
