//! Output layout and filesystem seam.
//!
//! Successful images and videos land under separate subtrees; diagnostic
//! captures for invalid payloads go to a `debug/` subtree keyed by item
//! index. Media writes use `.part` + rename so a crash or cancellation
//! never leaves a torn file under a final name, and per-index filenames
//! mean concurrent writers cannot collide.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::InvalidReason;
use crate::fetch::FetchedPayload;

/// How much of an invalid payload is kept for manual inspection.
const DIAGNOSTIC_BODY_LIMIT: usize = 128 * 1024;

/// Abstraction over file system operations for testability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns the size of a file if it exists.
    async fn file_size(&self, path: &Path) -> Option<u64>;

    /// Creates all directories in the given path.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Writes a whole buffer to a file, creating or truncating it.
    async fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()>;

    /// Renames a file.
    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()>;

    /// Removes a file.
    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

/// Default file system implementation using `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_size(&self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(path, bytes).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// Returns the `.part` file path for a given final path.
fn part_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

/// Metadata sidecar written next to a diagnostic body capture.
#[derive(Debug, Serialize)]
pub struct DiagnosticRecord {
    /// Manifest index of the failed item.
    pub index: u32,
    /// HTTP status the payload arrived with.
    pub status: u16,
    /// Reported content type, if any.
    pub content_type: Option<String>,
    /// URL the payload was actually served from.
    pub final_url: String,
    /// Classification verdict.
    pub reason: String,
    /// When the capture was written.
    pub captured: DateTime<Utc>,
}

/// The three output subtrees rooted at the run's output directory.
#[derive(Debug, Clone)]
pub struct OutputTree {
    root: PathBuf,
}

impl OutputTree {
    /// Creates an output tree rooted at `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Image output subtree.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Video output subtree.
    #[must_use]
    pub fn videos(&self) -> PathBuf {
        self.root.join("videos")
    }

    /// Diagnostic capture subtree (outside the normal output tree).
    #[must_use]
    pub fn debug(&self) -> PathBuf {
        self.root.join("debug")
    }

    /// Creates the media subtrees. `debug/` is created lazily on first
    /// capture.
    ///
    /// # Errors
    ///
    /// Propagates directory-creation failures.
    pub async fn ensure(&self, fs: &dyn FileSystem) -> std::io::Result<()> {
        fs.create_dir_all(&self.images()).await?;
        fs.create_dir_all(&self.videos()).await?;
        Ok(())
    }

    /// Final path for an image item.
    #[must_use]
    pub fn image_path(&self, index: u32, ext: &str) -> PathBuf {
        self.images().join(format!("memory_{index}{ext}"))
    }

    /// Path the raw (pre-conversion) video payload is staged at. Distinct
    /// from the canonical name so conversion never reads and writes the
    /// same file.
    #[must_use]
    pub fn video_raw_path(&self, index: u32, ext: &str) -> PathBuf {
        self.videos().join(format!("memory_{index}.orig{ext}"))
    }

    /// Canonical output path for a video item.
    #[must_use]
    pub fn video_final_path(&self, index: u32) -> PathBuf {
        self.videos().join(format!("memory_{index}.mp4"))
    }

    /// Looks for an existing image output for `index` across the known
    /// extensions; used for idempotent reruns.
    pub async fn existing_image_output(&self, fs: &dyn FileSystem, index: u32) -> Option<PathBuf> {
        for ext in [".jpg", ".jpeg", ".png", ".heic", ".gif", ".webp"] {
            let candidate = self.image_path(index, ext);
            if matches!(fs.file_size(&candidate).await, Some(len) if len > 0) {
                return Some(candidate);
            }
        }
        None
    }

    /// Writes media bytes atomically: `.part` first, rename on success,
    /// `.part` removed on failure.
    ///
    /// # Errors
    ///
    /// Propagates write and rename failures.
    pub async fn write_media(
        &self,
        fs: &dyn FileSystem,
        path: &Path,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        let pp = part_path(path);
        if let Err(e) = fs.write(&pp, bytes).await {
            let _ = fs.remove_file(&pp).await;
            return Err(e);
        }
        match fs.rename(&pp, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs.remove_file(&pp).await;
                Err(e)
            }
        }
    }

    /// Captures an invalid payload for manual inspection: the body head as
    /// `debug/response_<index>.html` plus a TOML metadata sidecar.
    ///
    /// # Errors
    ///
    /// Propagates directory-creation and write failures.
    pub async fn capture_diagnostic(
        &self,
        fs: &dyn FileSystem,
        index: u32,
        payload: &FetchedPayload,
        reason: InvalidReason,
    ) -> std::io::Result<PathBuf> {
        let debug_dir = self.debug();
        fs.create_dir_all(&debug_dir).await?;

        let body_path = debug_dir.join(format!("response_{index}.html"));
        let head = &payload.bytes[..payload.bytes.len().min(DIAGNOSTIC_BODY_LIMIT)];
        fs.write(&body_path, head).await?;

        let record = DiagnosticRecord {
            index,
            status: payload.status,
            content_type: payload.content_type.clone(),
            final_url: payload.final_url.clone(),
            reason: reason.to_string(),
            captured: Utc::now(),
        };
        let meta = toml::to_string_pretty(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs.write(&debug_dir.join(format!("response_{index}.toml")), meta.as_bytes())
            .await?;

        Ok(body_path)
    }
}
