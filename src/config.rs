//! Configuration types for the retrieval-and-conversion pipeline.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::convert::ConvertConfig;
use crate::fetch::RetryPolicy;

/// Environment variable that caps how many selected items are processed.
pub const LIMIT_ENV: &str = "MEMORIES_DL_LIMIT";
/// Environment variable carrying a selection expression.
pub const SELECT_ENV: &str = "MEMORIES_DL_SELECT";

/// HTTP retrieval configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Wall-clock timeout per HTTP attempt.
    pub timeout: Duration,
    /// Retry/backoff policy for transient failures.
    pub retry: RetryPolicy,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// `Accept` sent with every request.
    pub accept: String,
    /// Optional `Referer`; some signed-URL endpoints require it.
    pub referer: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                         AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            accept: "image/*,video/*;q=0.9,*/*;q=0.5".to_string(),
            referer: Some("https://app.snapchat.com/".to_string()),
        }
    }
}

impl FetchConfig {
    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Where the manifest lives and where output goes.
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Root of the unpacked export (the folder containing `html/`).
    pub export_dir: PathBuf,
    /// Explicit manifest path; defaults to
    /// `<export_dir>/html/memories_history.html`.
    pub manifest_path: Option<PathBuf>,
    /// Explicit output root; defaults to `<export_dir>/memories`.
    pub output_root: Option<PathBuf>,
    /// Directory the failure list is persisted under.
    pub state_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            export_dir: PathBuf::from("."),
            manifest_path: None,
            output_root: None,
            state_dir: data_dir.join("memories-dl"),
        }
    }
}

impl PathConfig {
    /// Resolved manifest document path.
    #[must_use]
    pub fn manifest(&self) -> PathBuf {
        self.manifest_path.clone().unwrap_or_else(|| {
            self.export_dir.join("html").join("memories_history.html")
        })
    }

    /// Resolved output root for the images/videos/debug subtrees.
    #[must_use]
    pub fn output(&self) -> PathBuf {
        self.output_root
            .clone()
            .unwrap_or_else(|| self.export_dir.join("memories"))
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP retrieval settings.
    pub fetch: FetchConfig,
    /// Transcoder settings.
    pub convert: ConvertConfig,
    /// Manifest and output locations.
    pub paths: PathConfig,
    /// Concurrent fetch workers.
    pub fetch_jobs: usize,
    /// Concurrent transcoder processes (capped below `fetch_jobs` by
    /// default since each one spawns an external process).
    pub convert_jobs: usize,
    /// Re-download items whose output already exists.
    pub force_overwrite: bool,
    /// Optional ceiling on how many selected items are processed.
    pub limit: Option<NonZeroUsize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            convert: ConvertConfig::default(),
            paths: PathConfig::default(),
            fetch_jobs: 4,
            convert_jobs: 2,
            force_overwrite: false,
            limit: None,
        }
    }
}

impl AppConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of concurrent fetch workers.
    #[must_use]
    pub const fn with_fetch_jobs(mut self, jobs: usize) -> Self {
        self.fetch_jobs = jobs;
        self
    }

    /// Sets the number of concurrent transcoder processes.
    #[must_use]
    pub const fn with_convert_jobs(mut self, jobs: usize) -> Self {
        self.convert_jobs = jobs;
        self
    }

    /// Sets whether existing outputs are re-downloaded.
    #[must_use]
    pub const fn with_force_overwrite(mut self, force: bool) -> Self {
        self.force_overwrite = force;
        self
    }

    /// Sets the item-count limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.limit = limit;
        self
    }

    /// Applies environment overrides (`MEMORIES_DL_LIMIT`). A value that
    /// does not parse as a positive integer is ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(LIMIT_ENV) {
            match raw.trim().parse::<NonZeroUsize>() {
                Ok(limit) => self.limit = Some(limit),
                Err(_) => log::warn!("ignoring unparsable {LIMIT_ENV}={raw:?}"),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::default();
        assert_eq!(config.fetch_jobs, 4);
        assert_eq!(config.convert_jobs, 2);
        assert!(!config.force_overwrite);
        assert!(config.limit.is_none());
        assert_eq!(config.fetch.retry.max_retries, 3);
    }

    #[test]
    fn builder_pattern() {
        let config = AppConfig::new()
            .with_fetch_jobs(8)
            .with_convert_jobs(1)
            .with_force_overwrite(true)
            .with_limit(NonZeroUsize::new(5));
        assert_eq!(config.fetch_jobs, 8);
        assert_eq!(config.convert_jobs, 1);
        assert!(config.force_overwrite);
        assert_eq!(config.limit.map(NonZeroUsize::get), Some(5));
    }

    #[test]
    fn manifest_and_output_defaults_derive_from_export_dir() {
        let paths = PathConfig {
            export_dir: PathBuf::from("/tmp/mydata"),
            ..PathConfig::default()
        };
        assert_eq!(
            paths.manifest(),
            PathBuf::from("/tmp/mydata/html/memories_history.html")
        );
        assert_eq!(paths.output(), PathBuf::from("/tmp/mydata/memories"));
    }

    #[test]
    fn explicit_paths_win() {
        let paths = PathConfig {
            export_dir: PathBuf::from("/tmp/mydata"),
            manifest_path: Some(PathBuf::from("/elsewhere/manifest.html")),
            output_root: Some(PathBuf::from("/out")),
            ..PathConfig::default()
        };
        assert_eq!(paths.manifest(), PathBuf::from("/elsewhere/manifest.html"));
        assert_eq!(paths.output(), PathBuf::from("/out"));
    }
}
