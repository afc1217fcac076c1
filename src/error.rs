//! Error types for the memories-dl library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while parsing, fetching, or converting items.
#[derive(Error, Debug)]
pub enum Error {
    /// The export document is missing the expected structural markers.
    #[error("manifest format error: {0}")]
    ManifestFormat(String),

    /// A selection expression token is malformed or out of range.
    #[error("invalid selection token: {token}")]
    SelectionRange {
        /// The offending token, verbatim.
        token: String,
    },

    /// The signed URL was rejected outright (expired signature or forbidden).
    #[error("link expired or forbidden (HTTP {status})")]
    LinkExpiredOrForbidden {
        /// HTTP status the server answered with.
        status: u16,
        /// Attempts made, including any spent on an intermediate-page URL.
        /// The rejection itself is never retried.
        attempts: u32,
    },

    /// A transient HTTP failure that persisted through the retry ceiling.
    #[error("transient HTTP failure after {attempts} attempt(s): {detail}")]
    TransientHttp {
        /// Description of the last failure.
        detail: String,
        /// Total attempts made, including the initial try.
        attempts: u32,
    },

    /// The downloaded bytes are not valid media for any known format.
    #[error("payload is not valid media: {reason}")]
    InvalidPayload {
        /// Why classification rejected the payload.
        reason: String,
    },

    /// The external transcoder failed or produced unusable output.
    #[error("conversion failed: {detail}")]
    ConversionFailed {
        /// Exit status, stderr tail, or other failure detail.
        detail: String,
    },

    /// ffmpeg or ffprobe could not be found or invoked.
    #[error("external transcoder tool not found: {tool}")]
    TranscoderMissing {
        /// Name of the missing tool.
        tool: String,
    },

    /// HTTP client error outside the retry classification.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before this item started.
    #[error("run cancelled")]
    Cancelled,
}

/// Closed classification of per-item failures, used in run records and the
/// persisted failure list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    LinkExpiredOrForbidden,
    TransientHttp,
    InvalidPayload,
    ConversionFailed,
    Io,
    Cancelled,
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LinkExpiredOrForbidden => "link expired/forbidden",
            Self::TransientHttp => "transient HTTP",
            Self::InvalidPayload => "invalid payload",
            Self::ConversionFailed => "conversion failed",
            Self::Io => "I/O",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Maps this error onto the closed per-item [`ErrorKind`] set.
    ///
    /// Fatal, run-level errors (`ManifestFormat`, `SelectionRange`) never
    /// appear in run records and map to [`ErrorKind::Other`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::LinkExpiredOrForbidden { .. } => ErrorKind::LinkExpiredOrForbidden,
            Self::TransientHttp { .. } | Self::Http(_) => ErrorKind::TransientHttp,
            Self::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            Self::ConversionFailed { .. } | Self::TranscoderMissing { .. } => {
                ErrorKind::ConversionFailed
            }
            Self::Io(_) => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ManifestFormat(_) | Self::SelectionRange { .. } => ErrorKind::Other,
        }
    }

    /// Number of fetch attempts recorded in this error, if any.
    #[must_use]
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::LinkExpiredOrForbidden { attempts, .. }
            | Self::TransientHttp { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// A specialized `Result` type for memories-dl operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_kinds() {
        let e = Error::LinkExpiredOrForbidden {
            status: 403,
            attempts: 1,
        };
        assert_eq!(e.kind(), ErrorKind::LinkExpiredOrForbidden);
        assert_eq!(e.attempts(), Some(1));

        let e = Error::TransientHttp {
            detail: "HTTP 503".into(),
            attempts: 4,
        };
        assert_eq!(e.kind(), ErrorKind::TransientHttp);
        assert_eq!(e.attempts(), Some(4));

        let e = Error::InvalidPayload {
            reason: "HTML body".into(),
        };
        assert_eq!(e.kind(), ErrorKind::InvalidPayload);
        assert_eq!(e.attempts(), None);
    }

    #[test]
    fn fatal_kinds_map_to_other() {
        assert_eq!(Error::ManifestFormat("x".into()).kind(), ErrorKind::Other);
        assert_eq!(
            Error::SelectionRange { token: "9-1".into() }.kind(),
            ErrorKind::Other
        );
    }

    #[test]
    fn kind_round_trips_through_toml() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            kind: ErrorKind,
        }
        let s = toml::to_string(&Wrapper {
            kind: ErrorKind::ConversionFailed,
        })
        .unwrap();
        let back: Wrapper = toml::from_str(&s).unwrap();
        assert_eq!(back.kind, ErrorKind::ConversionFailed);
    }
}
