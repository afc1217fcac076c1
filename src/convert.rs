//! Normalizing video payloads to a single canonical codec/container.
//!
//! The canonical output is H.264 in MP4 with `+faststart`, audio preserved.
//! Sources already carrying H.264 are fast-pathed through a stream-copy
//! remux; everything else is re-encoded. The transcoder is an external
//! process, modeled as a bounded, timeout-guarded operation that either
//! yields a verified output file or a classified failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Error, Result};

/// External transcoder configuration. The command-line surface of the
/// tools is configuration, not core logic.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// `ffmpeg` executable (name or path).
    pub ffmpeg: PathBuf,
    /// `ffprobe` executable (name or path).
    pub ffprobe: PathBuf,
    /// Wall-clock ceiling per external-process invocation.
    pub timeout: Duration,
    /// x264 preset for the re-encode path.
    pub preset: String,
    /// x264 constant rate factor for the re-encode path.
    pub crf: u8,
    /// AAC bitrate for the re-encode path.
    pub audio_bitrate: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout: Duration::from_secs(600),
            preset: "veryfast".to_string(),
            crf: 22,
            audio_bitrate: "160k".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    streams: Option<Vec<ProbeStream>>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_name: Option<String>,
}

/// Invokes the external transcoder to produce canonical H.264 MP4 output.
pub struct Converter {
    config: ConvertConfig,
}

impl Converter {
    /// Creates a converter with the given tool configuration.
    #[must_use]
    pub const fn new(config: ConvertConfig) -> Self {
        Self { config }
    }

    /// Returns the converter configuration.
    #[must_use]
    pub const fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Checks that both tools are invocable (`-version` exits zero).
    ///
    /// # Errors
    ///
    /// [`Error::TranscoderMissing`] naming the first tool that fails.
    pub async fn ensure_available(&self) -> Result<()> {
        for (tool, path) in [("ffmpeg", &self.config.ffmpeg), ("ffprobe", &self.config.ffprobe)] {
            let ran = Command::new(path)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match ran {
                Ok(status) if status.success() => {}
                _ => {
                    return Err(Error::TranscoderMissing {
                        tool: tool.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Probes the first video stream's codec name.
    ///
    /// # Errors
    ///
    /// [`Error::TranscoderMissing`] when ffprobe is absent,
    /// [`Error::ConversionFailed`] when the probe itself fails.
    pub async fn probe_video_codec(&self, input: &Path) -> Result<Option<String>> {
        let output = self
            .run_bounded(
                Command::new(&self.config.ffprobe)
                    .args([
                        "-v",
                        "error",
                        "-select_streams",
                        "v:0",
                        "-show_entries",
                        "stream=codec_name",
                        "-print_format",
                        "json",
                    ])
                    .arg(input),
                "ffprobe",
            )
            .await?;

        if !output.status.success() {
            return Err(Error::ConversionFailed {
                detail: format!(
                    "ffprobe exited with {:?}: {}",
                    output.status.code(),
                    stderr_tail(&output.stderr)
                ),
            });
        }

        let parsed: ProbeOutput =
            serde_json::from_slice(&output.stdout).map_err(|e| Error::ConversionFailed {
                detail: format!("unreadable ffprobe output: {e}"),
            })?;
        Ok(parsed
            .streams
            .and_then(|s| s.into_iter().next())
            .and_then(|s| s.codec_name))
    }

    /// Converts `src` into canonical form at `dst`.
    ///
    /// Output is written to a temporary sibling and only renamed into place
    /// after the process exits zero and the file is non-empty; a failed run
    /// leaves no artifact behind. `src` is untouched; callers decide when
    /// to remove it.
    ///
    /// # Errors
    ///
    /// [`Error::ConversionFailed`] on non-zero exit, empty output, or
    /// timeout; [`Error::TranscoderMissing`] when ffmpeg is absent.
    pub async fn convert_to_canonical(&self, src: &Path, dst: &Path) -> Result<()> {
        let tmp = tmp_output_path(dst);
        if tokio::fs::metadata(&tmp).await.is_ok() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }

        let copy_streams = matches!(
            self.probe_video_codec(src).await?.as_deref(),
            Some("h264" | "avc1")
        );

        let mut cmd = Command::new(&self.config.ffmpeg);
        cmd.args(["-nostdin", "-y", "-i"]).arg(src);
        if copy_streams {
            log::info!("{}: already H.264, remuxing", src.display());
            cmd.args(["-c", "copy"]);
        } else {
            cmd.args(["-c:v", "libx264", "-preset", &self.config.preset])
                .args(["-crf", &self.config.crf.to_string()])
                .args(["-c:a", "aac", "-b:a", &self.config.audio_bitrate]);
        }
        cmd.args(["-movflags", "+faststart"]).arg(&tmp);

        let result = self.run_bounded(&mut cmd, "ffmpeg").await;
        let output = match result {
            Ok(o) => o,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::ConversionFailed {
                detail: format!(
                    "ffmpeg exited with {:?}: {}",
                    output.status.code(),
                    stderr_tail(&output.stderr)
                ),
            });
        }

        let produced = tokio::fs::metadata(&tmp).await.map(|m| m.len());
        if !matches!(produced, Ok(len) if len > 0) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::ConversionFailed {
                detail: "transcoder produced no usable output".to_string(),
            });
        }

        tokio::fs::rename(&tmp, dst).await?;
        Ok(())
    }

    /// Runs a tool with the configured wall-clock ceiling. The child is
    /// killed when the ceiling expires.
    async fn run_bounded(
        &self,
        cmd: &mut Command,
        tool: &str,
    ) -> Result<std::process::Output> {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let fut = cmd.output();
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::TranscoderMissing {
                    tool: tool.to_string(),
                })
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::ConversionFailed {
                detail: format!("{tool} timed out after {:?}", self.config.timeout),
            }),
        }
    }
}

/// Temporary output sibling, distinct from both the source and the final
/// name so ffmpeg never reads and writes the same file.
fn tmp_output_path(dst: &Path) -> PathBuf {
    let stem = dst
        .file_stem()
        .map_or_else(|| "output".to_string(), |s| s.to_string_lossy().into_owned());
    dst.with_file_name(format!("{stem}_tmpconv.mp4"))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    match trimmed.rfind('\n') {
        Some(pos) if trimmed.len() > 200 => trimmed[pos + 1..].to_string(),
        _ => trimmed.chars().take(200).collect(),
    }
}
