//! Converter tests against fake transcoder executables.
//!
//! Shell-script stand-ins for ffprobe/ffmpeg exercise the process
//! handling (argument plumbing, temp-output promotion, failure cleanup,
//! timeouts) without a real transcoder install.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memories_dl::{ConvertConfig, Converter, Error};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fake_ffprobe(dir: &Path, codec: &str) -> PathBuf {
    write_script(
        dir,
        "ffprobe",
        &format!(r#"printf '{{"streams":[{{"codec_name":"{codec}"}}]}}'"#),
    )
}

/// A fake ffmpeg that copies the `-i` input to the last argument.
fn copying_ffmpeg(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        r#"src=""
prev=""
for a in "$@"; do
  [ "$prev" = "-i" ] && src="$a"
  prev="$a"
  out="$a"
done
cp "$src" "$out""#,
    )
}

fn converter(ffmpeg: PathBuf, ffprobe: PathBuf) -> Converter {
    Converter::new(ConvertConfig {
        ffmpeg,
        ffprobe,
        timeout: Duration::from_secs(5),
        ..ConvertConfig::default()
    })
}

#[tokio::test]
async fn probe_reports_stream_codec() {
    let dir = tempfile::TempDir::new().unwrap();
    let conv = converter(copying_ffmpeg(dir.path()), fake_ffprobe(dir.path(), "hevc"));
    let codec = conv.probe_video_codec(&dir.path().join("in.mov")).await.unwrap();
    assert_eq!(codec.as_deref(), Some("hevc"));
}

#[tokio::test]
async fn successful_conversion_promotes_temp_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let conv = converter(copying_ffmpeg(dir.path()), fake_ffprobe(dir.path(), "h264"));

    let src = dir.path().join("memory_1.orig.mov");
    let dst = dir.path().join("memory_1.mp4");
    std::fs::write(&src, b"fake video payload").unwrap();

    conv.convert_to_canonical(&src, &dst).await.unwrap();

    assert_eq!(std::fs::read(&dst).unwrap(), b"fake video payload");
    // The temp sibling was renamed away, and the source is untouched.
    assert!(!dir.path().join("memory_1_tmpconv.mp4").exists());
    assert!(src.exists());
}

#[tokio::test]
async fn nonzero_exit_leaves_no_output_behind() {
    let dir = tempfile::TempDir::new().unwrap();
    let ffmpeg = write_script(dir.path(), "ffmpeg", "echo 'codec mismatch' >&2\nexit 1");
    let conv = converter(ffmpeg, fake_ffprobe(dir.path(), "hevc"));

    let src = dir.path().join("in.mov");
    let dst = dir.path().join("out.mp4");
    std::fs::write(&src, b"payload").unwrap();

    let err = conv.convert_to_canonical(&src, &dst).await.unwrap_err();
    assert!(matches!(err, Error::ConversionFailed { ref detail } if detail.contains("codec mismatch")));
    assert!(!dst.exists());
    assert!(!dir.path().join("out_tmpconv.mp4").exists());
}

#[tokio::test]
async fn empty_output_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    // Exits zero but only touches the output file.
    let ffmpeg = write_script(
        dir.path(),
        "ffmpeg",
        r#"for a in "$@"; do out="$a"; done
: > "$out""#,
    );
    let conv = converter(ffmpeg, fake_ffprobe(dir.path(), "h264"));

    let src = dir.path().join("in.mp4");
    let dst = dir.path().join("out.mp4");
    std::fs::write(&src, b"payload").unwrap();

    let err = conv.convert_to_canonical(&src, &dst).await.unwrap_err();
    assert!(matches!(err, Error::ConversionFailed { ref detail } if detail.contains("no usable output")));
    assert!(!dst.exists());
}

#[tokio::test]
async fn overrunning_transcode_is_killed_and_classified() {
    let dir = tempfile::TempDir::new().unwrap();
    let ffmpeg = write_script(dir.path(), "ffmpeg", "sleep 5");
    let conv = Converter::new(ConvertConfig {
        ffmpeg,
        ffprobe: fake_ffprobe(dir.path(), "h264"),
        timeout: Duration::from_millis(200),
        ..ConvertConfig::default()
    });

    let src = dir.path().join("in.mp4");
    let dst = dir.path().join("out.mp4");
    std::fs::write(&src, b"payload").unwrap();

    let err = conv.convert_to_canonical(&src, &dst).await.unwrap_err();
    assert!(matches!(err, Error::ConversionFailed { ref detail } if detail.contains("timed out")));
    assert!(!dst.exists());
}
