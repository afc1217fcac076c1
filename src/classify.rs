//! Payload classification: is this actually the media it claims to be?
//!
//! Signed-URL endpoints sometimes serve an HTML or JSON error page with a
//! 200 status. Classification inspects the leading bytes and the reported
//! content type and returns a closed set of verdicts; anything that is not
//! recognizably image or video is routed to diagnostic capture.

use std::sync::LazyLock;

use regex::Regex;

use crate::manifest::MediaKind;

static CONTENT_DISPOSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"filename="?([^";]+)"?"#).expect("valid regex"));
// Only extensions from the known media set; a bare domain suffix such as
// `.co` or `.io` at the end of a path-less URL must not win over the
// sniffed format's default.
static URL_EXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(jpe?g|png|gif|webp|heic|heif|mp4|mov|m4v|mkv|webm)(?:\?|$)")
        .expect("valid regex")
});

/// Recognized image containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Heic,
}

impl ImageFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
            Self::Gif => ".gif",
            Self::WebP => ".webp",
            Self::Heic => ".heic",
        }
    }
}

/// Recognized video containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    /// ISO BMFF (`ftyp` with an MP4-family brand, or bare `moov`/`mdat`).
    Mp4,
    /// QuickTime (`ftyp qt  `).
    QuickTime,
    /// Matroska / WebM (EBML header).
    Matroska,
}

impl VideoFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => ".mp4",
            Self::QuickTime => ".mov",
            Self::Matroska => ".mkv",
        }
    }
}

/// Why a payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The body is HTML/XML text, typically an error page.
    HtmlBody,
    /// The body is a JSON document, typically an error envelope.
    JsonBody,
    /// No known media signature in the leading bytes.
    UnknownSignature,
    /// Sniffed bytes contradict the reported media content type.
    ContentTypeMismatch,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HtmlBody => "HTML body served as media",
            Self::JsonBody => "JSON body served as media",
            Self::UnknownSignature => "no recognizable media signature",
            Self::ContentTypeMismatch => "content type contradicts payload bytes",
        };
        f.write_str(s)
    }
}

/// Classification verdict for one downloaded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Image(ImageFormat),
    Video(VideoFormat),
    Invalid(InvalidReason),
}

impl Classification {
    #[must_use]
    pub const fn is_video(self) -> bool {
        matches!(self, Self::Video(_))
    }
}

/// Classifies a payload from its leading bytes and reported content type.
///
/// Byte sniffing wins over the header: a body that parses as HTML or JSON
/// is invalid regardless of status or content type, and a media-typed
/// header is only trusted when the magic bytes agree with it.
/// `application/octet-stream` (and a missing header) defer to sniffing.
#[must_use]
pub fn classify(bytes: &[u8], content_type: Option<&str>) -> Classification {
    if let Some(reason) = sniff_text_error(bytes) {
        return Classification::Invalid(reason);
    }

    let sniffed = match sniff_media(bytes) {
        Some(s) => s,
        None => return Classification::Invalid(InvalidReason::UnknownSignature),
    };

    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        let header_disagrees = match sniffed {
            Classification::Image(_) => ct.starts_with("video/"),
            Classification::Video(_) => ct.starts_with("image/"),
            Classification::Invalid(_) => false,
        };
        if header_disagrees {
            return Classification::Invalid(InvalidReason::ContentTypeMismatch);
        }
    }
    sniffed
}

/// Detects bodies that are recognizably text (HTML, XML, JSON) in shape.
fn sniff_text_error(bytes: &[u8]) -> Option<InvalidReason> {
    let head: Vec<u8> = bytes
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .take(32)
        .collect();
    // Strip a UTF-8 BOM if present.
    let head = head.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(&head);

    let lowered: Vec<u8> = head.iter().map(u8::to_ascii_lowercase).collect();
    if lowered.starts_with(b"<!doctype")
        || lowered.starts_with(b"<html")
        || lowered.starts_with(b"<head")
        || lowered.starts_with(b"<body")
        || lowered.starts_with(b"<?xml")
    {
        return Some(InvalidReason::HtmlBody);
    }
    if head.first() == Some(&b'{') || head.first() == Some(&b'[') {
        return Some(InvalidReason::JsonBody);
    }
    None
}

/// Matches the payload's magic markers against the known media set.
fn sniff_media(bytes: &[u8]) -> Option<Classification> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(Classification::Image(ImageFormat::Jpeg));
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some(Classification::Image(ImageFormat::Png));
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(Classification::Image(ImageFormat::Gif));
    }
    if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some(Classification::Image(ImageFormat::WebP));
    }
    if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(Classification::Video(VideoFormat::Matroska));
    }
    if &bytes[4..8] == b"ftyp" {
        let brand = &bytes[8..12];
        return Some(match brand {
            b"heic" | b"heix" | b"hevc" | b"heim" | b"mif1" | b"msf1" => {
                Classification::Image(ImageFormat::Heic)
            }
            b"qt  " => Classification::Video(VideoFormat::QuickTime),
            _ => Classification::Video(VideoFormat::Mp4),
        });
    }
    // Some QuickTime/MP4 files open directly with a top-level box.
    if matches!(&bytes[4..8], b"moov" | b"mdat" | b"wide" | b"free") {
        return Some(Classification::Video(VideoFormat::Mp4));
    }
    None
}

/// Picks the output file extension for a successfully classified payload.
///
/// Preference order follows the upstream behavior: the content-type header,
/// then a `Content-Disposition` filename, then the final URL's extension,
/// and finally the sniffed format's own default.
#[must_use]
pub fn choose_extension(
    classification: Classification,
    content_type: Option<&str>,
    content_disposition: Option<&str>,
    final_url: &str,
) -> String {
    if let Some(ext) = content_type.and_then(extension_from_content_type) {
        return ext.to_string();
    }
    if let Some(cd) = content_disposition
        && let Some(caps) = CONTENT_DISPOSITION_RE.captures(cd)
    {
        let name = &caps[1];
        if let Some(dot) = name.rfind('.')
            && dot + 1 < name.len()
        {
            return name[dot..].to_ascii_lowercase();
        }
    }
    if let Some(caps) = URL_EXT_RE.captures(final_url) {
        return format!(".{}", caps[1].to_ascii_lowercase());
    }
    match classification {
        Classification::Image(f) => f.extension().to_string(),
        Classification::Video(f) => f.extension().to_string(),
        Classification::Invalid(_) => MediaKind::Image.default_extension().to_string(),
    }
}

fn extension_from_content_type(ct: &str) -> Option<&'static str> {
    let ct = ct.to_ascii_lowercase();
    if ct.contains("image/jpeg") {
        Some(".jpg")
    } else if ct.contains("image/png") {
        Some(".png")
    } else if ct.contains("image/heic") || ct.contains("image/heif") {
        Some(".heic")
    } else if ct.contains("video/mp4") {
        Some(".mp4")
    } else if ct.contains("video/quicktime") {
        Some(".mov")
    } else {
        None
    }
}
