//! Parsing the exported memories document into addressable work items.
//!
//! The export is an HTML table: one `<tr>` per memory, with the capture
//! timestamp in the first cell, the media kind in the second, and a
//! `download` anchor whose `href` embeds the signed storage URL inside a
//! single-quoted JavaScript string literal.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};

use crate::error::{Error, Result};

static HREF_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(https://[^']+)'").expect("valid regex"));

/// Media kind as declared by the manifest row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Default output extension when neither headers nor the URL say better.
    #[must_use]
    pub const fn default_extension(self) -> &'static str {
        match self {
            Self::Image => ".jpg",
            Self::Video => ".mp4",
        }
    }
}

/// One manifest entry: a signed URL plus the metadata the export declares
/// for it. The 1-based `index` is the item's sole cross-run identity.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// 1-based position in the manifest (first entry = 1).
    pub index: u32,
    /// Signed, time-limited download URL.
    pub url: String,
    /// Media kind declared by the manifest row.
    pub declared_kind: MediaKind,
    /// Original capture timestamp, when the row carries one.
    pub captured_at: Option<DateTime<Utc>>,
}

/// Parses the export document into an ordered sequence of work items.
///
/// Document order determines index assignment. Rows without a `download`
/// anchor, or whose anchor carries no extractable URL, are skipped without
/// disturbing the indices of the rows that follow.
///
/// # Errors
///
/// Returns [`Error::ManifestFormat`] when the document contains no table
/// rows at all. A document with rows but zero download links yields an
/// empty list, which is not an error.
pub fn parse_manifest(html: &str) -> Result<Vec<WorkItem>> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse("tr").expect("tr selector");
    let anchor_sel = Selector::parse("a[href]").expect("anchor selector");
    let cell_sel = Selector::parse("td").expect("td selector");

    let rows: Vec<_> = document.select(&row_sel).collect();
    if rows.is_empty() {
        return Err(Error::ManifestFormat(
            "no table rows found in export document".into(),
        ));
    }

    let mut items = Vec::new();
    for row in rows {
        let Some(anchor) = row.select(&anchor_sel).find(|a| {
            a.text()
                .collect::<String>()
                .trim()
                .eq_ignore_ascii_case("download")
        }) else {
            continue;
        };
        let href = anchor.value().attr("href").unwrap_or_default();
        let Some(caps) = HREF_URL_RE.captures(href) else {
            log::warn!("manifest row has a download anchor without a signed URL, skipping");
            continue;
        };

        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();
        let declared_kind = if cells
            .get(1)
            .is_some_and(|t| t.to_ascii_lowercase().contains("video"))
        {
            MediaKind::Video
        } else {
            MediaKind::Image
        };
        let captured_at = cells.first().and_then(|t| parse_capture_time(t));

        let index = u32::try_from(items.len() + 1).map_err(|_| {
            Error::ManifestFormat("export document has more rows than supported".into())
        })?;
        items.push(WorkItem {
            index,
            url: caps[1].to_string(),
            declared_kind,
            captured_at,
        });
    }

    log::info!("parsed {} downloadable item(s) from manifest", items.len());
    Ok(items)
}

/// Parses the export's `YYYY-MM-DD HH:MM:SS UTC` capture timestamps.
fn parse_capture_time(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim().trim_end_matches(" UTC");
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
