use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channel name used when the downloader reported none
pub const UNKNOWN_CHANNEL: &str = "Unknown Channel";

/// Private key carrying the finalized media path in archived sidecars
pub const FINAL_PATH_KEY: &str = "_vault_final_path";

/// Thumbnail extensions the downloader may write next to the media
const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "webp", "png"];

/// `.info.json` metadata written by the downloader next to each video.
///
/// Only the fields the pipeline reads are typed; everything else is kept in
/// `extra` so rewriting the file doesn't lose information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulltitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// YYYYMMDD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Absolute path of the finalized media file, injected before the sidecar is archived
    #[serde(rename = "_vault_final_path", default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Sidecar {
    /// Load a sidecar. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Sidecar>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read sidecar: {}", path.display())),
        };
        let sidecar = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse sidecar JSON: {}", path.display()))?;
        Ok(Some(sidecar))
    }

    /// uploader ?? channel ?? uploader_id ?? channel_id ?? "Unknown Channel"
    pub fn channel_name(&self) -> &str {
        [&self.uploader, &self.channel, &self.uploader_id, &self.channel_id]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_CHANNEL)
    }

    /// Best available title
    pub fn display_title(&self) -> Option<&str> {
        self.fulltitle
            .as_deref()
            .or(self.title.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Parsed upload date, if present and well-formed
    pub fn upload_date(&self) -> Option<NaiveDate> {
        parse_upload_date(self.upload_date.as_deref()?)
    }

    /// Categories followed by tags, de-duplicated case-insensitively, in first-seen order
    pub fn genres(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.categories
            .iter()
            .chain(self.tags.iter())
            .flatten()
            .map(|g| g.trim())
            .filter(|g| !g.is_empty())
            .filter(|g| seen.insert(g.to_lowercase()))
            .map(str::to_string)
            .collect()
    }
}

/// Parse an 8-digit YYYYMMDD date
pub fn parse_upload_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
}

/// Copy the sidecar at `source` to `dest`, adding only the final media path.
///
/// Works on the raw JSON so fields the typed record can't parse survive. A
/// file that isn't a JSON object is copied byte for byte. Returns whether the
/// final path was injected.
pub fn archive_to(source: &Path, dest: &Path, final_path: &Path) -> Result<bool> {
    let raw = fs::read(source).with_context(|| format!("Failed to read sidecar: {}", source.display()))?;
    let (body, injected) = match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(mut map)) => {
            map.insert(FINAL_PATH_KEY.to_string(), Value::String(final_path.to_string_lossy().into_owned()));
            let body = serde_json::to_vec(&Value::Object(map)).context("Failed to serialize sidecar")?;
            (body, true)
        }
        _ => (raw, false),
    };
    fs::write(dest, body).with_context(|| format!("Failed to write sidecar: {}", dest.display()))?;
    Ok(injected)
}

/// Get the path to the downloader's sidecar for a given media file
pub fn sidecar_path(media_path: &Path) -> PathBuf {
    let mut path = media_path.to_path_buf();
    path.set_extension("info.json");
    path
}

/// Get the path to the companion .nfo for a given media file
pub fn nfo_path(media_path: &Path) -> PathBuf {
    let mut path = media_path.to_path_buf();
    path.set_extension("nfo");
    path
}

/// Thumbnails sharing the media file's stem that exist on disk
pub fn thumbnail_paths(media_path: &Path) -> Vec<PathBuf> {
    THUMBNAIL_EXTENSIONS
        .iter()
        .map(|ext| media_path.with_extension(ext))
        .filter(|p| p.is_file())
        .collect()
}

/// Archived sidecar location for a video
pub fn archived_sidecar_path(sidecar_dir: &Path, video_id: &str) -> PathBuf {
    sidecar_dir.join(format!("{}.info.json", video_id))
}

/// Video ID from the last bracketed token of the file name: `Title [abc123].mp4` -> `abc123`
pub fn video_id_from_path(media_path: &Path) -> Option<String> {
    let stem = media_path.file_stem()?.to_str()?;
    let end = stem.rfind(']')?;
    let start = stem[..end].rfind('[')?;
    let id = stem[start + 1..end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
