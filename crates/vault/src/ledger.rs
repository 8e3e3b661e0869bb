use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};

/// Tag written in front of every entry
pub const LEDGER_TAG: &str = "youtube";

/// Prefix for canonical playable URLs
const SHORT_URL_PREFIX: &str = "https://youtu.be/";

/// Append-only ledger of downloaded video IDs
#[derive(Debug, Clone)]
pub struct ArchiveLedger {
    path: PathBuf,
}

impl ArchiveLedger {
    /// Create a ledger handle for the given file. The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ArchiveLedger { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all non-blank lines with line endings stripped.
    /// A missing ledger file is an empty ledger.
    pub fn read_all_lines(&self) -> Result<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read ledger: {}", self.path.display()));
            }
        };

        Ok(content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Video IDs of every entry, in file order (duplicates included)
    pub fn video_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .read_all_lines()?
            .iter()
            .filter_map(|line| parse_entry(line))
            .map(str::to_string)
            .collect())
    }

    /// Number of entries currently in the ledger
    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.video_ids()?.len())
    }

    /// Check whether a video ID has been recorded
    pub fn contains_video(&self, video_id: &str) -> Result<bool> {
        let video_id = video_id.trim();
        if video_id.is_empty() {
            return Ok(false);
        }
        Ok(self
            .read_all_lines()?
            .iter()
            .any(|line| parse_entry(line) == Some(video_id)))
    }

    /// Append a video ID. Returns false if the ID is empty or already recorded.
    ///
    /// The check and the append are not atomic; two concurrent writers can
    /// both append the same ID. Readers tolerate the duplicate.
    pub fn record_video(&self, video_id: &str) -> Result<bool> {
        let video_id = video_id.trim();
        if video_id.is_empty() {
            warn!("Refusing to record empty video ID in {}", self.path.display());
            return Ok(false);
        }
        if self.contains_video(video_id)? {
            debug!("Video {} already in ledger {}", video_id, self.path.display());
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger for append: {}", self.path.display()))?;

        // Single write so concurrent appenders never interleave within a line
        file.write_all(format!("{} {}\n", LEDGER_TAG, video_id).as_bytes())
            .with_context(|| format!("Failed to append to ledger: {}", self.path.display()))?;

        info!("Recorded video {} in ledger {}", video_id, self.path.display());
        Ok(true)
    }

    /// Remove the first entry for a video ID. Returns false if absent.
    /// Every other non-blank line, including ones this ledger doesn't understand,
    /// is kept in order; blank lines are dropped.
    pub fn forget_video(&self, video_id: &str) -> Result<bool> {
        let video_id = video_id.trim();
        if video_id.is_empty() {
            return Ok(false);
        }

        let lines = self.read_all_lines()?;
        let Some(index) = lines.iter().position(|line| parse_entry(line) == Some(video_id)) else {
            return Ok(false);
        };

        let mut content = String::new();
        for (i, line) in lines.iter().enumerate() {
            if i != index {
                content.push_str(line);
                content.push('\n');
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write ledger temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace ledger: {}", self.path.display()))?;

        info!("Removed video {} from ledger {}", video_id, self.path.display());
        Ok(true)
    }

    /// Playable URLs for every entry at index >= previous_count.
    /// Callers snapshot `entry_count()` before a download run and call this afterwards.
    pub fn urls_added_since(&self, previous_count: i64) -> Result<Vec<String>> {
        let start = usize::try_from(previous_count.max(0)).unwrap_or(usize::MAX);
        let ids = self.video_ids()?;
        if start >= ids.len() {
            return Ok(Vec::new());
        }
        Ok(ids[start..]
            .iter()
            .map(|id| format!("{}{}", SHORT_URL_PREFIX, id))
            .collect())
    }
}

/// Extract the video ID from a ledger line if it carries our tag
fn parse_entry(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    let tag = parts.next()?;
    let id = parts.next()?;
    if tag != LEDGER_TAG || parts.next().is_some() {
        return None;
    }
    Some(id)
}
