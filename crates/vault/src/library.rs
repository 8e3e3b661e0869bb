use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::jobs::{JobLedger, JobStatus, JobVideoRecord};
use crate::sidecar::{self, Sidecar};

/// A finalized video in the library
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryVideo {
    pub id: String,
    pub youtube_id: String,
    pub title: String,
    pub channel: String,
    pub file_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub file_path: PathBuf,
}

/// Source of library videos for retention decisions
pub trait LibraryIndex: Send + Sync {
    /// Videos eligible for eviction
    fn videos(&self) -> Result<Vec<LibraryVideo>>;

    /// Mark a video as removed after its files were deleted
    fn mark_removed(&self, video: &LibraryVideo) -> Result<()>;
}

/// Removes a video's files from storage
pub trait Deleter: Send + Sync {
    fn delete(&self, video: &LibraryVideo) -> Result<()>;
}

/// Library built from completed job ledger rows and archived sidecars.
///
/// Only rows with status `completed` are listed, so a video still being
/// finalized is never an eviction candidate.
pub struct CatalogLibrary {
    jobs: Box<dyn JobLedger>,
    sidecar_dir: PathBuf,
}

impl CatalogLibrary {
    pub fn new(jobs: Box<dyn JobLedger>, sidecar_dir: impl Into<PathBuf>) -> Self {
        CatalogLibrary { jobs, sidecar_dir: sidecar_dir.into() }
    }
}

impl LibraryIndex for CatalogLibrary {
    fn videos(&self) -> Result<Vec<LibraryVideo>> {
        // Latest completed row per video; the same video can appear in several jobs
        let mut latest = HashMap::new();
        for record in self.jobs.records()? {
            if record.status != JobStatus::Completed || record.file_path.is_none() {
                continue;
            }
            match latest.get(&record.youtube_id) {
                Some(existing) if existing_is_newer(existing, &record) => {}
                _ => {
                    latest.insert(record.youtube_id.clone(), record);
                }
            }
        }

        let mut videos = Vec::with_capacity(latest.len());
        for record in latest.into_values() {
            let Some(file_path) = record.file_path.clone() else { continue };

            let file_size_bytes = match fs::metadata(&file_path) {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!("Cannot stat {} ({}), counting as 0 bytes", file_path.display(), e);
                    0
                }
            };

            let archived = sidecar::archived_sidecar_path(&self.sidecar_dir, &record.youtube_id);
            let meta = match Sidecar::load(&archived) {
                Ok(s) => s.unwrap_or_default(),
                Err(e) => {
                    warn!("Ignoring unreadable sidecar {}: {:#}", archived.display(), e);
                    Sidecar::default()
                }
            };
            let title = meta
                .display_title()
                .map(str::to_string)
                .or_else(|| file_path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_else(|| record.youtube_id.clone());

            videos.push(LibraryVideo {
                id: format!("{}/{}", record.job_id, record.youtube_id),
                youtube_id: record.youtube_id.clone(),
                title,
                channel: meta.channel_name().to_string(),
                file_size_bytes,
                created_at: record.completed_at.unwrap_or(record.updated_at),
                file_path,
            });
        }

        Ok(videos)
    }

    fn mark_removed(&self, video: &LibraryVideo) -> Result<()> {
        let (job_id, youtube_id) = video
            .id
            .rsplit_once('/')
            .ok_or_else(|| anyhow!("Malformed library video id: {}", video.id))?;
        self.jobs.update(job_id, youtube_id, JobStatus::Removed, None)?;

        // Older jobs that completed the same video point at the same files
        for record in self.jobs.records()? {
            if record.youtube_id == youtube_id && record.status == JobStatus::Completed {
                debug!("Also marking job {} row for {} removed", record.job_id, youtube_id);
                self.jobs.update(&record.job_id, youtube_id, JobStatus::Removed, None)?;
            }
        }
        Ok(())
    }
}

fn existing_is_newer(existing: &JobVideoRecord, candidate: &JobVideoRecord) -> bool {
    existing.updated_at >= candidate.updated_at
}

/// Deletes the media file, same-stem companions, and the directory once empty
#[derive(Debug, Clone)]
pub struct FsDeleter {
    library_root: PathBuf,
}

/// Companion files that share the media file's stem
const COMPANION_EXTENSIONS: &[&str] = &["nfo", "jpg", "jpeg", "webp", "png", "info.json", "description"];

impl FsDeleter {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        FsDeleter { library_root: library_root.into() }
    }

    fn remove_if_present(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

impl Deleter for FsDeleter {
    fn delete(&self, video: &LibraryVideo) -> Result<()> {
        let media = &video.file_path;
        if !media.starts_with(&self.library_root) {
            anyhow::bail!("Refusing to delete outside library root: {}", media.display());
        }

        Self::remove_if_present(media)?;
        for ext in COMPANION_EXTENSIONS {
            Self::remove_if_present(&media.with_extension(ext))?;
        }

        // Per-video directory goes once empty; a failure here leaves an empty dir behind
        if let Some(dir) = media.parent() {
            if dir != self.library_root && dir.starts_with(&self.library_root) {
                let empty = fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false);
                if empty {
                    if let Err(e) = fs::remove_dir(dir) {
                        debug!("Leaving directory {}: {}", dir.display(), e);
                    }
                }
            }
        }

        debug!("Deleted {} ({})", video.youtube_id, media.display());
        Ok(())
    }
}
