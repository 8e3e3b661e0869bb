use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
    Removed,
}

/// One video within a download job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVideoRecord {
    pub job_id: String,
    pub youtube_id: String,
    pub status: JobStatus,
    pub file_path: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
    /// First time the row reached `completed`
    pub completed_at: Option<DateTime<Utc>>,
}

/// Keyed store of job/video status rows
pub trait JobLedger: Send + Sync {
    /// Upsert the row for `(job_id, video_id)`. A `None` file path keeps the stored one.
    fn update(&self, job_id: &str, video_id: &str, status: JobStatus, file_path: Option<&Path>) -> Result<()>;

    fn get(&self, job_id: &str, video_id: &str) -> Result<Option<JobVideoRecord>>;

    fn records(&self) -> Result<Vec<JobVideoRecord>>;

    /// Most recently updated row for a video across all jobs
    fn latest_for_video(&self, video_id: &str) -> Result<Option<JobVideoRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.youtube_id == video_id)
            .max_by_key(|r| r.updated_at))
    }
}

/// Job ledger stored as one JSON file per row
#[derive(Debug, Clone)]
pub struct FsJobLedger {
    root: PathBuf,
}

impl FsJobLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsJobLedger { root: root.into() }
    }

    fn row_path(&self, job_id: &str, video_id: &str) -> PathBuf {
        self.root.join(sanitize(job_id)).join(format!("{}.json", sanitize(video_id)))
    }

    fn load_row(path: &Path) -> Result<JobVideoRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job row: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse job row: {}", path.display()))
    }
}

impl JobLedger for FsJobLedger {
    fn update(&self, job_id: &str, video_id: &str, status: JobStatus, file_path: Option<&Path>) -> Result<()> {
        let path = self.row_path(job_id, video_id);
        let now = Utc::now();

        let record = match self.get(job_id, video_id)? {
            Some(mut existing) => {
                if status == JobStatus::Completed && existing.completed_at.is_none() {
                    existing.completed_at = Some(now);
                }
                existing.status = status;
                if let Some(p) = file_path {
                    existing.file_path = Some(p.to_path_buf());
                }
                existing.updated_at = now;
                existing
            }
            None => JobVideoRecord {
                job_id: job_id.to_string(),
                youtube_id: video_id.to_string(),
                status,
                file_path: file_path.map(Path::to_path_buf),
                updated_at: now,
                completed_at: (status == JobStatus::Completed).then_some(now),
            },
        };

        let dir = path.parent().context("Job row path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;

        // Write to a unique temp file then rename so readers never see a torn row
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let json = serde_json::to_string_pretty(&record).context("Failed to serialize job row")?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write job row: {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to commit job row: {}", path.display()))?;

        debug!("Job {} video {} -> {:?}", job_id, video_id, status);
        Ok(())
    }

    fn get(&self, job_id: &str, video_id: &str) -> Result<Option<JobVideoRecord>> {
        let path = self.row_path(job_id, video_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_row(&path).map(Some)
    }

    fn records(&self) -> Result<Vec<JobVideoRecord>> {
        let mut records = Vec::new();
        if !self.root.exists() {
            return Ok(records);
        }

        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading job ledger entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::load_row(path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable job row {}: {:#}", path.display(), e),
            }
        }

        Ok(records)
    }
}

/// Keep IDs usable as single path components
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsJobLedger::new(dir.path());

        assert!(ledger.get("job1", "abc").unwrap().is_none());

        ledger.update("job1", "abc", JobStatus::Pending, None).unwrap();
        let row = ledger.get("job1", "abc").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.completed_at.is_none());

        ledger.update("job1", "abc", JobStatus::Completed, Some(Path::new("/lib/a.mp4"))).unwrap();
        let row = ledger.get("job1", "abc").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.file_path, Some(PathBuf::from("/lib/a.mp4")));
        let completed_at = row.completed_at.unwrap();

        // Removal keeps path and completion time
        ledger.update("job1", "abc", JobStatus::Removed, None).unwrap();
        let row = ledger.get("job1", "abc").unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Removed);
        assert_eq!(row.file_path, Some(PathBuf::from("/lib/a.mp4")));
        assert_eq!(row.completed_at, Some(completed_at));
    }

    #[test]
    fn test_rows_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsJobLedger::new(dir.path());
        ledger.update("job1", "a", JobStatus::Completed, Some(Path::new("/lib/a.mp4"))).unwrap();
        ledger.update("job1", "b", JobStatus::Failed, None).unwrap();
        ledger.update("job2", "a", JobStatus::Pending, None).unwrap();

        let mut records = ledger.records().unwrap();
        records.sort_by(|x, y| (&x.job_id, &x.youtube_id).cmp(&(&y.job_id, &y.youtube_id)));
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].status, JobStatus::Failed);

        let latest = ledger.latest_for_video("a").unwrap().unwrap();
        assert_eq!(latest.job_id, "job2");
    }

    #[test]
    fn test_hostile_ids_stay_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsJobLedger::new(dir.path().join("jobs"));
        ledger.update("../escape", "x/y", JobStatus::Completed, None).unwrap();
        assert!(!dir.path().join("escape").exists());
        assert_eq!(ledger.records().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsJobLedger::new(dir.path().join("nothing"));
        assert!(ledger.records().unwrap().is_empty());
    }
}
