use std::collections::HashSet;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::library::{Deleter, LibraryIndex, LibraryVideo};
use crate::probe::{StorageProbe, StorageStatus};

/// Number of oldest candidates echoed back per strategy
pub const SAMPLE_SIZE: usize = 5;

const KIB: f64 = 1024.0;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("no retention strategy configured (set ageThresholdDays and/or spaceThreshold)")]
    NoStrategy,
    #[error("retention is disabled; enable it before applying")]
    Disabled,
    #[error("invalid age threshold: {0}")]
    InvalidAge(f64),
    #[error("invalid space threshold {0:?}")]
    InvalidSpace(String),
    #[error("library index unavailable: {0:#}")]
    Library(anyhow::Error),
    #[error("storage probe failed: {0:#}")]
    Probe(anyhow::Error),
}

/// Retention policy as configured by the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionRequest {
    pub enabled: bool,
    pub age_threshold_days: Option<f64>,
    /// e.g. "10GB"
    pub space_threshold: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Plan,
    Apply,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_days: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_bytes: Option<u64>,
    pub candidate_count: usize,
    pub estimated_freed_bytes: u64,
    pub deleted_count: usize,
    pub failed_count: usize,
    pub needs_cleanup: bool,
    pub iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_status: Option<StorageStatus>,
    pub sample_videos: Vec<LibraryVideo>,
    #[serde(skip)]
    candidate_ids: Vec<String>,
}

impl StrategyResult {
    /// IDs of the chosen videos, oldest first
    pub fn candidate_ids(&self) -> &[String] {
        &self.candidate_ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationTotals {
    /// Size of the union of both candidate sets
    pub total: usize,
    pub estimated_freed_bytes: u64,
    pub deleted_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionError {
    pub video_id: String,
    pub youtube_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPlan {
    pub mode: Mode,
    pub age_strategy: StrategyResult,
    pub space_strategy: StrategyResult,
    pub simulation_totals: SimulationTotals,
    pub errors: Vec<EvictionError>,
}

/// Parse a size like `10GB`, `1.5 tb` or `500M` into bytes (binary multiples)
pub fn parse_size(raw: &str) -> Result<u64, RetentionError> {
    let invalid = || RetentionError::InvalidSpace(raw.to_string());
    let s = raw.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => KIB.powi(2),
        "G" | "GB" | "GIB" => KIB.powi(3),
        "T" | "TB" | "TIB" => KIB.powi(4),
        _ => return Err(invalid()),
    };
    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes <= 0.0 {
        return Err(invalid());
    }
    Ok(bytes.round() as u64)
}

/// Evaluates retention strategies over a library
pub struct RetentionEngine {
    library: Box<dyn LibraryIndex>,
    probe: Box<dyn StorageProbe>,
    deleter: Box<dyn Deleter>,
}

impl RetentionEngine {
    pub fn new(library: Box<dyn LibraryIndex>, probe: Box<dyn StorageProbe>, deleter: Box<dyn Deleter>) -> Self {
        RetentionEngine { library, probe, deleter }
    }

    pub fn evaluate(&self, request: &RetentionRequest, mode: Mode) -> Result<RetentionPlan, RetentionError> {
        self.evaluate_at(request, mode, Utc::now())
    }

    /// Evaluate with an explicit clock
    pub fn evaluate_at(
        &self,
        request: &RetentionRequest,
        mode: Mode,
        now: DateTime<Utc>,
    ) -> Result<RetentionPlan, RetentionError> {
        let age_days = request.age_threshold_days;
        let space = request.space_threshold.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if age_days.is_none() && space.is_none() {
            return Err(RetentionError::NoStrategy);
        }
        if mode == Mode::Apply && !request.enabled {
            return Err(RetentionError::Disabled);
        }
        if let Some(days) = age_days {
            if !days.is_finite() || days < 0.0 {
                return Err(RetentionError::InvalidAge(days));
            }
        }
        let space_bytes = space.map(parse_size).transpose()?;

        let mut videos = self.library.videos().map_err(RetentionError::Library)?;
        sort_oldest_first(&mut videos);

        let mut age_strategy = match age_days {
            Some(days) => age_candidates(&videos, days, now),
            None => StrategyResult::default(),
        };
        let mut space_strategy = match (space, space_bytes) {
            (Some(raw), Some(bytes)) => {
                let status = self.probe.status().map_err(RetentionError::Probe)?;
                let mut result = space_candidates(&videos, bytes, status);
                result.threshold = Some(raw.to_string());
                result
            }
            _ => StrategyResult::default(),
        };

        // Union of both sets, oldest first
        let chosen: HashSet<&str> = age_strategy
            .candidate_ids
            .iter()
            .chain(space_strategy.candidate_ids.iter())
            .map(String::as_str)
            .collect();
        let union: Vec<&LibraryVideo> = videos.iter().filter(|v| chosen.contains(v.id.as_str())).collect();

        let mut totals = SimulationTotals {
            total: union.len(),
            estimated_freed_bytes: union.iter().map(|v| v.file_size_bytes).sum(),
            ..SimulationTotals::default()
        };

        info!(
            "Retention {:?}: age {} candidate(s), space {} candidate(s), {} unique, {} bytes",
            mode,
            age_strategy.candidate_count,
            space_strategy.candidate_count,
            totals.total,
            totals.estimated_freed_bytes
        );

        let mut errors = Vec::new();
        if mode == Mode::Apply {
            let mut deleted = HashSet::new();
            for video in &union {
                match self.evict(video) {
                    Ok(()) => {
                        deleted.insert(video.id.clone());
                    }
                    Err(e) => {
                        warn!("Failed to evict {} ({}): {:#}", video.youtube_id, video.file_path.display(), e);
                        errors.push(EvictionError {
                            video_id: video.id.clone(),
                            youtube_id: video.youtube_id.clone(),
                            message: format!("{:#}", e),
                        });
                    }
                }
            }

            for strategy in [&mut age_strategy, &mut space_strategy] {
                let (ok, failed): (Vec<&String>, Vec<&String>) =
                    strategy.candidate_ids.iter().partition(|id| deleted.contains(*id));
                strategy.deleted_count = ok.len();
                strategy.failed_count = failed.len();
            }
            totals.deleted_count = deleted.len();
            totals.failed_count = errors.len();
            info!("Retention applied: {} deleted, {} failed", totals.deleted_count, totals.failed_count);
        }

        Ok(RetentionPlan {
            mode,
            age_strategy,
            space_strategy,
            simulation_totals: totals,
            errors,
        })
    }

    /// Delete files, then mark the video removed. The download ledger entry stays.
    fn evict(&self, video: &LibraryVideo) -> anyhow::Result<()> {
        self.deleter.delete(video)?;
        self.library.mark_removed(video)?;
        info!("Evicted {} ({} bytes)", video.youtube_id, video.file_size_bytes);
        Ok(())
    }
}

/// Oldest first, ties broken by id so selection is deterministic
fn sort_oldest_first(videos: &mut [LibraryVideo]) {
    videos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn age_candidates(videos: &[LibraryVideo], days: f64, now: DateTime<Utc>) -> StrategyResult {
    let max_age = Duration::try_milliseconds((days * 86_400_000.0) as i64).unwrap_or(Duration::MAX);
    let candidates: Vec<&LibraryVideo> = videos.iter().filter(|v| now - v.created_at > max_age).collect();

    StrategyResult {
        enabled: true,
        threshold_days: Some(days),
        candidate_count: candidates.len(),
        estimated_freed_bytes: candidates.iter().map(|v| v.file_size_bytes).sum(),
        needs_cleanup: !candidates.is_empty(),
        iterations: videos.len(),
        sample_videos: candidates.iter().take(SAMPLE_SIZE).map(|v| (*v).clone()).collect(),
        candidate_ids: candidates.iter().map(|v| v.id.clone()).collect(),
        ..StrategyResult::default()
    }
}

/// Greedily pick the oldest videos until the free-space shortfall is covered.
/// `videos` must already be sorted oldest first.
fn space_candidates(videos: &[LibraryVideo], threshold_bytes: u64, status: StorageStatus) -> StrategyResult {
    let mut result = StrategyResult {
        enabled: true,
        threshold_bytes: Some(threshold_bytes),
        storage_status: Some(status),
        ..StrategyResult::default()
    };

    if status.free_bytes >= threshold_bytes {
        return result;
    }
    result.needs_cleanup = true;

    let mut shortfall = threshold_bytes - status.free_bytes;
    let mut candidates = Vec::new();
    // Bounded by the number of videos so zero-size entries can't spin forever
    while shortfall > 0 && result.iterations < videos.len() {
        let video = &videos[result.iterations];
        result.iterations += 1;
        shortfall = shortfall.saturating_sub(video.file_size_bytes);
        candidates.push(video);
    }

    if shortfall > 0 {
        warn!("Deleting every video still leaves {} bytes below the space threshold", shortfall);
    }

    result.candidate_count = candidates.len();
    result.estimated_freed_bytes = candidates.iter().map(|v| v.file_size_bytes).sum();
    result.sample_videos = candidates.iter().take(SAMPLE_SIZE).map(|v| (*v).clone()).collect();
    result.candidate_ids = candidates.iter().map(|v| v.id.clone()).collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[derive(Clone, Default)]
    struct FakeLibrary {
        videos: Arc<Mutex<Vec<LibraryVideo>>>,
        removed: Arc<Mutex<Vec<String>>>,
    }

    impl LibraryIndex for FakeLibrary {
        fn videos(&self) -> anyhow::Result<Vec<LibraryVideo>> {
            let removed = self.removed.lock().unwrap();
            Ok(self
                .videos
                .lock()
                .unwrap()
                .iter()
                .filter(|v| !removed.contains(&v.id))
                .cloned()
                .collect())
        }

        fn mark_removed(&self, video: &LibraryVideo) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(video.id.clone());
            Ok(())
        }
    }

    struct FixedProbe(StorageStatus);

    impl StorageProbe for FixedProbe {
        fn status(&self) -> anyhow::Result<StorageStatus> {
            Ok(self.0)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingDeleter {
        deleted: Arc<Mutex<Vec<String>>>,
        fail_on: Vec<String>,
    }

    impl Deleter for RecordingDeleter {
        fn delete(&self, video: &LibraryVideo) -> anyhow::Result<()> {
            if self.fail_on.contains(&video.youtube_id) {
                anyhow::bail!("permission denied");
            }
            self.deleted.lock().unwrap().push(video.id.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn video(id: &str, age_days: i64, size: u64) -> LibraryVideo {
        LibraryVideo {
            id: format!("job/{}", id),
            youtube_id: id.to_string(),
            title: format!("Video {}", id),
            channel: "Chan".to_string(),
            file_size_bytes: size,
            created_at: now() - Duration::days(age_days),
            file_path: PathBuf::from(format!("/lib/{}.mp4", id)),
        }
    }

    fn engine(
        videos: Vec<LibraryVideo>,
        free: u64,
        total: u64,
        deleter: RecordingDeleter,
    ) -> (RetentionEngine, FakeLibrary) {
        let library = FakeLibrary::default();
        *library.videos.lock().unwrap() = videos;
        let engine = RetentionEngine::new(
            Box::new(library.clone()),
            Box::new(FixedProbe(StorageStatus::new(free, total))),
            Box::new(deleter),
        );
        (engine, library)
    }

    fn request(age: Option<f64>, space: Option<&str>) -> RetentionRequest {
        RetentionRequest { enabled: true, age_threshold_days: age, space_threshold: space.map(str::to_string) }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("10GB").unwrap(), 10 * GIB);
        assert_eq!(parse_size(" 1.5 tb ").unwrap(), 1536 * GIB);
        assert_eq!(parse_size("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("2048").unwrap(), 2048);
        assert!(parse_size("GB").is_err());
        assert!(parse_size("10XB").is_err());
        assert!(parse_size("0GB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_no_strategy_is_rejected() {
        let (engine, _) = engine(vec![video("a", 10, 1)], 0, 1, RecordingDeleter::default());
        assert!(matches!(engine.evaluate_at(&request(None, None), Mode::Plan, now()), Err(RetentionError::NoStrategy)));
        assert!(matches!(
            engine.evaluate_at(&request(None, Some("  ")), Mode::Plan, now()),
            Err(RetentionError::NoStrategy)
        ));
    }

    #[test]
    fn test_apply_requires_enabled() {
        let (engine, _) = engine(vec![video("a", 10, 1)], 0, 1, RecordingDeleter::default());
        let mut req = request(Some(5.0), None);
        req.enabled = false;
        assert!(engine.evaluate_at(&req, Mode::Plan, now()).is_ok());
        assert!(matches!(engine.evaluate_at(&req, Mode::Apply, now()), Err(RetentionError::Disabled)));
    }

    #[test]
    fn test_age_strategy_oldest_first() {
        let videos = vec![video("new", 1, 10), video("old", 100, 20), video("mid", 40, 30)];
        let deleter = RecordingDeleter::default();
        let (engine, _) = engine(videos, 0, 1, deleter.clone());

        let plan = engine.evaluate_at(&request(Some(30.0), None), Mode::Plan, now()).unwrap();
        let age = &plan.age_strategy;
        assert!(age.enabled);
        assert_eq!(age.candidate_count, 2);
        assert_eq!(age.estimated_freed_bytes, 50);
        assert_eq!(age.candidate_ids(), ["job/old", "job/mid"]);
        assert_eq!(age.sample_videos[0].youtube_id, "old");
        assert!(!plan.space_strategy.enabled);
        assert_eq!(plan.simulation_totals.total, 2);
        assert!(deleter.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_space_not_needed_when_free_above_threshold() {
        let videos = vec![video("a", 100, GIB), video("b", 50, GIB)];
        let (engine, _) = engine(videos, 20 * GIB, 100 * GIB, RecordingDeleter::default());

        let plan = engine.evaluate_at(&request(Some(30.0), Some("10GB")), Mode::Plan, now()).unwrap();
        let space = &plan.space_strategy;
        assert!(space.enabled);
        assert!(!space.needs_cleanup);
        assert_eq!(space.candidate_count, 0);
        assert_eq!(space.iterations, 0);
        assert_eq!(space.storage_status.unwrap().percent_free, 20.0);
        // Age strategy is independent
        assert_eq!(plan.age_strategy.candidate_count, 2);
    }

    #[test]
    fn test_space_picks_until_shortfall_covered() {
        let videos = vec![video("a", 100, 3 * GIB), video("b", 50, 3 * GIB), video("c", 10, 3 * GIB)];
        let (engine, _) = engine(videos, 5 * GIB, 100 * GIB, RecordingDeleter::default());

        let plan = engine.evaluate_at(&request(None, Some("10GB")), Mode::Plan, now()).unwrap();
        let space = &plan.space_strategy;
        assert!(space.needs_cleanup);
        // Shortfall 5GiB -> two oldest 3GiB videos
        assert_eq!(space.candidate_ids(), ["job/a", "job/b"]);
        assert_eq!(space.iterations, 2);
        assert_eq!(space.estimated_freed_bytes, 6 * GIB);
        assert_eq!(space.threshold.as_deref(), Some("10GB"));
    }

    #[test]
    fn test_space_zero_sizes_terminate() {
        let videos = vec![video("a", 3, 0), video("b", 2, 0), video("c", 1, 0)];
        let (engine, _) = engine(videos, 0, 100, RecordingDeleter::default());

        let plan = engine.evaluate_at(&request(None, Some("1KB")), Mode::Plan, now()).unwrap();
        assert_eq!(plan.space_strategy.iterations, 3);
        assert_eq!(plan.space_strategy.candidate_count, 3);
    }

    #[test]
    fn test_totals_are_the_union() {
        let videos = vec![video("a", 100, 4), video("b", 50, 4), video("c", 10, 4)];
        let (engine, _) = engine(videos, 0, 100, RecordingDeleter::default());

        // Age picks a, b; space (shortfall 4 bytes) picks a
        let plan = engine.evaluate_at(&request(Some(30.0), Some("4B")), Mode::Plan, now()).unwrap();
        assert_eq!(plan.age_strategy.candidate_count, 2);
        assert_eq!(plan.space_strategy.candidate_count, 1);
        assert_eq!(plan.simulation_totals.total, 2);
        assert_eq!(plan.simulation_totals.estimated_freed_bytes, 8);
    }

    #[test]
    fn test_plan_is_idempotent_and_never_deletes() {
        let videos = vec![video("a", 100, 4), video("b", 50, 4)];
        let deleter = RecordingDeleter::default();
        let (engine, library) = engine(videos, 0, 100, deleter.clone());
        let req = request(Some(30.0), Some("6B"));

        let first = engine.evaluate_at(&req, Mode::Plan, now()).unwrap();
        let second = engine.evaluate_at(&req, Mode::Plan, now()).unwrap();
        assert_eq!(first, second);
        assert!(deleter.deleted.lock().unwrap().is_empty());
        assert!(library.removed.lock().unwrap().is_empty());
        assert!(first.errors.is_empty());
    }

    #[test]
    fn test_apply_collects_failures_and_continues() {
        let videos = vec![video("a", 100, 4), video("b", 50, 4), video("c", 40, 4)];
        let deleter = RecordingDeleter { fail_on: vec!["b".to_string()], ..RecordingDeleter::default() };
        let (engine, library) = engine(videos, 0, 100, deleter.clone());

        let plan = engine.evaluate_at(&request(Some(30.0), Some("4B")), Mode::Apply, now()).unwrap();

        assert_eq!(plan.simulation_totals.total, 3);
        assert_eq!(plan.simulation_totals.deleted_count, 2);
        assert_eq!(plan.simulation_totals.failed_count, 1);
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].youtube_id, "b");
        assert_eq!(plan.age_strategy.deleted_count, 2);
        assert_eq!(plan.age_strategy.failed_count, 1);
        assert_eq!(plan.space_strategy.deleted_count, 1);
        assert_eq!(*deleter.deleted.lock().unwrap(), vec!["job/a", "job/c"]);
        assert_eq!(*library.removed.lock().unwrap(), vec!["job/a", "job/c"]);
    }

    #[test]
    fn test_apply_then_plan_on_catalog() {
        use crate::jobs::{FsJobLedger, JobLedger, JobStatus};
        use crate::library::{CatalogLibrary, FsDeleter};
        use std::fs;

        let dir = tempfile::tempdir().unwrap();
        let library_root = dir.path().join("library");
        let video_dir = library_root.join("A [a]");
        fs::create_dir_all(&video_dir).unwrap();
        let media = video_dir.join("A [a].mp4");
        fs::write(&media, vec![0u8; 64]).unwrap();

        // Same video completed by two jobs
        let jobs_root = dir.path().join("jobs");
        let jobs = FsJobLedger::new(&jobs_root);
        jobs.update("job1", "a", JobStatus::Completed, Some(&media)).unwrap();
        jobs.update("job2", "a", JobStatus::Completed, Some(&media)).unwrap();

        let engine = RetentionEngine::new(
            Box::new(CatalogLibrary::new(Box::new(FsJobLedger::new(&jobs_root)), dir.path().join("sidecars"))),
            Box::new(FixedProbe(StorageStatus::new(0, 100))),
            Box::new(FsDeleter::new(&library_root)),
        );
        let later = Utc::now() + Duration::days(10);
        let req = request(Some(1.0), None);

        let applied = engine.evaluate_at(&req, Mode::Apply, later).unwrap();
        assert_eq!(applied.simulation_totals.deleted_count, 1);
        assert!(!media.exists());

        let plan = engine.evaluate_at(&req, Mode::Plan, later).unwrap();
        assert_eq!(plan.age_strategy.candidate_count, 0);
        assert_eq!(plan.simulation_totals.total, 0);
        assert_eq!(jobs.get("job1", "a").unwrap().unwrap().status, JobStatus::Removed);
    }

    proptest! {
        #[test]
        fn test_union_bound(
            rows in proptest::collection::vec((0i64..400, 0u64..1000), 0..30),
            age in 0.0f64..400.0,
            free in 0u64..5000,
            threshold in 1u64..5000,
        ) {
            let videos: Vec<LibraryVideo> = rows
                .iter()
                .enumerate()
                .map(|(i, (days, size))| video(&format!("v{}", i), *days, *size))
                .collect();
            let (engine, _) = engine(videos, free, 10_000, RecordingDeleter::default());
            let plan = engine
                .evaluate_at(&request(Some(age), Some(&format!("{}B", threshold))), Mode::Plan, now())
                .unwrap();

            let age_ids: HashSet<_> = plan.age_strategy.candidate_ids().iter().collect();
            let space_ids: HashSet<_> = plan.space_strategy.candidate_ids().iter().collect();
            let sum = plan.age_strategy.candidate_count + plan.space_strategy.candidate_count;
            prop_assert!(plan.simulation_totals.total <= sum);
            prop_assert_eq!(plan.simulation_totals.total == sum, age_ids.is_disjoint(&space_ids));
            prop_assert!(plan.space_strategy.iterations <= rows.len());
            if free >= threshold {
                prop_assert_eq!(plan.space_strategy.candidate_count, 0);
            }
        }
    }
}
