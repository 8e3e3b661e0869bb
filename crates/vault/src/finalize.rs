use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use filetime::FileTime;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::VaultConfig;
use crate::jobs::{FsJobLedger, JobLedger, JobStatus};
use crate::ledger::ArchiveLedger;
use crate::nfo::{KodiNfoWriter, NfoWriter};
use crate::remux::{self, FfmpegRemuxer, MetadataTags, Remuxer};
use crate::retry;
use crate::sidecar::{self, Sidecar};
use crate::staging::{FsMove, MovePrimitive, StagingTranslator};

/// Unrecoverable finalization failure. The caller must not treat the video as done.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("staging relocation failed for {path}: {reason}")]
    StagingRelocation { path: PathBuf, reason: String },
}

/// Pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Sidecar,
    ArchiveEntry,
    CompanionMetadata,
    EmbedMetadata,
    StagingFinalize,
    Timestamps,
    JobCompletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Done => write!(f, "done"),
            StepOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            StepOutcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// What happened during one pipeline run
#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub media_path: PathBuf,
    pub video_id: Option<String>,
    pub final_path: Option<PathBuf>,
    pub steps: Vec<(Step, StepOutcome)>,
}

impl FinalizeReport {
    fn new(media_path: &Path) -> Self {
        FinalizeReport { media_path: media_path.to_path_buf(), video_id: None, final_path: None, steps: Vec::new() }
    }

    fn record(&mut self, step: Step, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Done => debug!("{:?}: done", step),
            StepOutcome::Skipped(reason) => info!("{:?}: skipped ({})", step, reason),
            StepOutcome::Failed(reason) => warn!("{:?}: failed ({})", step, reason),
        }
        self.steps.push((step, outcome));
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    /// True if no sidecar was found and nothing was touched
    pub fn is_noop(&self) -> bool {
        matches!(self.outcome(Step::Sidecar), Some(StepOutcome::Skipped(_)))
    }
}

/// Everything one finalization run needs, owned by the caller instead of process globals
pub struct FinalizeContext {
    pub config: VaultConfig,
    pub ledger: ArchiveLedger,
    pub jobs: Box<dyn JobLedger>,
    pub staging: StagingTranslator,
    pub remuxer: Box<dyn Remuxer>,
    pub nfo: Box<dyn NfoWriter>,
    /// Active download job, if the runner provided one
    pub job_id: Option<String>,
}

impl FinalizeContext {
    /// Wire up the filesystem-backed collaborators from configuration
    pub fn from_config(config: VaultConfig, job_id: Option<String>) -> Self {
        FinalizeContext {
            ledger: ArchiveLedger::new(&config.ledger_path),
            jobs: Box::new(FsJobLedger::new(&config.job_state_dir)),
            staging: StagingTranslator::from_config(&config),
            remuxer: Box::new(FfmpegRemuxer::new(&config.ffmpeg_bin)),
            nfo: Box::new(KodiNfoWriter),
            job_id: job_id.filter(|id| !id.trim().is_empty()),
            config,
        }
    }
}

pub struct Finalizer {
    ctx: FinalizeContext,
}

impl Finalizer {
    pub fn new(ctx: FinalizeContext) -> Self {
        Finalizer { ctx }
    }

    pub fn context(&self) -> &FinalizeContext {
        &self.ctx
    }

    /// Run the pipeline for one downloaded media file
    pub async fn run(&self, media_path: &Path) -> Result<FinalizeReport, FinalizeError> {
        let media_path = std::path::absolute(media_path).unwrap_or_else(|_| media_path.to_path_buf());
        let media_path = media_path.as_path();
        let mut report = FinalizeReport::new(media_path);
        let cfg = &self.ctx.config;

        // Gate: no sidecar, nothing to finalize
        let sidecar_src = sidecar::sidecar_path(media_path);
        if !sidecar_src.is_file() {
            info!("No sidecar for {}, nothing to finalize", media_path.display());
            report.record(Step::Sidecar, StepOutcome::Skipped("no sidecar".to_string()));
            return Ok(report);
        }

        let sidecar = match Sidecar::load(&sidecar_src) {
            Ok(Some(s)) => s,
            Ok(None) => {
                report.record(Step::Sidecar, StepOutcome::Skipped("sidecar disappeared".to_string()));
                return Ok(report);
            }
            Err(e) => {
                warn!("Unreadable sidecar {}, continuing without metadata: {:#}", sidecar_src.display(), e);
                Sidecar::default()
            }
        };

        let video_id = resolve_video_id(media_path, &sidecar);
        report.video_id = Some(video_id.clone());
        info!("Finalizing video {}: {}", video_id, media_path.display());

        let staged = self.ctx.staging.is_staging_path(media_path);
        let final_path = if staged { self.ctx.staging.to_final_path(media_path) } else { media_path.to_path_buf() };

        // Step 1: archive the sidecar with the final path injected
        let outcome = match archive_sidecar(&sidecar_src, &final_path, &cfg.sidecar_dir, &video_id) {
            Ok(dest) => {
                debug!("Video {}: sidecar archived at {}", video_id, dest.display());
                StepOutcome::Done
            }
            Err(e) => {
                error!("Video {}: failed to archive sidecar {}: {:#}", video_id, sidecar_src.display(), e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        };
        report.record(Step::Sidecar, outcome);

        let outcome = match self.ctx.ledger.record_video(&video_id) {
            Ok(true) => StepOutcome::Done,
            Ok(false) => StepOutcome::Skipped("already recorded".to_string()),
            Err(e) => {
                error!("Video {}: failed to record in ledger: {:#}", video_id, e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        };
        report.record(Step::ArchiveEntry, outcome);

        // Step 2: companion metadata
        let outcome = if !cfg.write_nfo {
            StepOutcome::Skipped("disabled".to_string())
        } else {
            match self.ctx.nfo.write(media_path, &video_id, &sidecar) {
                Ok(()) => StepOutcome::Done,
                Err(e) => {
                    warn!("Video {}: nfo write failed for {}: {:#}", video_id, media_path.display(), e);
                    StepOutcome::Failed(format!("{:#}", e))
                }
            }
        };
        report.record(Step::CompanionMetadata, outcome);

        // Step 3: embed extended metadata
        let outcome = if !cfg.embed_metadata {
            StepOutcome::Skipped("disabled".to_string())
        } else if !remux::is_taggable(media_path) {
            StepOutcome::Skipped("container not taggable".to_string())
        } else {
            let fallback_title = media_path.file_stem().and_then(|s| s.to_str()).unwrap_or(&video_id);
            let tags = MetadataTags::from_sidecar(&sidecar, fallback_title);
            embed_metadata(
                self.ctx.remuxer.as_ref(),
                &FsMove,
                media_path,
                &tags,
                cfg.min_remux_ratio,
                cfg.replace_retries,
                retry::exponential(cfg.replace_backoff()),
            )
            .await
        };
        report.record(Step::EmbedMetadata, outcome);

        // Step 4: staging finalize, fatal on failure
        if staged {
            let source_dir = media_path.parent().unwrap_or(media_path);
            let relocation = self.ctx.staging.relocate(source_dir, None).await;
            if !relocation.success {
                let reason = relocation.error.unwrap_or_else(|| "unknown relocation failure".to_string());
                error!("❌ Video {}: staging relocation failed: {}", video_id, reason);
                return Err(FinalizeError::StagingRelocation { path: media_path.to_path_buf(), reason });
            }
            if !final_path.exists() {
                let reason = format!("media missing after relocation: {}", final_path.display());
                error!("❌ Video {}: {}", video_id, reason);
                return Err(FinalizeError::StagingRelocation { path: media_path.to_path_buf(), reason });
            }
            report.record(Step::StagingFinalize, StepOutcome::Done);
        } else {
            let reason = if self.ctx.staging.is_enabled() { "not a staging path" } else { "staging disabled" };
            report.record(Step::StagingFinalize, StepOutcome::Skipped(reason.to_string()));
        }
        report.final_path = Some(final_path.clone());

        // Step 5: timestamps
        let outcome = match sidecar.upload_date() {
            Some(date) => normalize_timestamps(&final_path, date, &video_id),
            None => StepOutcome::Skipped("no upload date".to_string()),
        };
        report.record(Step::Timestamps, outcome);

        // Step 6: job completion
        let outcome = match &self.ctx.job_id {
            None => {
                warn!("Video {}: no active job ID, skipping job ledger update", video_id);
                StepOutcome::Skipped("no job id".to_string())
            }
            Some(job_id) => match self.ctx.jobs.update(job_id, &video_id, JobStatus::Completed, Some(&final_path)) {
                Ok(()) => StepOutcome::Done,
                Err(e) => {
                    error!("Video {}: failed to record completion for job {}: {:#}", video_id, job_id, e);
                    StepOutcome::Failed(format!("{:#}", e))
                }
            },
        };
        report.record(Step::JobCompletion, outcome);

        info!("✅ Finalized video {}: {}", video_id, final_path.display());
        Ok(report)
    }
}

/// Bracketed ID from the file name, then the sidecar's `id`, then the file stem
pub fn resolve_video_id(media_path: &Path, sidecar: &Sidecar) -> String {
    if let Some(id) = sidecar::video_id_from_path(media_path) {
        return id;
    }
    if let Some(id) = sidecar.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        warn!("No bracketed ID in {}, using sidecar id {}", media_path.display(), id);
        return id.to_string();
    }
    let stem = media_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| media_path.display().to_string());
    warn!("No video ID for {}, falling back to file stem", media_path.display());
    stem
}

/// Move the sidecar into `sidecar_dir/{video_id}.info.json` with the final path added.
/// The original is removed only after the archived copy is written.
fn archive_sidecar(source: &Path, final_path: &Path, sidecar_dir: &Path, video_id: &str) -> Result<PathBuf> {
    fs::create_dir_all(sidecar_dir)
        .with_context(|| format!("Failed to create sidecar directory: {}", sidecar_dir.display()))?;
    let dest = sidecar::archived_sidecar_path(sidecar_dir, video_id);
    // Overwrites any stale sidecar from an earlier download of the same video
    if !sidecar::archive_to(source, &dest, final_path)? {
        warn!("Video {}: sidecar {} is not a JSON object, archived unchanged", video_id, source.display());
    }
    fs::remove_file(source).with_context(|| format!("Failed to remove original sidecar: {}", source.display()))?;
    Ok(dest)
}

/// Remux into a temp sibling with tags, then swap it in if it passes the size guard.
/// Never raises: on any failure the temp file is removed and the original left as is.
pub async fn embed_metadata<B>(
    remuxer: &dyn Remuxer,
    replacer: &dyn MovePrimitive,
    media_path: &Path,
    tags: &MetadataTags,
    min_ratio: f64,
    max_retries: u32,
    backoff: B,
) -> StepOutcome
where
    B: Fn(u32) -> Duration,
{
    let temp = remux::temp_sibling(media_path);
    if temp.exists() {
        debug!("Removing stale temp file: {}", temp.display());
        discard(&temp);
    }

    let orig_bytes = match fs::metadata(media_path) {
        Ok(m) => m.len(),
        Err(e) => return StepOutcome::Failed(format!("cannot stat {}: {}", media_path.display(), e)),
    };

    if let Err(e) = remuxer.remux(media_path, &temp, tags).await {
        warn!("Remux failed for {}: {:#}", media_path.display(), e);
        discard(&temp);
        return StepOutcome::Failed(format!("remux failed: {:#}", e));
    }

    let new_bytes = match fs::metadata(&temp) {
        Ok(m) => m.len(),
        Err(e) => {
            discard(&temp);
            return StepOutcome::Failed(format!("remux output missing: {}", e));
        }
    };

    // Size gate: a stream copy should be about the same size as its input
    if (new_bytes as f64) < orig_bytes as f64 * min_ratio {
        warn!(
            "Remux output rejected for {}: {} bytes vs original {} bytes (<{}%)",
            media_path.display(),
            new_bytes,
            orig_bytes,
            min_ratio * 100.0
        );
        discard(&temp);
        return StepOutcome::Failed("remux output below size threshold".to_string());
    }

    let replaced = retry::attempt(max_retries, backoff, |_| {
        let result = replacer.move_path(&temp, media_path);
        async move { result }
    })
    .await;

    match replaced {
        Ok(()) => {
            info!("Embedded metadata into {}", media_path.display());
            StepOutcome::Done
        }
        Err(e) => {
            warn!("Giving up replacing {} with remuxed file: {}", media_path.display(), e);
            discard(&temp);
            StepOutcome::Failed(format!("replace failed: {}", e))
        }
    }
}

fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete temp file {}: {}", temp.display(), e);
        }
    }
}

/// Set mtime of the media, its thumbnails and its directory to the upload date
fn normalize_timestamps(media_path: &Path, date: NaiveDate, video_id: &str) -> StepOutcome {
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return StepOutcome::Skipped("invalid upload date".to_string());
    };
    let mtime = FileTime::from_unix_time(midnight.and_utc().timestamp(), 0);

    let mut targets = vec![media_path.to_path_buf()];
    targets.extend(sidecar::thumbnail_paths(media_path));
    if let Some(dir) = media_path.parent() {
        targets.push(dir.to_path_buf());
    }

    let mut failures = 0;
    for target in &targets {
        if let Err(e) = filetime::set_file_mtime(target, mtime) {
            warn!("Video {}: failed to set mtime on {}: {}", video_id, target.display(), e);
            failures += 1;
        }
    }

    if failures == 0 {
        StepOutcome::Done
    } else {
        StepOutcome::Failed(format!("{}/{} targets failed", failures, targets.len()))
    }
}
