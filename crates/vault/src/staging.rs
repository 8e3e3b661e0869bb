use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::VaultConfig;
use crate::retry;

/// Retries for a busy move, after the first attempt
const MOVE_RETRIES: u32 = 5;
const MOVE_BACKOFF: Duration = Duration::from_millis(200);

/// Result of a relocation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateOutcome {
    pub success: bool,
    /// Where the relocated path lives (or would have lived) in the final tree
    pub final_path: PathBuf,
    pub error: Option<String>,
}

impl RelocateOutcome {
    fn failed(final_path: PathBuf, error: impl Into<String>) -> Self {
        RelocateOutcome { success: false, final_path, error: Some(error.into()) }
    }
}

/// Primitive that physically moves a file or directory tree.
/// This is the only thing allowed to make the source disappear.
pub trait MovePrimitive: Send + Sync {
    fn move_path(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Filesystem move: rename, merging into an existing destination directory,
/// with a copy-then-remove fallback when crossing filesystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMove;

impl MovePrimitive for FsMove {
    fn move_path(&self, from: &Path, to: &Path) -> io::Result<()> {
        if from.is_dir() && to.is_dir() {
            return merge_dir(from, to);
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!("rename crosses filesystems, copying {} -> {}", from.display(), to.display());
                copy_then_remove(from, to)
            }
            Err(e) => Err(e),
        }
    }
}

/// Move every entry of `from` into the existing directory `to`, replacing same-named files
fn merge_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_file() && target.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("cannot replace directory {} with a file", target.display()),
            ));
        }
        FsMove.move_path(&entry.path(), &target)?;
    }
    fs::remove_dir(from)
}

/// Copy the whole tree first, only then remove the source
fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        fs::copy(from, to)?;
        return fs::remove_file(from);
    }

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    fs::remove_dir_all(from)
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV
    e.raw_os_error() == Some(18)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Maps paths between the staging and final trees and performs verified moves
pub struct StagingTranslator {
    enabled: bool,
    staging_root: PathBuf,
    final_root: PathBuf,
    mover: Box<dyn MovePrimitive>,
    backoff: Duration,
}

impl StagingTranslator {
    /// Create a translator using the real filesystem move
    pub fn new(enabled: bool, staging_root: impl Into<PathBuf>, final_root: impl Into<PathBuf>) -> Self {
        Self::with_mover(enabled, staging_root, final_root, Box::new(FsMove))
    }

    /// Create a translator with a custom move primitive
    pub fn with_mover(
        enabled: bool,
        staging_root: impl Into<PathBuf>,
        final_root: impl Into<PathBuf>,
        mover: Box<dyn MovePrimitive>,
    ) -> Self {
        StagingTranslator {
            enabled,
            staging_root: staging_root.into(),
            final_root: final_root.into(),
            mover,
            backoff: MOVE_BACKOFF,
        }
    }

    pub fn from_config(cfg: &VaultConfig) -> Self {
        Self::new(cfg.staging_enabled, &cfg.staging_root, &cfg.final_root)
    }

    /// Override the base backoff between move attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True if staging is enabled and `path` lies under the staging root
    pub fn is_staging_path(&self, path: &Path) -> bool {
        self.enabled && path.starts_with(&self.staging_root)
    }

    /// Swap the staging root for the final root. Paths outside staging are returned unchanged.
    pub fn to_final_path(&self, path: &Path) -> PathBuf {
        swap_root(path, &self.staging_root, &self.final_root)
    }

    /// Swap the final root for the staging root. Paths outside the library are returned unchanged.
    pub fn to_staging_path(&self, path: &Path) -> PathBuf {
        swap_root(path, &self.final_root, &self.staging_root)
    }

    /// Move `path` into the final tree. A file path moves its whole parent directory.
    ///
    /// The source is never removed here; only the move primitive can make it
    /// disappear, so a failed verification leaves both sides inspectable.
    pub async fn relocate(&self, path: &Path, final_override: Option<&Path>) -> RelocateOutcome {
        let is_file = path.is_file();
        let source_dir = if is_file {
            match path.parent() {
                Some(p) => p.to_path_buf(),
                None => return RelocateOutcome::failed(path.to_path_buf(), "path has no parent directory"),
            }
        } else {
            path.to_path_buf()
        };

        let dest_dir = final_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.to_final_path(&source_dir));
        let final_path = match (is_file, path.file_name()) {
            (true, Some(name)) => dest_dir.join(name),
            _ => dest_dir.clone(),
        };

        if !path.exists() {
            warn!("Relocation source does not exist: {}", path.display());
            return RelocateOutcome::failed(final_path, format!("source does not exist: {}", path.display()));
        }

        if dest_dir == source_dir {
            debug!("Source already at destination: {}", source_dir.display());
            return RelocateOutcome { success: true, final_path, error: None };
        }

        if let Err(e) = ensure_parent(&dest_dir) {
            error!("Failed to prepare destination for {}: {:#}", source_dir.display(), e);
            return RelocateOutcome::failed(final_path, format!("{:#}", e));
        }

        info!("Relocating {} -> {}", source_dir.display(), dest_dir.display());
        let moved = retry::attempt(MOVE_RETRIES, retry::exponential(self.backoff), |_| {
            let result = self.mover.move_path(&source_dir, &dest_dir);
            async move { result }
        })
        .await;

        if let Err(e) = moved {
            error!("Move failed {} -> {}: {}", source_dir.display(), dest_dir.display(), e);
            return RelocateOutcome::failed(final_path, format!("move failed: {}", e));
        }

        // Re-verify both the directory and the media inside it
        if !dest_dir.exists() || !final_path.exists() {
            error!("Relocation verification failed, destination missing: {}", final_path.display());
            return RelocateOutcome::failed(
                final_path.clone(),
                format!("destination missing after move: {}", final_path.display()),
            );
        }

        info!("✅ Relocated to {}", final_path.display());
        RelocateOutcome { success: true, final_path, error: None }
    }
}

fn swap_root(path: &Path, from_root: &Path, to_root: &Path) -> PathBuf {
    match path.strip_prefix(from_root) {
        Ok(rest) if rest.as_os_str().is_empty() => to_root.to_path_buf(),
        Ok(rest) => to_root.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn ensure_parent(dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create destination parent: {}", parent.display()))?;
    }
    Ok(())
}
