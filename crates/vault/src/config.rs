use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retention::RetentionRequest;

/// Configuration shared by the finalizer and the retention tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Whether downloads land in a staging area before moving to the library
    pub staging_enabled: bool,
    /// Root of the staging area (fast local disk)
    pub staging_root: PathBuf,
    /// Root of the permanent library
    pub final_root: PathBuf,
    /// Path to the download archive ledger
    pub ledger_path: PathBuf,
    /// Directory where finalized sidecars are kept as `{video_id}.info.json`
    pub sidecar_dir: PathBuf,
    /// Directory holding job ledger rows
    pub job_state_dir: PathBuf,
    /// Embed extended metadata into the media container
    pub embed_metadata: bool,
    /// Write a companion .nfo file next to each video
    pub write_nfo: bool,
    /// Path to ffmpeg binary used for remuxing
    pub ffmpeg_bin: PathBuf,
    /// Minimum size ratio for accepting remuxed output (e.g., 0.90 = 90% of original)
    pub min_remux_ratio: f64,
    /// Extra attempts when replacing a busy file
    pub replace_retries: u32,
    /// Base backoff in milliseconds, doubled on every attempt
    pub replace_backoff_ms: u64,
    /// Default retention policy
    pub retention: RetentionRequest,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl VaultConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            staging_enabled: false,
            staging_root: PathBuf::from("/data/staging"),
            final_root: PathBuf::from("/data/videos"),
            ledger_path: PathBuf::from("/config/archive.txt"),
            sidecar_dir: PathBuf::from("/config/sidecars"),
            job_state_dir: PathBuf::from("/config/jobs"),
            embed_metadata: true,
            write_nfo: true,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            min_remux_ratio: 0.90,
            replace_retries: 5,
            replace_backoff_ms: 200,
            retention: RetentionRequest::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Base delay for the replace retry loop
    pub fn replace_backoff(&self) -> Duration {
        Duration::from_millis(self.replace_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = VaultConfig::load_config(Some(Path::new("/nonexistent/vault.toml"))).unwrap();
        assert_eq!(cfg.replace_retries, 5);
        assert_eq!(cfg.replace_backoff(), Duration::from_millis(200));
        assert!((cfg.min_remux_ratio - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.toml");
        std::fs::write(
            &path,
            "staging_enabled = true\nstaging_root = \"/fast\"\n\n[retention]\nenabled = true\nageThresholdDays = 30\n",
        )
        .unwrap();

        let cfg = VaultConfig::load_config(Some(&path)).unwrap();
        assert!(cfg.staging_enabled);
        assert_eq!(cfg.staging_root, PathBuf::from("/fast"));
        assert_eq!(cfg.final_root, PathBuf::from("/data/videos"));
        assert_eq!(cfg.retention.age_threshold_days, Some(30.0));
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, r#"{"write_nfo": false, "retention": {"enabled": true, "spaceThreshold": "10GB"}}"#).unwrap();

        let cfg = VaultConfig::load_config(Some(&path)).unwrap();
        assert!(!cfg.write_nfo);
        assert_eq!(cfg.retention.space_threshold.as_deref(), Some("10GB"));
    }
}
