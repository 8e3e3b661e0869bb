use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::sidecar::Sidecar;

/// Containers ffmpeg can rewrite with stream copy and global tags
pub const TAGGABLE_EXTENSIONS: &[&str] = &["mp4", "m4v", "mkv", "webm", "mov"];

/// iTunes-style media kind: 9 = movie. Plex/Jellyfin read it to pick a library agent.
const MEDIA_TYPE_HINT: &str = "9";

/// Container tags injected during the remux
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTags {
    pub title: String,
    pub channel: String,
    pub genres: Vec<String>,
    /// YYYY-MM-DD
    pub date: Option<String>,
    pub description: Option<String>,
}

impl MetadataTags {
    pub fn from_sidecar(sidecar: &Sidecar, fallback_title: &str) -> Self {
        let channel = sidecar.channel_name().to_string();
        let title = sidecar.display_title().unwrap_or(fallback_title);
        MetadataTags {
            title: format!("{} - {}", channel, title),
            channel,
            genres: sidecar.genres(),
            date: sidecar.upload_date().map(|d| d.format("%Y-%m-%d").to_string()),
            description: sidecar.description.clone().filter(|d| !d.trim().is_empty()),
        }
    }

    /// `key=value` pairs in the order they're passed to ffmpeg
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("title", self.title.clone())];
        if !self.genres.is_empty() {
            pairs.push(("genre", self.genres.join(";")));
        }
        for key in ["artist", "album_artist", "album", "studio"] {
            pairs.push((key, self.channel.clone()));
        }
        if let Some(date) = &self.date {
            pairs.push(("date", date.clone()));
        }
        if let Some(description) = &self.description {
            pairs.push(("description", description.clone()));
        }
        pairs.push(("media_type", MEDIA_TYPE_HINT.to_string()));
        pairs
    }
}

/// True if the container at `path` can carry the injected tags
pub fn is_taggable(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| TAGGABLE_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Temp sibling the remux writes into: `Title [id].mp4` -> `Title [id].vaultmeta.mp4`
pub fn temp_sibling(media_path: &Path) -> PathBuf {
    let ext = media_path.extension().and_then(|s| s.to_str()).unwrap_or("mkv");
    media_path.with_extension(format!("vaultmeta.{}", ext))
}

/// Lossless container rewrite that injects metadata tags
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn remux(&self, input: &Path, output: &Path, tags: &MetadataTags) -> Result<()>;
}

/// Remuxer backed by an ffmpeg subprocess
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    pub ffmpeg_bin: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        FfmpegRemuxer { ffmpeg_bin: ffmpeg_bin.into() }
    }

    /// Build ffmpeg arguments for a stream-copy remux with tags
    pub fn build_args(input: &Path, output: &Path, tags: &MetadataTags) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            // Keep every stream, no re-encode
            "-map".to_string(),
            "0".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
        ];

        for (key, value) in tags.to_pairs() {
            args.push("-metadata".to_string());
            args.push(format!("{}={}", key, value));
        }

        let ext = output.extension().and_then(|s| s.to_str()).unwrap_or("").to_lowercase();
        if matches!(ext.as_str(), "mp4" | "m4v" | "mov") {
            args.push("-movflags".to_string());
            args.push("+faststart+use_metadata_tags".to_string());
        }

        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, input: &Path, output: &Path, tags: &MetadataTags) -> Result<()> {
        let args = Self::build_args(input, output, tags);
        debug!("ffmpeg remux: {} {:?}", self.ffmpeg_bin.display(), args);

        let output_res = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to execute ffmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output_res.status.success() {
            let stderr = String::from_utf8_lossy(&output_res.stderr);
            return Err(anyhow!(
                "ffmpeg remux failed (exit code {}) for {}:\nSTDERR: {}",
                output_res.status.code().unwrap_or(-1),
                input.display(),
                stderr
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sidecar() -> Sidecar {
        serde_json::from_str(
            r#"{"id":"abc","title":"Short","fulltitle":"Full Title","uploader":"Chan",
                "upload_date":"20230704","categories":["Music"],"tags":["live","Music"],
                "description":""}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_tags_from_sidecar() {
        let tags = MetadataTags::from_sidecar(&sample_sidecar(), "fallback");
        assert_eq!(tags.title, "Chan - Full Title");
        assert_eq!(tags.channel, "Chan");
        assert_eq!(tags.genres, vec!["Music", "live"]);
        assert_eq!(tags.date.as_deref(), Some("2023-07-04"));
        assert_eq!(tags.description, None);

        let pairs = tags.to_pairs();
        assert!(pairs.contains(&("genre", "Music;live".to_string())));
        assert!(pairs.contains(&("studio", "Chan".to_string())));
        assert!(pairs.contains(&("album", "Chan".to_string())));
        assert!(pairs.contains(&("media_type", "9".to_string())));
    }

    #[test]
    fn test_fallback_title() {
        let tags = MetadataTags::from_sidecar(&Sidecar::default(), "From File");
        assert_eq!(tags.title, "Unknown Channel - From File");
        assert!(tags.date.is_none());
        assert!(!tags.to_pairs().iter().any(|(k, _)| *k == "genre"));
    }

    #[test]
    fn test_build_args() {
        let tags = MetadataTags::from_sidecar(&sample_sidecar(), "x");
        let args = FfmpegRemuxer::build_args(Path::new("/v/a.mp4"), Path::new("/v/a.vaultmeta.mp4"), &tags);
        assert_eq!(args.last().map(String::as_str), Some("/v/a.vaultmeta.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-metadata" && w[1] == "date=2023-07-04"));
        assert!(args.iter().any(|a| a.starts_with("+faststart")));

        let mkv = FfmpegRemuxer::build_args(Path::new("/v/a.mkv"), Path::new("/v/a.vaultmeta.mkv"), &tags);
        assert!(!mkv.iter().any(|a| a == "-movflags"));
    }

    #[test]
    fn test_temp_sibling_and_taggable() {
        assert_eq!(temp_sibling(Path::new("/v/T [a].mp4")), PathBuf::from("/v/T [a].vaultmeta.mp4"));
        assert!(is_taggable(Path::new("/v/a.MKV")));
        assert!(!is_taggable(Path::new("/v/a.avi")));
        assert!(!is_taggable(Path::new("/v/noext")));
    }
}
