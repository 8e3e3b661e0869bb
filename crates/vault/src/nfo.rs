use std::fs;
use std::path::Path;
use anyhow::{Context, Result};

use crate::sidecar::{self, Sidecar};

/// Writes companion metadata files for media servers
pub trait NfoWriter: Send + Sync {
    fn write(&self, media_path: &Path, video_id: &str, sidecar: &Sidecar) -> Result<()>;
}

/// Kodi/Jellyfin style `.nfo` next to the media file
#[derive(Debug, Default, Clone, Copy)]
pub struct KodiNfoWriter;

impl KodiNfoWriter {
    pub fn render(media_path: &Path, video_id: &str, sidecar: &Sidecar) -> String {
        let fallback = media_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(video_id);
        let title = sidecar.display_title().unwrap_or(fallback);

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<episodedetails>\n");
        push_element(&mut xml, "title", title);
        push_element(&mut xml, "showtitle", sidecar.channel_name());
        push_element(&mut xml, "studio", sidecar.channel_name());
        if let Some(plot) = sidecar.description.as_deref().filter(|d| !d.trim().is_empty()) {
            push_element(&mut xml, "plot", plot);
        }
        if let Some(date) = sidecar.upload_date() {
            let date = date.format("%Y-%m-%d").to_string();
            push_element(&mut xml, "aired", &date);
            push_element(&mut xml, "premiered", &date);
            push_element(&mut xml, "year", &date[..4]);
        }
        if let Some(minutes) = sidecar.duration.filter(|d| *d > 0.0).map(|d| (d / 60.0).round() as u64) {
            push_element(&mut xml, "runtime", &minutes.to_string());
        }
        for genre in sidecar.genres() {
            push_element(&mut xml, "genre", &genre);
        }
        xml.push_str(&format!("  <uniqueid type=\"youtube\" default=\"true\">{}</uniqueid>\n", escape(video_id)));
        xml.push_str("</episodedetails>\n");
        xml
    }
}

impl NfoWriter for KodiNfoWriter {
    fn write(&self, media_path: &Path, video_id: &str, sidecar: &Sidecar) -> Result<()> {
        let path = sidecar::nfo_path(media_path);
        fs::write(&path, Self::render(media_path, video_id, sidecar))
            .with_context(|| format!("Failed to write nfo: {}", path.display()))?;
        Ok(())
    }
}

fn push_element(xml: &mut String, name: &str, value: &str) {
    xml.push_str(&format!("  <{name}>{}</{name}>\n", escape(value)));
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Control characters are invalid in XML 1.0
            c if c.is_control() && c != '\n' && c != '\t' && c != '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_escapes_and_fields() {
        let sidecar: Sidecar = serde_json::from_str(
            r#"{"title":"Tom & Jerry <live>","channel":"Chan","upload_date":"20200102",
                "duration":361,"categories":["Comedy"]}"#,
        )
        .unwrap();
        let xml = KodiNfoWriter::render(Path::new("/v/x [id1].mp4"), "id1", &sidecar);
        assert!(xml.contains("<title>Tom &amp; Jerry &lt;live&gt;</title>"));
        assert!(xml.contains("<studio>Chan</studio>"));
        assert!(xml.contains("<aired>2020-01-02</aired>"));
        assert!(xml.contains("<year>2020</year>"));
        assert!(xml.contains("<runtime>6</runtime>"));
        assert!(xml.contains("<genre>Comedy</genre>"));
        assert!(xml.contains(">id1</uniqueid>"));
        assert!(!xml.contains("<plot>"));
    }

    #[test]
    fn test_write_next_to_media() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("Title [abc].mp4");
        KodiNfoWriter.write(&media, "abc", &Sidecar::default()).unwrap();
        let xml = fs::read_to_string(dir.path().join("Title [abc].nfo")).unwrap();
        assert!(xml.contains("<title>Title [abc]</title>"));
        assert!(xml.contains("<showtitle>Unknown Channel</showtitle>"));
    }
}
