//! Sidecar file writers
//!
//! A downloaded media file owns sidecars sharing its stem: a JPEG
//! thumbnail copy, an NFO document, and a JSON metadata dump.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use super::file_stem;

/// Sidecar paths derived from a media file path
#[derive(Debug, Clone)]
pub struct SidecarPaths {
    pub thumbnail: PathBuf,
    pub nfo: PathBuf,
    pub json: PathBuf,
}

impl SidecarPaths {
    pub fn for_media_file(media_path: &Path) -> Self {
        let parent = media_path.parent().unwrap_or_else(|| Path::new(""));
        let stem = file_stem(media_path);
        Self {
            thumbnail: parent.join(format!("{stem}.jpg")),
            nfo: parent.join(format!("{stem}.nfo")),
            json: parent.join(format!("{stem}.info.json")),
        }
    }
}

/// Write the stored thumbnail blob next to the media file
pub async fn copy_thumbnail(media_path: &Path, image: &[u8]) -> Result<PathBuf> {
    let paths = SidecarPaths::for_media_file(media_path);
    tokio::fs::write(&paths.thumbnail, image)
        .await
        .context("Failed to write thumbnail sidecar")?;
    info!(path = %paths.thumbnail.display(), "Wrote thumbnail sidecar");
    Ok(paths.thumbnail)
}

/// Write the NFO document next to the media file
pub async fn write_nfo(media_path: &Path, nfo_xml: &str) -> Result<PathBuf> {
    let paths = SidecarPaths::for_media_file(media_path);
    tokio::fs::write(&paths.nfo, nfo_xml)
        .await
        .context("Failed to write NFO sidecar")?;
    info!(path = %paths.nfo.display(), "Wrote NFO sidecar");
    Ok(paths.nfo)
}

/// Write the metadata dump, formats inlined, next to the media file
pub async fn write_json(media_path: &Path, metadata: &Value) -> Result<PathBuf> {
    let paths = SidecarPaths::for_media_file(media_path);
    let body = serde_json::to_string_pretty(metadata)?;
    tokio::fs::write(&paths.json, body)
        .await
        .context("Failed to write JSON sidecar")?;
    info!(path = %paths.json.display(), "Wrote JSON sidecar");
    Ok(paths.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sidecar_paths_share_stem() {
        let paths = SidecarPaths::for_media_file(Path::new("/data/chan/2017/foo.mkv"));
        assert_eq!(paths.thumbnail, Path::new("/data/chan/2017/foo.jpg"));
        assert_eq!(paths.nfo, Path::new("/data/chan/2017/foo.nfo"));
        assert_eq!(paths.json, Path::new("/data/chan/2017/foo.info.json"));
    }

    #[tokio::test]
    async fn test_write_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let media = tmp.path().join("video.mkv");
        tokio::fs::write(&media, b"v").await.unwrap();

        copy_thumbnail(&media, b"jpegdata").await.unwrap();
        write_nfo(&media, "<episodedetails/>").await.unwrap();
        write_json(&media, &json!({"id": "abc"})).await.unwrap();

        assert!(tmp.path().join("video.jpg").exists());
        assert!(tmp.path().join("video.nfo").exists());
        let body = tokio::fs::read_to_string(tmp.path().join("video.info.json"))
            .await
            .unwrap();
        assert!(body.contains("\"id\""));
    }
}
