//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (PostgreSQL)
    pub database_url: String,

    /// Root directory all downloaded media lives under
    pub download_root: PathBuf,

    /// Top-level directory name for audio-only sources
    pub audio_dir_name: String,

    /// Top-level directory name for video sources
    pub video_dir_name: String,

    /// Default filename template applied to new sources
    pub default_media_template: String,

    /// Worker counts per task queue
    pub db_workers: usize,
    pub fs_workers: usize,
    pub net_workers: usize,
    pub limit_workers: usize,

    /// Days to keep task history rows before pruning
    pub task_history_days: i64,

    /// Maximum concurrent media file downloads
    pub max_download_slots: usize,

    /// Ordered English language codes used to break format ties
    pub english_language_codes: Vec<String>,

    /// Minimum height considered "HD" by the NextBestHd fallback
    pub hd_cutoff_height: i64,

    /// Minimum height any fallback candidate may have
    pub min_fallback_height: i64,

    /// Default sponsor-section categories for new sources
    pub sponsorblock_categories: Vec<String>,

    /// Re-download when a taller matching format appears later
    pub upgrade_resolution: bool,

    /// Allow rename tasks for every source
    pub rename_all_sources: bool,

    /// Allow rename tasks only for these source directories
    pub rename_source_dirs: Vec<String>,

    /// Strip unused fields from extractor metadata before storing
    pub shrink_metadata: bool,

    /// Path to the external extractor executable
    pub extractor_bin: String,

    /// Cache directory handed to the extractor tool
    pub extractor_cache_dir: PathBuf,

    /// Scratch directory for in-flight downloads
    pub temp_dir: PathBuf,

    /// Thumbnail bounds; larger remote images are scaled down
    pub thumbnail_max_width: u32,
    pub thumbnail_max_height: u32,

    /// Sentinel files whose presence signals the queues to shut down
    pub db_shutdown_sentinel: PathBuf,
    pub fs_shutdown_sentinel: PathBuf,
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;

        let download_root = PathBuf::from(
            env::var("DOWNLOAD_ROOT").unwrap_or_else(|_| "./data/downloads".to_string()),
        );

        Ok(Self {
            database_url,

            download_root,

            audio_dir_name: env::var("AUDIO_DIR_NAME").unwrap_or_else(|_| "audio".to_string()),

            video_dir_name: env::var("VIDEO_DIR_NAME").unwrap_or_else(|_| "video".to_string()),

            default_media_template: env::var("DEFAULT_MEDIA_TEMPLATE")
                .unwrap_or_else(|_| "{yyyy_mm_dd}_{source}_{title}_{key}_{format}.{ext}".to_string()),

            db_workers: env_usize("DB_WORKERS", 2),
            fs_workers: env_usize("FS_WORKERS", 2),
            net_workers: env_usize("NET_WORKERS", 4),
            limit_workers: env_usize("LIMIT_WORKERS", 1),

            task_history_days: env_i64("TASK_HISTORY_DAYS", 30),

            max_download_slots: env_usize("MAX_DOWNLOAD_SLOTS", 1),

            english_language_codes: env_list(
                "ENGLISH_LANGUAGE_CODES",
                &["en", "en-US", "en-GB", "en-CA", "en-AU"],
            ),

            hd_cutoff_height: env_i64("HD_CUTOFF_HEIGHT", 500),

            min_fallback_height: env_i64("MIN_FALLBACK_HEIGHT", 360),

            sponsorblock_categories: env_list("SPONSORBLOCK_CATEGORIES", &["sponsor"]),

            upgrade_resolution: env_bool("UPGRADE_RESOLUTION", false),

            rename_all_sources: env_bool("RENAME_ALL_SOURCES", false),

            rename_source_dirs: env_list("RENAME_SOURCE_DIRS", &[]),

            shrink_metadata: env_bool("SHRINK_METADATA", false),

            extractor_bin: env::var("EXTRACTOR_BIN").unwrap_or_else(|_| "yt-dlp".to_string()),

            extractor_cache_dir: PathBuf::from(
                env::var("EXTRACTOR_CACHE_DIR").unwrap_or_else(|_| "./data/cache".to_string()),
            ),

            temp_dir: PathBuf::from(
                env::var("TEMP_DIR").unwrap_or_else(|_| "./data/tmp".to_string()),
            ),

            thumbnail_max_width: env_usize("THUMBNAIL_MAX_WIDTH", 430) as u32,
            thumbnail_max_height: env_usize("THUMBNAIL_MAX_HEIGHT", 240) as u32,

            db_shutdown_sentinel: PathBuf::from(
                env::var("DB_SHUTDOWN_SENTINEL")
                    .unwrap_or_else(|_| "./data/run/db-queue.down".to_string()),
            ),
            fs_shutdown_sentinel: PathBuf::from(
                env::var("FS_SHUTDOWN_SENTINEL")
                    .unwrap_or_else(|_| "./data/run/fs-queue.down".to_string()),
            ),
        })
    }

    /// Whether rename tasks may run for a source directory
    pub fn rename_enabled_for(&self, directory: &str) -> bool {
        self.rename_all_sources || self.rename_source_dirs.iter().any(|d| d == directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_enabled_for() {
        let mut config = Config {
            database_url: String::new(),
            download_root: PathBuf::from("/tmp"),
            audio_dir_name: "audio".into(),
            video_dir_name: "video".into(),
            default_media_template: String::new(),
            db_workers: 1,
            fs_workers: 1,
            net_workers: 1,
            limit_workers: 1,
            task_history_days: 30,
            max_download_slots: 1,
            english_language_codes: vec![],
            hd_cutoff_height: 500,
            min_fallback_height: 360,
            sponsorblock_categories: vec![],
            upgrade_resolution: false,
            rename_all_sources: false,
            rename_source_dirs: vec!["some-channel".into()],
            shrink_metadata: false,
            extractor_bin: "yt-dlp".into(),
            extractor_cache_dir: PathBuf::from("/tmp"),
            temp_dir: PathBuf::from("/tmp"),
            thumbnail_max_width: 430,
            thumbnail_max_height: 240,
            db_shutdown_sentinel: PathBuf::from("/tmp/db.down"),
            fs_shutdown_sentinel: PathBuf::from("/tmp/fs.down"),
        };

        assert!(config.rename_enabled_for("some-channel"));
        assert!(!config.rename_enabled_for("other-channel"));

        config.rename_all_sources = true;
        assert!(config.rename_enabled_for("other-channel"));
    }
}
