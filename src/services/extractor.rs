//! Extractor gateway
//!
//! Wraps the external metadata/download tool (yt-dlp) behind a small
//! interface. Runs it as a child process, normalizes its JSON output, and
//! owns the translation of its opaque error strings into the core's error
//! taxonomy; nothing outside this module inspects tool output.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{SourceKind, SourceRecord};
use crate::errors::TaskError;
use crate::services::events::{DownloadEvent, DownloadEventBus};

/// One entry from a source listing
#[derive(Debug, Clone)]
pub struct RawItem {
    pub remote_key: String,
    pub title: String,
    pub duration: Option<i32>,
    pub timestamp: Option<i64>,
    /// Extractor name for the entry, e.g. "Youtube"
    pub site: Option<String>,
    /// The raw entry with null values stripped
    pub value: Value,
}

impl RawItem {
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }
}

/// Options forwarded to the tool for one download
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub write_subtitles: bool,
    pub auto_subtitles: bool,
    pub sub_langs: String,
    pub sponsorblock_categories: Vec<String>,
}

/// Gateway to the external extractor executable
pub struct ExtractorService {
    bin: String,
    cache_dir: PathBuf,
    temp_dir: PathBuf,
    events: DownloadEventBus,
}

impl ExtractorService {
    pub fn new(bin: String, cache_dir: PathBuf, temp_dir: PathBuf, events: DownloadEventBus) -> Self {
        Self {
            bin,
            cache_dir,
            temp_dir,
            events,
        }
    }

    /// Public page URL for a source
    pub fn source_url(source: &SourceRecord) -> String {
        match source.kind() {
            SourceKind::Channel => format!("https://www.youtube.com/{}", source.key),
            SourceKind::ChannelId => {
                format!("https://www.youtube.com/channel/{}", source.key)
            }
            SourceKind::Playlist => {
                format!("https://www.youtube.com/playlist?list={}", source.key)
            }
        }
    }

    /// Public page URL for a media item
    pub fn media_url(remote_key: &str) -> String {
        format!("https://www.youtube.com/watch?v={remote_key}")
    }

    /// Listing URL for one tab of a channel source
    fn index_url(source: &SourceRecord, tab: &str) -> String {
        match source.kind() {
            SourceKind::Playlist => Self::source_url(source),
            _ => format!("{}/{tab}", Self::source_url(source)),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--no-warnings")
            .arg("--ignore-no-formats-error")
            .arg("--cache-dir")
            .arg(&self.cache_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Enumerate the media items currently available from a source.
    ///
    /// Channels are read tab by tab (videos and/or streams per the source
    /// flags); playlists are read directly. Nested playlists are flattened
    /// and each remote key is yielded at most once across the whole run.
    pub async fn list_items(&self, source: &SourceRecord) -> Result<Vec<RawItem>, TaskError> {
        let mut tabs = Vec::new();
        if source.is_playlist() {
            tabs.push("videos");
        } else {
            if source.index_videos {
                tabs.push("videos");
            }
            if source.index_streams {
                tabs.push("streams");
            }
        }

        let since = source
            .download_cap_date(Utc::now())
            .map(|date| date.format("%Y%m%d").to_string());

        let mut seen: HashSet<String> = HashSet::new();
        let mut items = Vec::new();
        for tab in tabs {
            let url = Self::index_url(source, tab);
            info!(source_id = %source.id, url = %url, "Indexing source listing");

            let mut cmd = self.base_command();
            cmd.arg("--dump-single-json")
                .arg("--flat-playlist")
                .arg("--skip-download");
            if let Some(after) = &since {
                cmd.arg("--dateafter").arg(after);
            }
            cmd.arg(&url);

            let output = cmd
                .output()
                .await
                .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to run extractor")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                // A missing streams tab is not a failure of the whole source
                if tab == "streams" && stderr.contains("tab") {
                    debug!(source_id = %source.id, "Source has no streams tab");
                    continue;
                }
                return Err(classify_tool_error(&stderr, None));
            }

            let listing: Value = serde_json::from_slice(&output.stdout)
                .map_err(|e| TaskError::transient(anyhow!(e).context("Extractor returned invalid JSON")))?;
            flatten_entries(&listing, &mut seen, &mut items);
        }

        if items.is_empty() {
            return Err(TaskError::NoMedia);
        }
        info!(source_id = %source.id, count = items.len(), "Listed source media");
        Ok(items)
    }

    /// Fetch the full metadata for one media item, formats included.
    ///
    /// Members-only style rejections are retried once with relaxed player
    /// options; whatever that attempt returns is the final answer.
    pub async fn fetch_media_details(&self, url: &str) -> Result<Value, TaskError> {
        match self.fetch_details_inner(url, false).await {
            Ok(value) => Ok(value),
            Err(TaskError::Permanent(err)) if is_members_only_message(&err.to_string()) => {
                warn!(url = %url, "Media looks members-only, retrying with relaxed options");
                self.fetch_details_inner(url, true).await
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_details_inner(&self, url: &str, relaxed: bool) -> Result<Value, TaskError> {
        let mut cmd = self.base_command();
        cmd.arg("--dump-single-json").arg("--skip-download");
        if relaxed {
            cmd.arg("--extractor-args").arg("youtube:player-client=all");
        }
        cmd.arg(url);

        let output = cmd
            .output()
            .await
            .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to run extractor")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_tool_error(&stderr, None));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| TaskError::transient(anyhow!(e).context("Extractor returned invalid JSON")))
    }

    /// Download one media item to `output_path`.
    ///
    /// The tool writes into a per-download temp directory; the finished
    /// file is renamed into place so observers never see partials. Progress
    /// and post-processing are emitted on the event bus. Returns the format
    /// selector used and the container extension produced.
    pub async fn download(
        &self,
        url: &str,
        remote_key: &str,
        format_selector: &str,
        container: &str,
        output_path: &Path,
        options: &DownloadOptions,
    ) -> Result<(String, String), TaskError> {
        let work_dir = self.temp_dir.join(format!("download_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to create download temp dir")))?;

        let file_name = output_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TaskError::permanent(anyhow!("download target has no file name")))?;
        let temp_target = work_dir.join(file_name);

        let mut cmd = self.base_command();
        cmd.arg("-f")
            .arg(format_selector)
            .arg("--merge-output-format")
            .arg(container)
            .arg("--newline")
            .arg("--progress-template")
            .arg("download:progress %(progress._percent_str)s eta %(progress._eta_str)s")
            .arg("-o")
            .arg(&temp_target);
        if options.embed_metadata {
            cmd.arg("--embed-metadata");
        }
        if options.embed_thumbnail {
            cmd.arg("--embed-thumbnail");
        }
        if options.write_subtitles {
            cmd.arg("--write-subs");
        }
        if options.auto_subtitles {
            cmd.arg("--write-auto-subs");
        }
        if options.write_subtitles || options.auto_subtitles {
            cmd.arg("--sub-langs").arg(&options.sub_langs);
        }
        if !options.sponsorblock_categories.is_empty() {
            cmd.arg("--sponsorblock-remove")
                .arg(options.sponsorblock_categories.join(","));
        }
        cmd.arg(url);

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to spawn extractor")))?;

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            let key = remote_key.to_string();
            tokio::spawn(async move {
                forward_progress(stdout, key, events).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskError::transient(anyhow!(e).context("Extractor process failed")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&work_dir).await;
            return Err(classify_tool_error(&stderr, Some(format_selector)));
        }

        // The tool may have remuxed to a different container than asked
        let produced = find_produced_file(&work_dir, &temp_target).await;
        let Some(produced) = produced else {
            let _ = tokio::fs::remove_dir_all(&work_dir).await;
            return Err(TaskError::DownloadIncomplete);
        };

        let container_used = produced
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(container)
            .to_string();
        let final_path = output_path.with_extension(&container_used);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to create target directory")))?;
        }
        tokio::fs::rename(&produced, &final_path)
            .await
            .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to move download into place")))?;
        let _ = tokio::fs::remove_dir_all(&work_dir).await;

        self.events.emit(DownloadEvent::Finished {
            remote_key: remote_key.to_string(),
        });
        info!(path = %final_path.display(), "Download complete");

        Ok((format_selector.to_string(), container_used))
    }

}

/// Read tool stdout, emitting progress at 5% steps and typed
/// post-processing events for stage markers.
async fn forward_progress(
    stdout: tokio::process::ChildStdout,
    remote_key: String,
    events: DownloadEventBus,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut last_percent = 0u8;
    let mut current_stage: Option<String> = None;
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(rest) = line.strip_prefix("progress ") {
            let mut parts = rest.split(" eta ");
            let percent = parts
                .next()
                .map(str::trim)
                .and_then(|p| p.strip_suffix('%'))
                .and_then(|p| p.trim().parse::<f64>().ok())
                .map(|p| p.round() as u8);
            let eta = parts.next().map(|s| s.trim().to_string());
            if let Some(percent) = percent {
                if percent >= last_percent.saturating_add(5) || (percent == 100 && last_percent != 100)
                {
                    last_percent = percent;
                    events.emit(DownloadEvent::Progress {
                        remote_key: remote_key.clone(),
                        percent,
                        eta,
                    });
                }
            }
        } else if let Some(stage) = parse_postprocessor_stage(&line) {
            match &current_stage {
                Some(current) if *current == stage => {
                    events.emit(DownloadEvent::PostProcessing {
                        remote_key: remote_key.clone(),
                        stage,
                    });
                }
                other => {
                    if let Some(previous) = other.clone() {
                        events.emit(DownloadEvent::PostProcessFinished {
                            remote_key: remote_key.clone(),
                            stage: previous,
                        });
                    }
                    events.emit(DownloadEvent::PostProcessStart {
                        remote_key: remote_key.clone(),
                        stage: stage.clone(),
                    });
                    current_stage = Some(stage);
                }
            }
        }
    }
    if let Some(stage) = current_stage {
        events.emit(DownloadEvent::PostProcessFinished {
            remote_key: remote_key.clone(),
            stage,
        });
    }
}

/// "[Merger] Merging formats into ..." → "Merger"
fn parse_postprocessor_stage(line: &str) -> Option<String> {
    let rest = line.strip_prefix('[')?;
    let (stage, _) = rest.split_once(']')?;
    // download/info lines are not post-processing stages
    if stage.eq_ignore_ascii_case("download") || stage.eq_ignore_ascii_case("info") {
        return None;
    }
    if stage.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(stage.to_string())
    } else {
        None
    }
}

/// Recursively flatten playlist entries, yielding each key at most once
fn flatten_entries(listing: &Value, seen: &mut HashSet<String>, items: &mut Vec<RawItem>) {
    let Some(entries) = listing.get("entries").and_then(|e| e.as_array()) else {
        return;
    };
    for entry in entries {
        if entry.get("entries").is_some() {
            flatten_entries(entry, seen, items);
            continue;
        }
        let key = entry
            .get("id")
            .or_else(|| entry.get("display_id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        let value = strip_nulls(entry);
        items.push(RawItem {
            remote_key: key,
            title: entry
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            duration: entry
                .get("duration")
                .and_then(|v| v.as_f64())
                .map(|d| d as i32),
            timestamp: entry.get("timestamp").and_then(|v| v.as_i64()),
            site: entry
                .get("ie_key")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            value,
        });
    }
}

fn strip_nulls(entry: &Value) -> Value {
    match entry.as_object() {
        Some(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => entry.clone(),
    }
}

/// The produced file: the exact temp target, or the single file the tool
/// left in the work dir after remuxing to another extension.
async fn find_produced_file(work_dir: &Path, temp_target: &Path) -> Option<PathBuf> {
    if tokio::fs::try_exists(temp_target).await.unwrap_or(false) {
        return Some(temp_target.to_path_buf());
    }
    let mut entries = tokio::fs::read_dir(work_dir).await.ok()?;
    let mut produced = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        // ignore the tool's partial artifacts
        let name = entry.file_name().to_string_lossy().to_string();
        if is_file && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            produced = Some(entry.path());
        }
    }
    produced
}

fn is_members_only_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("members-only")
        || lower.contains("members only")
        || lower.contains("subscriber")
        || lower.contains("join this channel")
}

static PREMIERE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Premieres in (\d+) (minutes?|hours?|days?)").unwrap());

/// Parse "Premieres in N minutes/hours/days" into an estimated timestamp
fn parse_premiere_eta(message: &str) -> Option<DateTime<Utc>> {
    let captures = PREMIERE_RE.captures(message)?;
    let number: i64 = captures.get(1)?.as_str().parse().ok()?;
    let now = Utc::now();
    match captures.get(2)?.as_str() {
        "minute" | "minutes" => Some(now + Duration::minutes(number)),
        "hour" | "hours" => Some(now + Duration::hours(number)),
        "day" | "days" => Some(now + Duration::days(number)),
        _ => None,
    }
}

/// Translate a tool error message into the core taxonomy.
///
/// This is the only place upstream error strings are inspected.
fn classify_tool_error(stderr: &str, format_selector: Option<&str>) -> TaskError {
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429") || lower.contains("too many requests") {
        return TaskError::RateLimited;
    }
    if let Some(eta) = parse_premiere_eta(stderr) {
        return TaskError::Premiere(eta);
    }
    if lower.contains("this live event will begin in") {
        return TaskError::Premiere(Utc::now() + Duration::hours(1));
    }
    if lower.contains("requested format is not available")
        || lower.contains("format is not available")
    {
        return match format_selector {
            Some(format_id) => TaskError::FormatUnavailable {
                format_id: format_id.to_string(),
                cause: first_line(stderr),
            },
            None => TaskError::NoFormat,
        };
    }
    if lower.contains("no video formats") || lower.contains("no formats found") {
        return TaskError::NoFormat;
    }
    if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
        || lower.contains("account associated with this video has been terminated")
        || is_members_only_message(&lower)
    {
        return TaskError::Permanent(anyhow!("{}", first_line(stderr)));
    }
    if lower.contains("timed out")
        || lower.contains("connection re")
        || lower.contains("temporary failure")
        || lower.contains("http error 5")
    {
        return TaskError::Transient(anyhow!("{}", first_line(stderr)));
    }

    TaskError::Transient(anyhow!("{}", first_line(stderr)))
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown extractor error")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_classify_rate_limited() {
        let err = classify_tool_error("ERROR: HTTP Error 429: Too Many Requests", None);
        assert_matches!(err, TaskError::RateLimited);
    }

    #[test]
    fn test_classify_premiere() {
        let err = classify_tool_error("ERROR: [youtube] abc: Premieres in 5 hours", None);
        let TaskError::Premiere(eta) = err else {
            panic!("expected premiere");
        };
        let delta = eta - Utc::now();
        assert!(delta > Duration::hours(4) && delta <= Duration::hours(5));
    }

    #[test]
    fn test_classify_format_unavailable() {
        let err = classify_tool_error(
            "ERROR: [youtube] abc: Requested format is not available",
            Some("248+251"),
        );
        assert_matches!(err, TaskError::FormatUnavailable { ref format_id, .. } if format_id == "248+251");

        let err = classify_tool_error("ERROR: Requested format is not available", None);
        assert_matches!(err, TaskError::NoFormat);
    }

    #[test]
    fn test_classify_permanent_and_transient() {
        assert_matches!(
            classify_tool_error("ERROR: Video unavailable", None),
            TaskError::Permanent(_)
        );
        assert_matches!(
            classify_tool_error("ERROR: unable to download: timed out", None),
            TaskError::Transient(_)
        );
        assert_matches!(
            classify_tool_error("something inexplicable", None),
            TaskError::Transient(_)
        );
    }

    #[test]
    fn test_flatten_nested_entries_dedupes() {
        let listing = json!({
            "entries": [
                {"id": "a", "title": "A", "duration": 10.0, "timestamp": 1000, "ie_key": "Youtube"},
                {"entries": [
                    {"id": "b", "title": "B"},
                    {"id": "a", "title": "A again"},
                ]},
                {"id": "", "title": "no key"},
                {"id": "c", "title": "C", "extra": null},
            ]
        });

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        flatten_entries(&listing, &mut seen, &mut items);

        let keys: Vec<&str> = items.iter().map(|i| i.remote_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(items[0].duration, Some(10));
        assert_eq!(items[0].site.as_deref(), Some("Youtube"));
        // nulls are stripped from the stored value
        assert!(items[2].value.get("extra").is_none());
    }

    #[test]
    fn test_source_urls() {
        let mut source = sample_source();
        assert_eq!(
            ExtractorService::source_url(&source),
            "https://www.youtube.com/somechannel"
        );
        source.source_kind = "channel_id".into();
        assert_eq!(
            ExtractorService::source_url(&source),
            "https://www.youtube.com/channel/somechannel"
        );
        source.source_kind = "playlist".into();
        assert_eq!(
            ExtractorService::source_url(&source),
            "https://www.youtube.com/playlist?list=somechannel"
        );
        assert_eq!(
            ExtractorService::media_url("abc"),
            "https://www.youtube.com/watch?v=abc"
        );
    }

    #[test]
    fn test_parse_postprocessor_stage() {
        assert_eq!(
            parse_postprocessor_stage("[Merger] Merging formats into \"x.mkv\""),
            Some("Merger".to_string())
        );
        assert_eq!(parse_postprocessor_stage("[download] 42%"), None);
        assert_eq!(parse_postprocessor_stage("plain line"), None);
    }

    fn sample_source() -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
            source_kind: "channel".into(),
            key: "somechannel".into(),
            name: "Some Channel".into(),
            directory: "some-channel".into(),
            media_template: "{key}.{ext}".into(),
            resolution: "1080p".into(),
            video_codec: "VP9".into(),
            audio_codec: "OPUS".into(),
            prefer_60fps: false,
            prefer_hdr: false,
            fallback: "fail".into(),
            index_cadence_secs: 86400,
            target_schedule: Utc::now(),
            download_enabled: true,
            index_videos: true,
            index_streams: false,
            download_cap_secs: 0,
            delete_old: false,
            days_to_keep: 14,
            filter_regex: String::new(),
            filter_invert: false,
            filter_seconds: 0,
            filter_seconds_min: true,
            delete_removed_on_disk: true,
            delete_removed_from_source: false,
            copy_thumbnails: false,
            write_nfo: false,
            write_json: false,
            embed_metadata: false,
            embed_thumbnail: false,
            write_subtitles: false,
            auto_subtitles: false,
            sub_langs: "en".into(),
            sponsorblock_enabled: false,
            sponsorblock_categories: "sponsor".into(),
            has_failed: false,
            last_crawl_at: None,
            created_at: Utc::now(),
        }
    }
}
