//! Filename and path templating
//!
//! Renders a source's media template into a relative path, validates
//! templates before they are persisted, and keeps every rendered path
//! inside the configured download root.

pub mod nfo;
pub mod rename;
pub mod sidecars;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Utc};

use crate::config::Config;
use crate::db::{MediaRecord, SourceRecord};
use crate::matching::ParsedFormat;

/// Placeholder names a media template may reference
pub const TEMPLATE_VARS: &[&str] = &[
    "yyyymmdd",
    "yyyy_mm_dd",
    "yyyy",
    "mm",
    "dd",
    "source",
    "source_full",
    "uploader",
    "title",
    "title_full",
    "key",
    "format",
    "playlist_title",
    "video_order",
    "ext",
    "resolution",
    "height",
    "width",
    "vcodec",
    "acodec",
    "fps",
    "hdr",
];

/// Render a `{placeholder}` template against a variable map.
/// Unknown placeholders and unbalanced braces are errors.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    bail!("unbalanced '{{' in template");
                }
                match vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => bail!("unknown template placeholder {{{name}}}"),
                }
            }
            '}' => bail!("unbalanced '}}' in template"),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Slug form used for the `source` and `title` variables: lowercase,
/// separators collapsed to single dashes, length-capped.
pub fn slugify(value: &str) -> String {
    let replaced = value.replace('_', "-").replace(['&', '+'], "and");
    let mut slug = String::with_capacity(replaced.len());
    let mut last_dash = true;
    for c in replaced.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    slug.chars().take(80).collect()
}

/// Clean a string for use as a filename fragment without slugifying it:
/// control bytes and filesystem-forbidden characters are removed.
pub fn clean_filename(value: &str) -> String {
    let stripped: String = value.chars().filter(|c| !c.is_control()).collect();
    sanitize_filename::sanitize(stripped)
}

/// The format-derived variables for one chosen download
#[derive(Debug, Clone, Default)]
pub struct DisplayFormat {
    pub resolution: String,
    pub height: String,
    pub width: String,
    pub vcodec: String,
    pub acodec: String,
    pub fps: String,
    pub hdr: String,
    /// Joined into the `{format}` variable, e.g. "1080p-vp9-opus"
    pub parts: Vec<String>,
}

impl DisplayFormat {
    pub fn format_string(&self) -> String {
        self.parts.join("-")
    }

    /// Build from the media's recorded download columns
    pub fn from_downloaded(media: &MediaRecord) -> Self {
        let mut display = DisplayFormat::default();
        if media.downloaded_video_codec.is_none() && media.downloaded_audio_codec.is_none() {
            return display;
        }
        let audio_only = media.downloaded_format.as_deref() == Some("audio");
        if let Some(format) = &media.downloaded_format {
            display.resolution = format.to_lowercase();
        } else if let Some(height) = media.downloaded_height {
            display.resolution = format!("{height}p");
        }
        if !display.resolution.is_empty() && !audio_only {
            display.parts.push(display.resolution.clone());
        }
        if !audio_only {
            if let Some(vcodec) = &media.downloaded_video_codec {
                display.vcodec = vcodec.to_lowercase();
                display.parts.push(display.vcodec.clone());
            }
        }
        if let Some(acodec) = &media.downloaded_audio_codec {
            display.acodec = acodec.to_lowercase();
            display.parts.push(display.acodec.clone());
        }
        if !audio_only {
            if let Some(fps) = media.downloaded_fps {
                display.fps = fps.to_string();
                display.parts.push(format!("{fps}fps"));
            }
            if media.downloaded_hdr == Some(true) {
                display.hdr = "hdr".to_string();
                display.parts.push("hdr".to_string());
            }
            display.height = media.downloaded_height.unwrap_or(0).to_string();
            display.width = media.downloaded_width.unwrap_or(0).to_string();
        }
        display
    }

    /// Build from a matched format selector and the parsed format list
    pub fn from_selector(selector: &str, formats: &[ParsedFormat]) -> Self {
        let mut display = DisplayFormat::default();
        let (vformat, aformat) = if let Some((vid, aid)) = selector.split_once('+') {
            (
                crate::matching::format_by_id(formats, vid),
                crate::matching::format_by_id(formats, aid),
            )
        } else {
            let combined = crate::matching::format_by_id(formats, selector);
            match combined {
                Some(fmt) if fmt.has_video() => (Some(fmt), Some(fmt)),
                other => (None, other),
            }
        };

        if let Some(vfmt) = vformat {
            display.resolution = vfmt
                .format
                .as_deref()
                .map(str::to_lowercase)
                .unwrap_or_else(|| format!("{}p", vfmt.height));
            if !display.resolution.is_empty() {
                display.parts.push(display.resolution.clone());
            }
            if let Some(vcodec) = &vfmt.vcodec {
                display.vcodec = vcodec.to_lowercase();
                display.parts.push(display.vcodec.clone());
            }
        }
        if let Some(afmt) = aformat {
            if let Some(acodec) = &afmt.acodec {
                display.acodec = acodec.to_lowercase();
                display.parts.push(display.acodec.clone());
            }
        }
        if let Some(vfmt) = vformat {
            if vfmt.is_60fps {
                display.fps = "60fps".to_string();
                display.parts.push("60fps".to_string());
            }
            if vfmt.is_hdr {
                display.hdr = "hdr".to_string();
                display.parts.push("hdr".to_string());
            }
            display.height = vfmt.height.to_string();
            display.width = vfmt.width.to_string();
        }
        display
    }
}

fn date_vars(vars: &mut BTreeMap<String, String>, date: DateTime<Utc>) {
    vars.insert("yyyymmdd".into(), date.format("%Y%m%d").to_string());
    vars.insert("yyyy_mm_dd".into(), date.format("%Y-%m-%d").to_string());
    vars.insert("yyyy".into(), date.format("%Y").to_string());
    vars.insert("mm".into(), date.format("%m").to_string());
    vars.insert("dd".into(), date.format("%d").to_string());
}

/// Placeholder data used to validate a source's template and to show an
/// example rendering.
pub fn example_template_vars(source: &SourceRecord) -> BTreeMap<String, String> {
    let mut fmt = Vec::new();
    fmt.push(source.resolution.clone());
    fmt.push(source.video_codec.to_lowercase());
    fmt.push(source.audio_codec.to_lowercase());
    if source.prefer_60fps {
        fmt.push("60fps".to_string());
    }
    if source.prefer_hdr {
        fmt.push("hdr".to_string());
    }

    let mut vars = BTreeMap::new();
    date_vars(&mut vars, Utc::now());
    vars.insert("source".into(), slugify(&source.name));
    vars.insert("source_full".into(), source.name.clone());
    vars.insert("uploader".into(), "Some Channel Name".into());
    vars.insert("title".into(), "some-media-title-name".into());
    vars.insert("title_full".into(), "Some Media Title Name".into());
    vars.insert("key".into(), "SoMeUnIqUiD".into());
    vars.insert("format".into(), fmt.join("-"));
    vars.insert("playlist_title".into(), "Some Playlist Title".into());
    vars.insert("video_order".into(), "01".into());
    vars.insert("ext".into(), source.extension().to_string());
    vars.insert("resolution".into(), source.resolution.clone());
    vars.insert("height".into(), "720".into());
    vars.insert("width".into(), "1280".into());
    vars.insert("vcodec".into(), source.video_codec.to_lowercase());
    vars.insert("acodec".into(), source.audio_codec.to_lowercase());
    vars.insert("fps".into(), "24".into());
    vars.insert("hdr".into(), "hdr".into());
    vars
}

/// A template must render the example dict to a non-empty string
pub fn validate_template(template: &str, source: &SourceRecord) -> Result<()> {
    let rendered = render_template(template, &example_template_vars(source))?;
    if rendered.trim().is_empty() {
        bail!("template renders to an empty filename");
    }
    Ok(())
}

/// Variables for one real media item
pub struct MediaTemplateInput<'a> {
    pub source: &'a SourceRecord,
    pub media: &'a MediaRecord,
    pub uploader: String,
    pub playlist_title: String,
    /// Two-digit ordinal among siblings, empty when unknown
    pub episode_str: String,
    pub display: DisplayFormat,
}

pub fn media_template_vars(input: &MediaTemplateInput<'_>) -> BTreeMap<String, String> {
    let date = input
        .media
        .published_at
        .unwrap_or(input.media.created_at);

    let mut vars = BTreeMap::new();
    date_vars(&mut vars, date);
    vars.insert("source".into(), slugify(&input.source.name));
    vars.insert("source_full".into(), clean_filename(&input.source.name));
    vars.insert("uploader".into(), clean_filename(&input.uploader));
    vars.insert("title".into(), slugify(&input.media.title));
    vars.insert("title_full".into(), clean_filename(&input.media.title));
    vars.insert("key".into(), input.media.remote_key.clone());
    vars.insert("format".into(), input.display.format_string());
    vars.insert("playlist_title".into(), clean_filename(&input.playlist_title));
    vars.insert("video_order".into(), input.episode_str.clone());
    vars.insert("ext".into(), input.source.extension().to_string());
    vars.insert("resolution".into(), input.display.resolution.clone());
    vars.insert("height".into(), input.display.height.clone());
    vars.insert("width".into(), input.display.width.clone());
    vars.insert("vcodec".into(), input.display.vcodec.clone());
    vars.insert("acodec".into(), input.display.acodec.clone());
    vars.insert("fps".into(), input.display.fps.clone());
    vars.insert("hdr".into(), input.display.hdr.clone());
    vars
}

/// Render the media filename relative to the source directory
pub fn media_filename(input: &MediaTemplateInput<'_>) -> Result<String> {
    let rendered = render_template(&input.source.media_template, &media_template_vars(input))?;
    // A leading slash would make the join absolute; keep it relative
    if let Some(stripped) = rendered.strip_prefix('/') {
        Ok(format!("./{stripped}"))
    } else {
        Ok(rendered)
    }
}

/// Absolute directory a source's media lives under
pub fn source_directory(config: &Config, source: &SourceRecord) -> PathBuf {
    let type_dir = if source.is_audio() {
        &config.audio_dir_name
    } else {
        &config.video_dir_name
    };
    config.download_root.join(type_dir).join(&source.directory)
}

/// Absolute path for a media item's rendered filename
pub fn media_filepath(config: &Config, input: &MediaTemplateInput<'_>) -> Result<PathBuf> {
    let filename = media_filename(input)?;
    let path = source_directory(config, input.source).join(filename);
    ensure_inside_root(&config.download_root, &path)
}

/// Lexically normalize a path and require it to stay inside the root.
/// Rejects any rendered name that climbs out via `..` components.
pub fn ensure_inside_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    bail!("path escapes the download root: {}", candidate.display());
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) {
        bail!("path escapes the download root: {}", candidate.display());
    }
    Ok(normalized)
}

/// The stem shared by a media file and its sidecars: the file name with
/// every dot-suffix removed.
pub fn file_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.split('.').next() {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Year used as NFO season and for channel ordinal grouping
pub fn upload_year(media: &MediaRecord) -> i32 {
    media.published_at.unwrap_or(media.created_at).year()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_source() -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
            source_kind: "channel".into(),
            key: "somechannel".into(),
            name: "Some Channel".into(),
            directory: "some-channel".into(),
            media_template: "{yyyy}/{yyyy_mm_dd}/{key}.{ext}".into(),
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

    fn sample_media(source: &SourceRecord) -> MediaRecord {
        MediaRecord {
            id: Uuid::new_v4(),
            source_id: source.id,
            remote_key: "abc".into(),
            published_at: Some(
                DateTime::parse_from_rfc3339("2017-09-11T10:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            created_at: Utc::now(),
            title: "An Example Title".into(),
            duration: Some(600),
            thumb: None,
            thumb_width: None,
            thumb_height: None,
            can_download: true,
            skip: false,
            manual_skip: false,
            downloaded: false,
            download_date: None,
            downloaded_format: None,
            downloaded_height: None,
            downloaded_width: None,
            downloaded_video_codec: None,
            downloaded_audio_codec: None,
            downloaded_container: None,
            downloaded_fps: None,
            downloaded_hdr: None,
            downloaded_filesize: None,
            media_file: None,
        }
    }

    #[test]
    fn test_render_known_placeholders() {
        let mut vars = BTreeMap::new();
        vars.insert("key".to_string(), "abc".to_string());
        vars.insert("ext".to_string(), "mkv".to_string());
        assert_eq!(
            render_template("{key}.{ext}", &vars).unwrap(),
            "abc.mkv"
        );
    }

    #[test]
    fn test_render_unknown_placeholder_fails() {
        let vars = BTreeMap::new();
        assert!(render_template("{nope}.mkv", &vars).is_err());
        assert!(render_template("{unclosed", &vars).is_err());
        assert!(render_template("stray}", &vars).is_err());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Some Channel"), "some-channel");
        assert_eq!(slugify("Tom & Jerry + Friends"), "tom-and-jerry-and-friends");
        assert_eq!(slugify("under_scored_name"), "under-scored-name");
        assert_eq!(slugify("  ---  "), "");
        let long = "x".repeat(120);
        assert_eq!(slugify(&long).len(), 80);
    }

    #[test]
    fn test_media_filename_date_key_template() {
        // {yyyy}/{yyyy_mm_dd}/{key}.{ext} with a 2017-09-11 upload date
        let source = sample_source();
        let media = sample_media(&source);
        let input = MediaTemplateInput {
            source: &source,
            media: &media,
            uploader: "Some Channel Name".into(),
            playlist_title: String::new(),
            episode_str: "01".into(),
            display: DisplayFormat::default(),
        };
        assert_eq!(media_filename(&input).unwrap(), "2017/2017-09-11/abc.mkv");
    }

    #[test]
    fn test_validate_template() {
        let source = sample_source();
        assert!(validate_template("{yyyy}/{key}.{ext}", &source).is_ok());
        assert!(validate_template("{bogus}.{ext}", &source).is_err());
        assert!(validate_template("", &source).is_err());
    }

    #[test]
    fn test_ensure_inside_root() {
        let root = Path::new("/data/downloads");
        assert_eq!(
            ensure_inside_root(root, Path::new("/data/downloads/video/a/b.mkv")).unwrap(),
            PathBuf::from("/data/downloads/video/a/b.mkv")
        );
        assert!(ensure_inside_root(root, Path::new("/data/downloads/video/../../etc/passwd")).is_err());
        assert!(ensure_inside_root(root, Path::new("/elsewhere/file.mkv")).is_err());
    }

    #[test]
    fn test_file_stem_strips_all_suffixes() {
        assert_eq!(file_stem(Path::new("/a/b/foo.mkv")), "foo");
        assert_eq!(file_stem(Path::new("/a/b/foo.info.json")), "foo");
        assert_eq!(file_stem(Path::new("bare")), "bare");
    }

    #[test]
    fn test_display_format_from_selector() {
        let formats = crate::matching::parse_media_formats(&[
            serde_json::json!({"format_id": "248", "format_note": "1080p", "height": 1080,
                   "width": 1920, "vcodec": "vp9", "acodec": "none"}),
            serde_json::json!({"format_id": "251", "vcodec": "none", "acodec": "opus"}),
        ]);

        let display = DisplayFormat::from_selector("248+251", &formats);
        assert_eq!(display.resolution, "1080p");
        assert_eq!(display.vcodec, "vp9");
        assert_eq!(display.acodec, "opus");
        assert_eq!(display.format_string(), "1080p-vp9-opus");

        let audio = DisplayFormat::from_selector("251", &formats);
        assert_eq!(audio.format_string(), "opus");
    }
}
