//! Extractor format normalization
//!
//! Adapts the raw format objects returned by the extractor tool into the
//! fixed shape the matchers work with. If the tool changes its field names,
//! update it here.

use serde_json::Value;

/// A normalized downloadable format
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFormat {
    pub id: String,
    /// Cleaned format note, e.g. "1080P"; None for unlabeled DASH formats
    pub format: Option<String>,
    pub format_verbose: String,
    pub height: i64,
    pub width: i64,
    /// Normalized upper-case video codec, None for audio-only
    pub vcodec: Option<String>,
    pub fps: f64,
    pub vbr: f64,
    /// Normalized upper-case audio codec, None for video-only
    pub acodec: Option<String>,
    pub abr: f64,
    pub is_60fps: bool,
    pub is_hdr: bool,
    pub language_code: Option<String>,
    pub format_note: String,
}

impl ParsedFormat {
    pub fn has_video(&self) -> bool {
        self.vcodec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.is_some()
    }

    /// The format note marks the site's preferred default stream
    pub fn is_default(&self) -> bool {
        self.format_note.contains("(default)")
    }
}

/// Normalize a codec name: upper-case, drop the profile suffix, strip
/// leading zeroes from any trailing variant digits.
/// `vp9.2` → `VP9`, `avc1.640028` → `AVC1`, `none` → None.
pub fn normalize_codec(codec: &str) -> Option<String> {
    let mut result = codec.trim().to_uppercase();
    if let Some(first) = result.split('.').next() {
        result = first.trim().to_string();
    }
    if result.is_empty() || result == "NONE" {
        return None;
    }
    if result.contains('0') {
        let prefix: String = result
            .chars()
            .take_while(|c| !c.is_ascii_digit())
            .collect();
        let digits = &result[prefix.len()..];
        if let Ok(number) = digits.parse::<u64>() {
            result = format!("{prefix}{number}");
        }
    }
    Some(result)
}

fn value_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn value_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0)
}

fn value_f64(value: &Value, key: &str) -> f64 {
    value
        .get(key)
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

/// Parse one raw format object into the matcher's shape
pub fn parse_media_format(value: &Value) -> ParsedFormat {
    let vcodec = value_str(value, "vcodec")
        .as_deref()
        .and_then(normalize_codec);
    let acodec = value_str(value, "acodec")
        .as_deref()
        .and_then(normalize_codec);

    let fps = value_f64(value, "fps");
    let height = value_i64(value, "height");
    let width = value_i64(value, "width");

    let format_verbose = value_str(value, "format").unwrap_or_default();
    let format_note = value_str(value, "format_note").unwrap_or_default();

    // The note carries trailing fps/hdr markers: "1080P60 HDR" -> "1080P"
    let mut format = format_note.trim().to_uppercase();
    for suffix in ["60", "HDR", "60"] {
        format = format
            .strip_suffix(suffix)
            .map(str::trim_end)
            .unwrap_or(&format)
            .to_string();
    }
    let format = if format.contains("DASH") {
        if height > 0 { Some(format!("{height}P")) } else { None }
    } else if format.is_empty() {
        None
    } else {
        Some(format)
    };

    ParsedFormat {
        id: value_str(value, "format_id").unwrap_or_default(),
        format,
        format_verbose: format_verbose.clone(),
        height,
        width,
        vcodec,
        fps,
        vbr: value_f64(value, "tbr"),
        acodec,
        abr: value_f64(value, "abr"),
        is_60fps: fps > 50.0,
        is_hdr: format_verbose.to_uppercase().contains("HDR"),
        language_code: value_str(value, "language"),
        format_note,
    }
}

/// Parse a whole format list in order
pub fn parse_media_formats(values: &[Value]) -> Vec<ParsedFormat> {
    values.iter().map(parse_media_format).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_codec() {
        assert_eq!(normalize_codec("vp9.2"), Some("VP9".to_string()));
        assert_eq!(normalize_codec("avc1.640028"), Some("AVC1".to_string()));
        assert_eq!(normalize_codec("av01.0.09M.08"), Some("AV1".to_string()));
        assert_eq!(normalize_codec("opus"), Some("OPUS".to_string()));
        assert_eq!(normalize_codec("mp4a.40.2"), Some("MP4A".to_string()));
        assert_eq!(normalize_codec("none"), None);
        assert_eq!(normalize_codec(""), None);
    }

    #[test]
    fn test_parse_video_only_format() {
        let fmt = parse_media_format(&json!({
            "format_id": "248",
            "format": "248 - 1920x1080 (1080p)",
            "format_note": "1080p",
            "height": 1080,
            "width": 1920,
            "vcodec": "vp9",
            "acodec": "none",
            "fps": 24,
            "tbr": 1200.5,
        }));

        assert_eq!(fmt.id, "248");
        assert_eq!(fmt.format.as_deref(), Some("1080P"));
        assert_eq!(fmt.vcodec.as_deref(), Some("VP9"));
        assert_eq!(fmt.acodec, None);
        assert_eq!(fmt.height, 1080);
        assert!(!fmt.is_60fps);
        assert!(!fmt.is_hdr);
        assert!(fmt.has_video());
        assert!(!fmt.has_audio());
    }

    #[test]
    fn test_parse_audio_only_format() {
        let fmt = parse_media_format(&json!({
            "format_id": "251",
            "format": "251 - audio only (medium)",
            "format_note": "medium, (default)",
            "vcodec": "none",
            "acodec": "opus",
            "abr": 140.0,
            "language": "en",
        }));

        assert_eq!(fmt.acodec.as_deref(), Some("OPUS"));
        assert_eq!(fmt.vcodec, None);
        assert!(fmt.is_default());
        assert_eq!(fmt.language_code.as_deref(), Some("en"));
    }

    #[test]
    fn test_parse_60fps_hdr_markers() {
        let fmt = parse_media_format(&json!({
            "format_id": "337",
            "format": "337 - 3840x2160 (2160p60 HDR)",
            "format_note": "2160p60 HDR",
            "height": 2160,
            "width": 3840,
            "vcodec": "vp9.2",
            "acodec": "none",
            "fps": 60,
        }));

        assert!(fmt.is_60fps);
        assert!(fmt.is_hdr);
        assert_eq!(fmt.format.as_deref(), Some("2160P"));
        assert_eq!(fmt.vcodec.as_deref(), Some("VP9"));
    }

    #[test]
    fn test_parse_dash_format_note() {
        let fmt = parse_media_format(&json!({
            "format_id": "135",
            "format_note": "DASH video",
            "height": 480,
            "vcodec": "avc1.4d401e",
            "acodec": "none",
        }));
        assert_eq!(fmt.format.as_deref(), Some("480P"));

        let fmt = parse_media_format(&json!({
            "format_id": "139",
            "format_note": "DASH audio",
            "vcodec": "none",
            "acodec": "mp4a.40.5",
        }));
        assert_eq!(fmt.format, None);
    }
}
