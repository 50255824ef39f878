//! Format matching
//!
//! Pure functions that pick the best downloadable format(s) for a media
//! item given its source's quality policy. Matchers return whether the
//! match was exact or a best-fit, plus the chosen format id. No I/O here;
//! repeated calls with identical inputs return identical results.

pub mod parse;

pub use parse::{ParsedFormat, normalize_codec, parse_media_format, parse_media_formats};

use crate::db::{Fallback, QualityPolicy};

/// Tunables shared by the matchers
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Ordered language codes used to break ties in favor of English tracks
    pub english_language_codes: Vec<String>,
    /// Height at or above which a fallback counts as HD
    pub hd_cutoff_height: i64,
    /// Minimum height a fallback candidate may have
    pub min_fallback_height: i64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            english_language_codes: ["en", "en-US", "en-GB", "en-CA", "en-AU"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hd_cutoff_height: 500,
            min_fallback_height: 360,
        }
    }
}

/// Result of a matcher: was the match exact, and which format id
pub type FormatMatch = (bool, String);

/// Pick from a set of equally-acceptable matches: the site's default track
/// first, then the first English track per the configured order, then the
/// first candidate.
fn pick_preferred<'a>(
    candidates: &[&'a ParsedFormat],
    config: &MatcherConfig,
) -> Option<&'a ParsedFormat> {
    if let Some(default) = candidates.iter().find(|f| f.is_default()).copied() {
        return Some(default);
    }
    for code in &config.english_language_codes {
        if let Some(by_lang) = candidates
            .iter()
            .find(|f| f.language_code.as_deref() == Some(code.as_str()))
            .copied()
        {
            return Some(by_lang);
        }
    }
    candidates.first().copied()
}

/// Find a single combined audio+video format that exactly matches the
/// policy. Combined formats must match exactly to be usable at all.
pub fn best_combined_format(
    policy: &QualityPolicy,
    formats: &[ParsedFormat],
    config: &MatcherConfig,
) -> Option<FormatMatch> {
    let height = policy.resolution.height();
    let matches: Vec<&ParsedFormat> = formats
        .iter()
        .filter(|fmt| fmt.height == height)
        .filter(|fmt| fmt.vcodec.as_deref() == Some(policy.video_codec.as_str()))
        .filter(|fmt| fmt.acodec.as_deref() == Some(policy.audio_codec.as_str()))
        .filter(|fmt| !policy.prefer_60fps || fmt.is_60fps)
        .filter(|fmt| !policy.prefer_hdr || fmt.is_hdr)
        .collect();

    pick_preferred(&matches, config).map(|fmt| (true, fmt.id.clone()))
}

/// Find the best audio-only format. With `fallback = fail` this can return
/// no match at all.
pub fn best_audio_format(
    policy: &QualityPolicy,
    formats: &[ParsedFormat],
    config: &MatcherConfig,
) -> Option<FormatMatch> {
    let audio: Vec<&ParsedFormat> = formats
        .iter()
        .filter(|fmt| fmt.vcodec.is_none() && fmt.acodec.is_some())
        .collect();
    if audio.is_empty() {
        return None;
    }

    // Exact codec match; the last listed wins like the site's own ordering
    if let Some(exact) = audio
        .iter()
        .copied()
        .filter(|fmt| fmt.acodec.as_deref() == Some(policy.audio_codec.as_str()))
        .next_back()
    {
        return Some((true, exact.id.clone()));
    }

    if !policy.can_fallback() {
        return None;
    }

    // Highest bitrate, preferring default/English tracks among equals
    let best_abr = audio
        .iter()
        .map(|fmt| fmt.abr)
        .fold(f64::MIN, f64::max);
    let top: Vec<&ParsedFormat> = audio
        .iter()
        .filter(|fmt| fmt.abr >= best_abr)
        .copied()
        .collect();

    pick_preferred(&top, config).map(|fmt| (false, fmt.id.clone()))
}

/// One rung of the video preference ladder
struct LadderStep {
    requires_codec_switch: bool,
    pred: fn(&ParsedFormat, &StepContext) -> bool,
}

struct StepContext {
    resolution_label: String,
    height: i64,
    vcodec: String,
    prefer_60fps: bool,
    prefer_hdr: bool,
}

impl StepContext {
    fn matched_resolution(&self, fmt: &ParsedFormat) -> bool {
        fmt.format.as_deref() == Some(self.resolution_label.as_str()) || fmt.height == self.height
    }

    fn matched_codec(&self, fmt: &ParsedFormat) -> bool {
        fmt.vcodec.as_deref() == Some(self.vcodec.as_str())
    }

    fn matched_bits(&self, fmt: &ParsedFormat) -> bool {
        fmt.is_60fps == self.prefer_60fps && fmt.is_hdr == self.prefer_hdr
    }
}

/// The strict preference ladder, strongest first. Rungs that drop the
/// codec requirement are skipped unless the policy permits switching.
const VIDEO_LADDER: &[LadderStep] = &[
    // 1. resolution + codec + hdr-bit + fps-bit
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| c.matched_resolution(f) && c.matched_codec(f) && c.matched_bits(f),
    },
    // 2. drop the codec, keep resolution and both bits
    LadderStep {
        requires_codec_switch: true,
        pred: |f, c| c.matched_resolution(f) && c.matched_bits(f),
    },
    // 3. drop the resolution, keep codec and both bits
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| c.matched_codec(f) && c.matched_bits(f),
    },
    // 4a. weaken hdr when only fps is preferred
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| {
            c.prefer_60fps && c.matched_resolution(f) && c.matched_codec(f) && f.is_60fps
        },
    },
    // 4b. weaken fps when only hdr is preferred
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| c.prefer_hdr && c.matched_resolution(f) && c.matched_codec(f) && f.is_hdr,
    },
    // 5. resolution + codec only
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| c.matched_resolution(f) && c.matched_codec(f),
    },
    // 6. codec only
    LadderStep {
        requires_codec_switch: false,
        pred: |f, c| c.matched_codec(f),
    },
    // 7. resolution only
    LadderStep {
        requires_codec_switch: true,
        pred: |f, c| c.matched_resolution(f),
    },
    // 8. highest-resolution candidate
    LadderStep {
        requires_codec_switch: true,
        pred: |_, _| true,
    },
];

/// Find the best video-only format. Resolution is the most important
/// factor; the ladder weakens requirements one at a time until the
/// policy's fallback rule refuses to go further.
pub fn best_video_format(
    policy: &QualityPolicy,
    formats: &[ParsedFormat],
    config: &MatcherConfig,
) -> Option<FormatMatch> {
    if policy.resolution.is_audio() {
        return None;
    }

    let ctx = StepContext {
        resolution_label: policy.resolution.as_str().to_uppercase(),
        height: policy.resolution.height(),
        vcodec: policy.video_codec.clone(),
        prefer_60fps: policy.prefer_60fps,
        prefer_hdr: policy.prefer_hdr,
    };

    let video_only = |fmt: &&ParsedFormat| {
        fmt.acodec.is_none()
            && fmt.vcodec.is_some()
            && fmt.height > 0
            // AI-upscaled "super resolution" variants are never acceptable
            && !fmt.id.contains("-sr")
    };

    let mut candidates: Vec<&ParsedFormat> = formats
        .iter()
        .filter(video_only)
        .filter(|fmt| {
            ctx.matched_resolution(fmt)
                && (policy.can_switch_codecs() || ctx.matched_codec(fmt))
        })
        .collect();

    if candidates.is_empty() {
        if !policy.can_fallback() {
            return None;
        }
        // Nothing at the requested resolution; refill with anything between
        // the floor and the requested height.
        candidates = formats
            .iter()
            .filter(video_only)
            .filter(|fmt| {
                fmt.height >= config.min_fallback_height && fmt.height <= ctx.height
            })
            .collect();
    }
    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then_with(|| a.vcodec.cmp(&b.vcodec))
            .then_with(|| b.vbr.partial_cmp(&a.vbr).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut best: Option<(bool, &ParsedFormat)> = None;
    for (rung, step) in VIDEO_LADDER.iter().enumerate() {
        if rung > 0 && !policy.can_fallback() {
            break;
        }
        if step.requires_codec_switch && !policy.can_switch_codecs() {
            continue;
        }
        if let Some(fmt) = candidates.iter().copied().find(|f| (step.pred)(f, &ctx)) {
            best = Some((rung == 0, fmt));
            break;
        }
    }

    let (exact, fmt) = best?;
    if exact {
        return Some((true, fmt.id.clone()));
    }

    // A best-fit is only as good as the fallback rule allows
    let accepted = match policy.fallback {
        Fallback::Fail => false,
        Fallback::NextBest => true,
        Fallback::NextBestHd => fmt.height >= config.hd_cutoff_height,
        Fallback::RequireCodec => ctx.matched_codec(fmt),
    };
    if accepted {
        Some((false, fmt.id.clone()))
    } else {
        None
    }
}

/// Compose the final download format selector for a media item.
///
/// Combined formats win when they exactly match; otherwise separate video
/// and audio picks are joined as `"<video>+<audio>"`. As a last resort any
/// combined format acceptable under the fallback rule is used.
pub fn select_format_string(
    policy: &QualityPolicy,
    formats: &[ParsedFormat],
    config: &MatcherConfig,
) -> Option<String> {
    if policy.resolution.is_audio() {
        return best_audio_format(policy, formats, config).map(|(_, id)| id);
    }

    if let Some((_, id)) = best_combined_format(policy, formats, config) {
        return Some(id);
    }

    let audio = best_audio_format(policy, formats, config);
    let video = best_video_format(policy, formats, config);
    if let (Some((_, video_id)), Some((_, audio_id))) = (&video, &audio) {
        return Some(format!("{video_id}+{audio_id}"));
    }

    // Last resort: any combined format the fallback rule will accept
    if policy.can_fallback() {
        for fmt in formats.iter().rev() {
            if fmt.id.is_empty() || !fmt.has_audio() || !fmt.has_video() {
                continue;
            }
            let acceptable = match policy.fallback {
                Fallback::NextBest => true,
                Fallback::NextBestHd => fmt.height >= config.hd_cutoff_height,
                _ => false,
            };
            if acceptable {
                return Some(fmt.id.clone());
            }
        }
    }

    None
}

/// Find a parsed format by its id
pub fn format_by_id<'a>(formats: &'a [ParsedFormat], id: &str) -> Option<&'a ParsedFormat> {
    formats.iter().find(|fmt| fmt.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SourceResolution;
    use serde_json::json;

    fn policy(
        resolution: SourceResolution,
        vcodec: &str,
        acodec: &str,
        fallback: Fallback,
    ) -> QualityPolicy {
        QualityPolicy {
            resolution,
            video_codec: vcodec.to_string(),
            audio_codec: acodec.to_string(),
            prefer_60fps: false,
            prefer_hdr: false,
            fallback,
        }
    }

    fn fixture_formats() -> Vec<ParsedFormat> {
        parse_media_formats(&[
            json!({"format_id": "18", "format_note": "360p", "height": 360, "width": 640,
                   "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "tbr": 500.0}),
            json!({"format_id": "140", "format_note": "medium", "vcodec": "none",
                   "acodec": "mp4a.40.2", "abr": 129.5}),
            json!({"format_id": "251", "format_note": "medium", "vcodec": "none",
                   "acodec": "opus", "abr": 140.0}),
            json!({"format_id": "247", "format_note": "720p", "height": 720, "width": 1280,
                   "vcodec": "vp9", "acodec": "none", "tbr": 1200.0}),
            json!({"format_id": "248", "format_note": "1080p", "height": 1080, "width": 1920,
                   "vcodec": "vp9", "acodec": "none", "tbr": 2200.0}),
            json!({"format_id": "136", "format_note": "720p", "height": 720, "width": 1280,
                   "vcodec": "avc1.4d401f", "acodec": "none", "tbr": 1100.0}),
        ])
    }

    #[test]
    fn test_separate_streams_exact() {
        // 1080p VP9 + OPUS with no fallback allowed picks 248+251
        let p = policy(SourceResolution::P1080, "VP9", "OPUS", Fallback::Fail);
        let formats = fixture_formats();
        let config = MatcherConfig::default();

        let selected = select_format_string(&p, &formats, &config);
        assert_eq!(selected.as_deref(), Some("248+251"));

        let (exact, id) = best_video_format(&p, &formats, &config).unwrap();
        assert!(exact);
        assert_eq!(id, "248");
    }

    #[test]
    fn test_hd_fallback_accepts_720() {
        // Only 720p available; NextBestHd accepts because 720 >= 500
        let p = policy(SourceResolution::P1080, "VP9", "OPUS", Fallback::NextBestHd);
        let formats: Vec<ParsedFormat> = fixture_formats()
            .into_iter()
            .filter(|f| f.id != "248")
            .collect();
        let config = MatcherConfig::default();

        let selected = select_format_string(&p, &formats, &config);
        assert_eq!(selected.as_deref(), Some("247+251"));

        let (exact, id) = best_video_format(&p, &formats, &config).unwrap();
        assert!(!exact);
        assert_eq!(id, "247");
    }

    #[test]
    fn test_hd_fallback_rejects_sd() {
        // Only 360p video remains; NextBestHd refuses anything under 500
        let p = policy(SourceResolution::P1080, "VP9", "OPUS", Fallback::NextBestHd);
        let formats = parse_media_formats(&[
            json!({"format_id": "134", "format_note": "360p", "height": 360,
                   "vcodec": "avc1.4d401e", "acodec": "none", "tbr": 300.0}),
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 140.0}),
        ]);
        let config = MatcherConfig::default();

        assert!(best_video_format(&p, &formats, &config).is_none());
    }

    #[test]
    fn test_audio_only_policy() {
        // AUDIO+MP4A picks the mp4a track and never a video
        let p = policy(SourceResolution::Audio, "", "MP4A", Fallback::Fail);
        let formats = fixture_formats();
        let config = MatcherConfig::default();

        assert!(best_video_format(&p, &formats, &config).is_none());
        let selected = select_format_string(&p, &formats, &config);
        assert_eq!(selected.as_deref(), Some("140"));

        let (exact, id) = best_audio_format(&p, &formats, &config).unwrap();
        assert!(exact);
        assert_eq!(id, "140");
    }

    #[test]
    fn test_combined_format_exact() {
        // 360p AVC1/MP4A matches the classic combined format 18
        let p = policy(SourceResolution::P360, "AVC1", "MP4A", Fallback::Fail);
        let formats = fixture_formats();
        let config = MatcherConfig::default();

        let (exact, id) = best_combined_format(&p, &formats, &config).unwrap();
        assert!(exact);
        assert_eq!(id, "18");
        assert_eq!(select_format_string(&p, &formats, &config).as_deref(), Some("18"));
    }

    #[test]
    fn test_fail_fallback_never_inexact() {
        // With fallback = fail, a policy no format satisfies yields nothing
        let p = policy(SourceResolution::P2160, "AV1", "OPUS", Fallback::Fail);
        let formats = fixture_formats();
        let config = MatcherConfig::default();

        assert!(best_video_format(&p, &formats, &config).is_none());
        assert!(select_format_string(&p, &formats, &config).is_none());
    }

    #[test]
    fn test_audio_fallback_highest_bitrate() {
        // No MP4A track; NextBest falls back to the highest-bitrate audio
        let p = policy(SourceResolution::Audio, "", "MP4A", Fallback::NextBest);
        let formats = parse_media_formats(&[
            json!({"format_id": "249", "vcodec": "none", "acodec": "opus", "abr": 50.0}),
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 140.0}),
        ]);
        let config = MatcherConfig::default();

        let (exact, id) = best_audio_format(&p, &formats, &config).unwrap();
        assert!(!exact);
        assert_eq!(id, "251");
    }

    #[test]
    fn test_audio_fail_fallback_rejects() {
        let p = policy(SourceResolution::Audio, "", "MP4A", Fallback::Fail);
        let formats = parse_media_formats(&[
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 140.0}),
        ]);
        let config = MatcherConfig::default();

        assert!(best_audio_format(&p, &formats, &config).is_none());
    }

    #[test]
    fn test_upscaled_variants_never_selected() {
        // AI-upscaled "-sr" ids are disqualified even as perfect matches
        let p = policy(SourceResolution::P1080, "VP9", "OPUS", Fallback::NextBest);
        let formats = parse_media_formats(&[
            json!({"format_id": "248-sr", "format_note": "1080p", "height": 1080,
                   "vcodec": "vp9", "acodec": "none", "tbr": 1400.0}),
            json!({"format_id": "247", "format_note": "720p", "height": 720,
                   "vcodec": "vp9", "acodec": "none", "tbr": 1200.0}),
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 140.0}),
        ]);
        let config = MatcherConfig::default();

        let (exact, id) = best_video_format(&p, &formats, &config).unwrap();
        assert!(!exact);
        assert_eq!(id, "247");
    }

    #[test]
    fn test_require_codec_fallback() {
        // RequireCodec accepts a lower resolution with the right codec but
        // refuses a better resolution with the wrong one
        let p = policy(SourceResolution::P1080, "AV1", "OPUS", Fallback::RequireCodec);
        let formats = parse_media_formats(&[
            json!({"format_id": "398", "format_note": "720p", "height": 720,
                   "vcodec": "av01.0.05M.08", "acodec": "none", "tbr": 900.0}),
            json!({"format_id": "248", "format_note": "1080p", "height": 1080,
                   "vcodec": "vp9", "acodec": "none", "tbr": 2200.0}),
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus", "abr": 140.0}),
        ]);
        let config = MatcherConfig::default();

        let (exact, id) = best_video_format(&p, &formats, &config).unwrap();
        assert!(!exact);
        assert_eq!(id, "398");
    }

    #[test]
    fn test_combined_prefers_default_track() {
        let p = policy(SourceResolution::P360, "AVC1", "MP4A", Fallback::Fail);
        let formats = parse_media_formats(&[
            json!({"format_id": "18-fr", "format_note": "360p", "height": 360,
                   "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "language": "fr"}),
            json!({"format_id": "18-en", "format_note": "360p, (default)", "height": 360,
                   "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "language": "en"}),
        ]);
        let config = MatcherConfig::default();

        let (_, id) = best_combined_format(&p, &formats, &config).unwrap();
        assert_eq!(id, "18-en");
    }

    #[test]
    fn test_matcher_is_deterministic() {
        let p = policy(SourceResolution::P1080, "VP9", "OPUS", Fallback::NextBest);
        let formats = fixture_formats();
        let config = MatcherConfig::default();

        let first = select_format_string(&p, &formats, &config);
        for _ in 0..10 {
            assert_eq!(first, select_format_string(&p, &formats, &config));
        }
    }
}
