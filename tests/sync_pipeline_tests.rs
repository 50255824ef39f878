//! Integration tests for the sync pipeline
//!
//! These tests verify the lifecycle rules the pipeline enforces:
//! - Media state transitions (new -> indexed -> matched -> downloaded)
//! - Task ordering guarantees between the indexing and download stages
//! - Sidecar naming conventions

// ============================================================================
// Media State Transition Tests
// ============================================================================

/// States a media item moves through
const VALID_STATES: &[&str] = &[
    "new",
    "indexed",
    "matched",
    "downloading",
    "downloaded",
    "skipped",
];

mod state_transitions {
    use super::*;

    /// Check if a media state transition is valid
    fn is_valid_transition(from: &str, to: &str) -> bool {
        match (from, to) {
            // new -> indexed: the indexer saw the item and stored a shallow row
            ("new", "indexed") => true,
            // indexed -> matched: metadata arrived and a format matched
            ("indexed", "matched") => true,
            // matched -> downloading: the download task picked it up
            ("matched", "downloading") => true,
            // downloading -> downloaded: file landed and was verified
            ("downloading", "downloaded") => true,
            // downloading -> matched: download failed, will retry
            ("downloading", "matched") => true,
            // downloaded -> matched: file vanished from disk, needs re-download
            ("downloaded", "matched") => true,
            // indexed -> skipped: filters or caps rejected it
            ("indexed", "skipped") => true,
            // matched -> skipped: operator skip or late filter change
            ("matched", "skipped") => true,
            // skipped -> indexed: skip cleared (e.g. a premiere went live)
            ("skipped", "indexed") => true,
            // Same state is allowed (no-op save)
            (a, b) if a == b => true,
            _ => false,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(is_valid_transition("new", "indexed"));
        assert!(is_valid_transition("indexed", "matched"));
        assert!(is_valid_transition("matched", "downloading"));
        assert!(is_valid_transition("downloading", "downloaded"));
    }

    #[test]
    fn test_failure_recovery_transitions() {
        // A failed download goes back to matched for the retry
        assert!(is_valid_transition("downloading", "matched"));
        // A file missing on disk clears the download
        assert!(is_valid_transition("downloaded", "matched"));
    }

    #[test]
    fn test_skip_transitions() {
        assert!(is_valid_transition("indexed", "skipped"));
        assert!(is_valid_transition("matched", "skipped"));
        // premieres get un-skipped when their time passes
        assert!(is_valid_transition("skipped", "indexed"));
        // a skipped item can never jump straight to downloaded
        assert!(!is_valid_transition("skipped", "downloaded"));
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(!is_valid_transition("new", "matched"));
        assert!(!is_valid_transition("new", "downloaded"));
        assert!(!is_valid_transition("indexed", "downloaded"));
    }

    #[test]
    fn test_same_state_is_noop() {
        for state in VALID_STATES {
            assert!(
                is_valid_transition(state, state),
                "same-state transition should be valid: {}",
                state
            );
        }
    }
}

// ============================================================================
// Task Ordering Tests
// ============================================================================

mod task_ordering {
    /// The per-media pipeline order enforced by locks and dedup
    const PIPELINE: &[&str] = &[
        "index_source",
        "download_media_metadata",
        "download_media_file",
        "rename_media_files",
    ];

    fn stage_index(task: &str) -> Option<usize> {
        PIPELINE.iter().position(|t| *t == task)
    }

    #[test]
    fn test_metadata_precedes_download() {
        assert!(
            stage_index("download_media_metadata").unwrap()
                < stage_index("download_media_file").unwrap()
        );
    }

    #[test]
    fn test_rename_is_last() {
        let rename = stage_index("rename_media_files").unwrap();
        for task in PIPELINE {
            assert!(stage_index(task).unwrap() <= rename);
        }
    }

    #[test]
    fn test_indexing_is_first() {
        assert_eq!(stage_index("index_source"), Some(0));
    }
}

// ============================================================================
// Sidecar Naming Tests
// ============================================================================

mod sidecar_naming {
    /// Sidecars share the media file's stem with these suffixes
    const SIDECAR_SUFFIXES: &[&str] = &[".jpg", ".nfo", ".info.json"];

    fn stem(file_name: &str) -> &str {
        file_name.split('.').next().unwrap_or(file_name)
    }

    fn sidecar_names(file_name: &str) -> Vec<String> {
        let stem = stem(file_name);
        SIDECAR_SUFFIXES
            .iter()
            .map(|suffix| format!("{stem}{suffix}"))
            .collect()
    }

    #[test]
    fn test_sidecars_share_stem() {
        let names = sidecar_names("2017-09-11_some-channel_a-title_abc.mkv");
        assert_eq!(
            names,
            vec![
                "2017-09-11_some-channel_a-title_abc.jpg",
                "2017-09-11_some-channel_a-title_abc.nfo",
                "2017-09-11_some-channel_a-title_abc.info.json",
            ]
        );
    }

    #[test]
    fn test_stem_ignores_multi_suffixes() {
        assert_eq!(stem("video.info.json"), "video");
        assert_eq!(stem("video.mkv"), "video");
        assert_eq!(stem("plain"), "plain");
    }
}
