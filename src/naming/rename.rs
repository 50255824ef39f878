//! Safe rename and relocation of a media file plus its sidecars
//!
//! When a template or source rename changes a media item's rendered path,
//! the video is moved first, then every file sharing the old stem follows,
//! then orphans matching the remote key are adopted, and finally emptied
//! directories are pruned up to the source root. Callers hold the media's
//! advisory lock around the whole operation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::file_stem;

/// Outcome of a rename pass
#[derive(Debug, Default)]
pub struct RenameOutcome {
    /// The video was physically moved
    pub moved: bool,
    /// Sidecar and orphan files that moved with it
    pub other_files_moved: usize,
    /// Directories removed because they became empty
    pub directories_removed: usize,
}

/// Move `old_path` to `new_path` along with its sidecars.
///
/// `source_dir` bounds the orphan search and the upward directory pruning.
/// `adopt_by_key` carries the remote key when the template references
/// `{key}`, enabling the fuzzy orphan adoption pass.
pub async fn rename_files(
    old_path: &Path,
    new_path: &Path,
    source_dir: &Path,
    adopt_by_key: Option<&str>,
) -> Result<RenameOutcome> {
    let mut outcome = RenameOutcome::default();
    if old_path == new_path {
        return Ok(outcome);
    }
    if !tokio::fs::try_exists(old_path).await.unwrap_or(false) {
        return Ok(outcome);
    }
    if tokio::fs::try_exists(new_path).await.unwrap_or(false) {
        debug!(path = %new_path.display(), "Rename target already exists, leaving files in place");
        return Ok(outcome);
    }

    let old_parent = old_path
        .parent()
        .context("old media path has no parent directory")?
        .to_path_buf();
    let new_parent = new_path
        .parent()
        .context("new media path has no parent directory")?
        .to_path_buf();
    let old_stem = file_stem(old_path);
    let new_stem = file_stem(new_path);

    tokio::fs::create_dir_all(&new_parent)
        .await
        .context("Failed to create rename target directory")?;

    debug!(
        from = %old_path.display(),
        to = %new_path.display(),
        "Renaming media file"
    );
    tokio::fs::rename(old_path, new_path)
        .await
        .context("Failed to rename media file")?;
    outcome.moved = true;

    // Files in the old directory sharing the old stem follow the video
    let other_paths = collect_stem_matches(&old_parent, &old_stem).await?;
    info!(
        count = other_paths.len(),
        stem = %old_stem,
        "Collected sidecar files for rename"
    );

    for other_path in other_paths {
        if !tokio::fs::try_exists(&other_path).await.unwrap_or(false) {
            continue;
        }
        let old_name = match other_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let new_name = format!("{new_stem}{}", &old_name[old_stem.len()..]);
        let target = new_parent.join(&new_name);
        if target == other_path || target == *new_path {
            continue;
        }
        debug!(from = %other_path.display(), to = %target.display(), "Moving sidecar");
        // Exact-stem sidecars replace any stale file at the destination
        tokio::fs::rename(&other_path, &target)
            .await
            .context("Failed to move sidecar file")?;
        outcome.other_files_moved += 1;
    }

    // Orphans anywhere under the source directory that carry the remote key
    if let Some(key) = adopt_by_key {
        let fuzzy_paths = collect_fuzzy_matches(source_dir, key);
        info!(count = fuzzy_paths.len(), key = %key, "Collected orphaned files for rename");
        for fuzzy_path in fuzzy_paths {
            let fuzzy_stem = file_stem(&fuzzy_path);
            let old_name = match fuzzy_path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if fuzzy_stem.len() > old_name.len() {
                continue;
            }
            let new_name = format!("{new_stem}{}", &old_name[fuzzy_stem.len()..]);
            let target = new_parent.join(&new_name);
            if target == fuzzy_path {
                continue;
            }
            // Orphans never replace existing files
            let source_exists = tokio::fs::try_exists(&fuzzy_path).await.unwrap_or(false);
            let target_exists = tokio::fs::try_exists(&target).await.unwrap_or(false);
            if source_exists && !target_exists {
                debug!(from = %fuzzy_path.display(), to = %target.display(), "Adopting orphan");
                tokio::fs::rename(&fuzzy_path, &target)
                    .await
                    .context("Failed to adopt orphaned file")?;
                outcome.other_files_moved += 1;
            }
        }
    }

    outcome.directories_removed = prune_empty_dirs(&old_parent, source_dir).await;

    Ok(outcome)
}

/// Files in `dir` whose name starts with `stem`
async fn collect_stem_matches(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    if stem.is_empty() {
        return Ok(matches);
    }
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(matches),
    };
    while let Some(entry) = entries.next_entry().await? {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(stem) {
                matches.push(entry.path());
            }
        }
    }
    Ok(matches)
}

/// Files anywhere under `dir` whose name contains `key`
fn collect_fuzzy_matches(dir: &Path, key: &str) -> Vec<PathBuf> {
    if key.is_empty() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| name.contains(key))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

/// Remove `start` and its parents while they are empty, stopping at `stop`
pub async fn prune_empty_dirs(start: &Path, stop: &Path) -> usize {
    let mut removed = 0;
    let mut dir = start.to_path_buf();
    while dir.starts_with(stop) && dir != *stop {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {
                info!(path = %dir.display(), "Removed empty directory");
                removed += 1;
            }
            // Not empty, or already gone; either way stop walking up
            Err(_) => break,
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_moves_video_and_sidecars() {
        let tmp = tempfile::tempdir().unwrap();
        let source_dir = tmp.path().join("some-channel");

        let old_path = source_dir.join("old/foo.mkv");
        touch(&old_path).await;
        touch(&source_dir.join("old/foo.nfo")).await;
        touch(&source_dir.join("old/foo.jpg")).await;

        let new_path = source_dir.join("new/bar.mkv");
        let outcome = rename_files(&old_path, &new_path, &source_dir, None)
            .await
            .unwrap();

        assert!(outcome.moved);
        assert_eq!(outcome.other_files_moved, 2);
        assert!(new_path.exists());
        assert!(source_dir.join("new/bar.nfo").exists());
        assert!(source_dir.join("new/bar.jpg").exists());
        assert!(!source_dir.join("old").exists());
        assert_eq!(outcome.directories_removed, 1);
    }

    #[tokio::test]
    async fn test_rename_same_path_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let source_dir = tmp.path().join("chan");
        let path = source_dir.join("a/foo.mkv");
        touch(&path).await;

        let outcome = rename_files(&path, &path, &source_dir, None).await.unwrap();
        assert!(!outcome.moved);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rename_adopts_orphans_by_key() {
        let tmp = tempfile::tempdir().unwrap();
        let source_dir = tmp.path().join("chan");

        let old_path = source_dir.join("old/video-abc123.mkv");
        touch(&old_path).await;
        // an orphan elsewhere in the tree carrying the key
        touch(&source_dir.join("stray/clip-abc123-extra.jpg")).await;

        let new_path = source_dir.join("new/renamed-abc123.mkv");
        let outcome = rename_files(&old_path, &new_path, &source_dir, Some("abc123"))
            .await
            .unwrap();

        assert!(outcome.moved);
        assert!(new_path.exists());
        // orphan adopted into the new parent under the new stem
        assert!(source_dir.join("new/renamed-abc123.jpg").exists());
        assert!(!source_dir.join("stray/clip-abc123-extra.jpg").exists());
    }

    #[tokio::test]
    async fn test_rename_does_not_clobber_existing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let source_dir = tmp.path().join("chan");

        let old_path = source_dir.join("old/foo.mkv");
        let new_path = source_dir.join("new/bar.mkv");
        touch(&old_path).await;
        touch(&new_path).await;

        let outcome = rename_files(&old_path, &new_path, &source_dir, None)
            .await
            .unwrap();
        assert!(!outcome.moved);
        assert!(old_path.exists());
    }
}
