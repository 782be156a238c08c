//! Filesystem helpers for provisioning.
//!
//! Goals:
//! - Async I/O (tokio); blocking zip work runs on the blocking pool
//! - Retry transient errors on small writes/renames
//! - Atomic metadata writes (temp file + rename)
//! - Never follow symlinks when walking a document root

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Walk `root` (inclusive) without following symlinks. Symlinks are reported but not descended.
pub async fn walk_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: files] walk_tree entered (root={:?})",
        root
    );

    let root_meta = tokio::fs::symlink_metadata(root)
        .await
        .with_context(|| format!("stat failed: {:?}", root))?;
    let mut out = vec![TreeEntry {
        path: root.to_path_buf(),
        kind: kind_of(&root_meta),
    }];
    if !root_meta.is_dir() {
        return Ok(out);
    }

    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", dir))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            // DirEntry::metadata does not traverse symlinks.
            let meta = ent.metadata().await?;
            let kind = kind_of(&meta);
            if kind == EntryKind::Dir {
                stack.push(p.clone());
            }
            out.push(TreeEntry { path: p, kind });
        }
    }

    debug!(
        "[PHASE: installation] [STEP: files] walk_tree exit (entries={}, duration_ms={})",
        out.len(),
        started.elapsed().as_millis()
    );
    Ok(out)
}

fn kind_of(meta: &std::fs::Metadata) -> EntryKind {
    let ft = meta.file_type();
    if ft.is_symlink() {
        EntryKind::Symlink
    } else if ft.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

/// Unpack a zip archive into `dest`, overwriting existing files.
///
/// When every entry lives under one top-level directory, that directory is stripped. Entries
/// with absolute paths or `..` components abort the unpack. Returns the number of files written.
pub async fn unpack_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let started = Instant::now();
    info!(
        "[PHASE: installation] [STEP: unpack] unpack_zip entered (archive={:?}, dest={:?})",
        archive, dest
    );

    let written = tokio::task::spawn_blocking(move || unpack_zip_blocking(&archive, &dest))
        .await
        .context("unpack task join failed")??;

    info!(
        "[PHASE: installation] [STEP: unpack] unpack_zip exit (files={}, duration_ms={})",
        written,
        started.elapsed().as_millis()
    );
    Ok(written)
}

fn unpack_zip_blocking(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).with_context(|| format!("open archive failed: {:?}", archive))?;
    let mut zip = zip::ZipArchive::new(file).context("not a valid zip archive")?;

    let mut names: Vec<PathBuf> = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let name = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Archive entry escapes destination: {}", entry.name()))?;
        names.push(name);
    }
    let strip = common_top_level(&zip_entry_shapes(&mut zip, &names)?);

    std::fs::create_dir_all(dest).with_context(|| format!("create_dir_all failed: {:?}", dest))?;

    let mut written = 0usize;
    for (i, name) in names.iter().enumerate() {
        let relative = match &strip {
            Some(prefix) => match name.strip_prefix(prefix) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => name.clone(),
            },
            None => name.clone(),
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("Archive entry escapes destination: {:?}", name);
        }

        let target = dest.join(&relative);
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create_dir_all failed: {:?}", target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all failed: {:?}", parent))?;
        }
        // Replace rather than write through an existing symlink.
        if let Ok(meta) = std::fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() {
                std::fs::remove_file(&target)?;
            }
        }
        let mut out =
            File::create(&target).with_context(|| format!("create failed: {:?}", target))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("write failed: {:?}", target))?;

        if let Some(mode) = entry.unix_mode() {
            apply_archived_mode(&target, mode);
        }
        written += 1;
    }

    Ok(written)
}

/// Carry the archived permission bits over. A failure leaves the default mode in place.
fn apply_archived_mode(target: &Path, mode: u32) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o777)) {
            warn!(
                "[PHASE: installation] [STEP: unpack] chmod {:o} failed (path={:?}, error={:?})",
                mode & 0o777,
                target,
                e
            );
            return false;
        }
        true
    }
    #[cfg(not(unix))]
    {
        let _ = (target, mode);
        true
    }
}

fn zip_entry_shapes(
    zip: &mut zip::ZipArchive<File>,
    names: &[PathBuf],
) -> Result<Vec<(PathBuf, bool)>> {
    let mut shapes = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let is_dir = zip.by_index(i)?.is_dir();
        shapes.push((name.clone(), is_dir));
    }
    Ok(shapes)
}

/// The single directory every entry lives under, if there is one.
fn common_top_level(entries: &[(PathBuf, bool)]) -> Option<PathBuf> {
    let mut prefix: Option<PathBuf> = None;
    for (name, is_dir) in entries {
        let mut comps = name.components();
        let first = PathBuf::from(comps.next()?.as_os_str());
        let has_rest = comps.next().is_some();
        if !has_rest && !is_dir {
            // A file at the archive root.
            return None;
        }
        match &prefix {
            None => prefix = Some(first),
            Some(p) if *p == first => {}
            Some(_) => return None,
        }
    }
    prefix
}

pub async fn ensure_dir_with_retries(path: &Path, label: &str) -> Result<()> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        match timeout(Duration::from_secs(5), tokio::fs::create_dir_all(path)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: installation] [STEP: fs] {} failed (attempt={}, path={:?}, error={:?})",
                    label, attempt, path, e
                );
                last_err = Some(anyhow::anyhow!(e));
            }
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: fs] {} timed out (attempt={}, path={:?})",
                    label, attempt, path
                );
                last_err = Some(anyhow::anyhow!("create_dir_all timed out"));
            }
        }

        let backoff_ms = 50_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to create directory")))
}

async fn rename_with_retries(from: &Path, to: &Path, label: &str) -> Result<()> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        match timeout(Duration::from_secs(5), tokio::fs::rename(from, to)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: installation] [STEP: fs] {} failed (attempt={}, from={:?}, to={:?}, error={:?})",
                    label, attempt, from, to, e
                );
                last_err = Some(anyhow::anyhow!(e));
            }
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: fs] {} timed out (attempt={}, from={:?}, to={:?})",
                    label, attempt, from, to
                );
                last_err = Some(anyhow::anyhow!("rename timed out"));
            }
        }
        let backoff_ms = 50_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to rename file")))
}

/// Write `bytes` to `path` atomically: readers see the old file or the complete new one.
pub async fn write_file_atomic(path: &Path, bytes: &[u8], label: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {:?}", path))?;
    ensure_dir_with_retries(parent, label).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    timeout(Duration::from_secs(10), tokio::fs::write(&tmp, bytes))
        .await
        .map_err(|_| anyhow::anyhow!("write timed out: {:?}", tmp))?
        .with_context(|| format!("write failed: {:?}", tmp))?;

    if let Err(e) = rename_with_retries(&tmp, path, label).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    debug!(
        "[PHASE: installation] [STEP: fs] {} ok (path={:?}, bytes={})",
        label,
        path,
        bytes.len()
    );
    Ok(())
}

/// Remove a directory tree if it exists. Missing paths are not an error.
pub async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(anyhow::Error::new(e)).with_context(|| format!("remove_dir_all failed: {:?}", path)),
    }
}

/// Delete everything inside `root` but keep `root` itself (it may be a mount point or owned
/// by the hosting account).
pub async fn clear_dir_contents(root: &Path) -> Result<usize> {
    let mut removed = 0usize;
    let mut rd = match tokio::fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(anyhow::Error::new(e)).with_context(|| format!("read_dir failed: {:?}", root)),
    };
    while let Some(ent) = rd.next_entry().await? {
        let p = ent.path();
        let meta = ent.metadata().await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&p)
                .await
                .with_context(|| format!("remove_dir_all failed: {:?}", p))?;
        } else {
            tokio::fs::remove_file(&p)
                .await
                .with_context(|| format!("remove_file failed: {:?}", p))?;
        }
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
pub(crate) fn build_test_zip(path: &Path, entries: &[(&str, &[u8])]) {
    use std::io::Write;
    use zip::write::FileOptions;

    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);
    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, opts).unwrap();
        } else {
            zip.start_file(*name, opts).unwrap();
            zip.write_all(content).unwrap();
        }
    }
    zip.finish().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unpack_strips_single_top_level_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("release.zip");
        build_test_zip(
            &archive,
            &[
                ("whmcs/", b""),
                ("whmcs/index.php", b"<?php"),
                ("whmcs/install/bin/installer.php", b"<?php"),
            ],
        );
        let dest = tmp.path().join("site");
        let written = unpack_zip(&archive, &dest).await.unwrap();
        assert_eq!(written, 2);
        assert!(dest.join("index.php").is_file());
        assert!(dest.join("install/bin/installer.php").is_file());
        assert!(!dest.join("whmcs").exists());
    }

    #[tokio::test]
    async fn unpack_keeps_layout_without_common_root() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("release.zip");
        build_test_zip(&archive, &[("index.php", b"a"), ("admin/index.php", b"b")]);
        let dest = tmp.path().join("site");
        unpack_zip(&archive, &dest).await.unwrap();
        assert!(dest.join("index.php").is_file());
        assert!(dest.join("admin/index.php").is_file());
    }

    #[tokio::test]
    async fn unpack_overwrites_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("release.zip");
        build_test_zip(&archive, &[("index.php", b"new")]);
        let dest = tmp.path().join("site");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("index.php"), b"old").unwrap();
        unpack_zip(&archive, &dest).await.unwrap();
        assert_eq!(std::fs::read(dest.join("index.php")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn archived_mode_failure_is_reported_not_raised() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("cron.php");
        std::fs::write(&file, b"<?php").unwrap();

        assert!(apply_archived_mode(&file, 0o100600));
        assert_eq!(std::fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o600);
        assert!(!apply_archived_mode(&tmp.path().join("vanished.php"), 0o644));
    }

    #[tokio::test]
    async fn unpack_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("release.zip");
        std::fs::write(&archive, b"<html>not found</html>").unwrap();
        assert!(unpack_zip(&archive, &tmp.path().join("site")).await.is_err());
    }

    #[test]
    fn common_top_level_rules() {
        let shapes = vec![
            (PathBuf::from("whmcs/a.php"), false),
            (PathBuf::from("whmcs/b"), true),
        ];
        assert_eq!(common_top_level(&shapes), Some(PathBuf::from("whmcs")));

        let mixed = vec![
            (PathBuf::from("whmcs/a.php"), false),
            (PathBuf::from("other/b.php"), false),
        ];
        assert_eq!(common_top_level(&mixed), None);

        let root_file = vec![(PathBuf::from("README"), false)];
        assert_eq!(common_top_level(&root_file), None);
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta").join("abc.json");
        write_file_atomic(&path, b"{\"v\":1}", "test").await.unwrap();
        write_file_atomic(&path, b"{\"v\":2}", "test").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"v\":2}");
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn walk_tree_does_not_follow_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("site");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let entries = walk_tree(&root).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.path == root.join("link") && e.kind == EntryKind::Symlink));
        assert!(!entries.iter().any(|e| e.path.ends_with("secret.txt")));
    }

    #[tokio::test]
    async fn clear_dir_contents_keeps_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("site");
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("index.php"), b"x").unwrap();
        assert_eq!(clear_dir_contents(&root).await.unwrap(), 2);
        assert!(root.is_dir());
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
        assert!(!remove_dir_if_exists(&tmp.path().join("missing")).await.unwrap());
    }
}
