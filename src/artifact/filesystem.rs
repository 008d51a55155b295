//! Filesystem utilities shared by the extractor, merger and exporter.
//!
//! All copies preserve permission bits and recreate symbolic links instead of
//! following them; runtime trees rely on versioned-library symlink chains.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::cancel::CancelToken;

/// Marker error returned when a copy stops because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCancelled;

impl std::fmt::Display for CopyCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("copy cancelled")
    }
}

impl std::error::Error for CopyCancelled {}

/// Remove whatever sits at `path` (file, symlink or directory).
///
/// Never follows a symlink: a link to a directory is unlinked, not emptied.
pub fn remove_existing(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading metadata '{}'", path.display()))
        }
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing existing directory '{}'", path.display()))
    } else {
        fs::remove_file(path)
            .with_context(|| format!("removing existing file/symlink '{}'", path.display()))
    }
}

/// Copy one non-directory entry, replacing whatever is at `dst`.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("reading metadata '{}'", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    }

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("reading link target for '{}'", src.display()))?;
        remove_existing(dst)?;
        symlink(&target, dst).with_context(|| {
            format!(
                "creating symlink '{}' -> '{}'",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(());
    }

    if !meta.is_file() {
        bail!(
            "unsupported file type at '{}' (only regular files, directories and symlinks are copied)",
            src.display()
        );
    }

    // A symlink or directory in the way is replaced, never written through.
    if let Ok(existing) = fs::symlink_metadata(dst) {
        if existing.file_type().is_symlink() || existing.is_dir() {
            remove_existing(dst)?;
        }
    }
    fs::copy(src, dst).with_context(|| {
        format!(
            "copying file from '{}' to '{}'",
            src.display(),
            dst.display()
        )
    })?;
    fs::set_permissions(dst, fs::Permissions::from_mode(meta.permissions().mode()))
        .with_context(|| format!("setting permissions on '{}'", dst.display()))?;
    Ok(())
}

/// Make sure `dst` is a real directory, replacing a file or symlink in the way.
pub fn ensure_real_dir(dst: &Path) -> Result<()> {
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => remove_existing(dst)?,
        Err(_) => {}
    }
    fs::create_dir_all(dst).with_context(|| format!("creating directory '{}'", dst.display()))
}

/// Refuse `root/rel` when an existing ancestor below `root` is a symlink or
/// not a directory, so a write cannot be redirected outside `root`.
///
/// `rel` must be relative; `..` components are rejected outright.
pub fn ensure_no_symlink_parents(root: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        match component {
            Component::Normal(part) => current.push(part),
            Component::CurDir => continue,
            _ => bail!("'{}' is not a plain relative path", rel.display()),
        }
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => bail!(
                "'{}' is a symlink; refusing to write '{}' through it",
                current.display(),
                rel.display()
            ),
            Ok(meta) if !meta.is_dir() => bail!(
                "'{}' is not a directory; cannot write '{}'",
                current.display(),
                rel.display()
            ),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading metadata '{}'", current.display()))
            }
        }
    }
    Ok(())
}

/// Recursively layer `src` onto `dst`.
///
/// Existing content in `dst` that `src` does not name is kept. `visit` is
/// called with the relative path of every non-directory entry written.
/// Directory modes are applied after their contents so read-only directories
/// can still be populated.
pub fn copy_dir_recursive(
    src: &Path,
    dst: &Path,
    cancel: &CancelToken,
    visit: &mut dyn FnMut(&Path),
) -> Result<()> {
    ensure_real_dir(dst)?;
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        if cancel.is_cancelled() {
            return Err(CopyCancelled.into());
        }
        let entry =
            entry.with_context(|| format!("walking source tree '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            ensure_real_dir(&target)?;
            let mode = entry
                .metadata()
                .with_context(|| format!("reading metadata '{}'", entry.path().display()))?
                .permissions()
                .mode();
            dir_modes.push((target, mode));
        } else {
            copy_entry(entry.path(), &target)?;
            visit(rel);
        }
    }

    let root_mode = fs::metadata(src)
        .with_context(|| format!("reading metadata '{}'", src.display()))?
        .permissions()
        .mode();
    dir_modes.push((dst.to_path_buf(), root_mode));
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting permissions on '{}'", dir.display()))?;
    }
    Ok(())
}

/// Atomically publish `staged` at `dst`, replacing any previous tree.
///
/// Both paths must live on the same filesystem.
pub fn replace_dir(staged: &Path, dst: &Path) -> Result<()> {
    if staged == dst {
        return Ok(());
    }
    if fs::symlink_metadata(dst).is_ok() {
        remove_existing(dst)?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    }
    fs::rename(staged, dst).with_context(|| {
        format!(
            "renaming '{}' -> '{}'",
            staged.display(),
            dst.display()
        )
    })
}

pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Content digest of a tree: relative paths, entry kinds, modes, file
/// contents and link targets, in sorted order. Entries named in `skip` are
/// pruned at any depth.
pub fn tree_digest(root: &Path, skip: &[&str]) -> Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !skip.contains(&name))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking tree '{}'", root.display()))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let meta = fs::symlink_metadata(entry.path())
            .with_context(|| format!("reading metadata '{}'", entry.path().display()))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if meta.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(b"l");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if meta.is_dir() {
            hasher.update(b"d");
            hasher.update(meta.permissions().mode().to_le_bytes());
        } else {
            let (sha, _) = sha256_file(entry.path())?;
            hasher.update(b"f");
            hasher.update(meta.permissions().mode().to_le_bytes());
            hasher.update(sha.as_bytes());
        }
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
