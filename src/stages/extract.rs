//! Runtime extractor: copies one subtree out of a prebuilt base image.
//!
//! A base image is a directory, a (zstd-compressed) tar archive, or a
//! container image reference prefixed with `docker://`. Permissions and
//! symbolic links inside the extracted subtree are preserved.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

use crate::artifact::filesystem::{
    copy_dir_recursive, copy_entry, ensure_no_symlink_parents, ensure_real_dir, remove_existing,
    CopyCancelled,
};
use crate::cancel::CancelToken;
use crate::error::{AssemblyError, Result};
use crate::process::{CommandRunner, CommandSpec};
use crate::stages::{blocking, copy_failure, failure_detail, process_failure};

pub const DOCKER_PREFIX: &str = "docker://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    Directory(PathBuf),
    Archive(PathBuf),
    Docker(String),
}

impl BaseImage {
    /// Classify an image reference; relative paths resolve against `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Self {
        if let Some(reference) = raw.strip_prefix(DOCKER_PREFIX) {
            return BaseImage::Docker(reference.to_string());
        }
        let path = crate::pipeline::paths::resolve_against(base_dir, raw);
        if is_archive(&path) {
            BaseImage::Archive(path)
        } else {
            BaseImage::Directory(path)
        }
    }
}

impl std::fmt::Display for BaseImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseImage::Directory(path) | BaseImage::Archive(path) => write!(f, "{}", path.display()),
            BaseImage::Docker(reference) => write!(f, "{DOCKER_PREFIX}{reference}"),
        }
    }
}

fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tar.zst") || name.ends_with(".tzst")
}

fn is_zstd(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".zst") || name.ends_with(".tzst")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSpec {
    pub stage: String,
    pub image: BaseImage,
    /// Normalized path inside the image; empty means the whole image.
    pub path: PathBuf,
}

/// Extract `spec.path` from the image into `staging/tree`, returning that path.
pub async fn extract_runtime(
    runner: &dyn CommandRunner,
    spec: &ExtractSpec,
    staging: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let tree = staging.join("tree");
    remove_existing(&tree).map_err(|err| extraction(&spec.stage, format!("{err:#}")))?;
    fs::create_dir_all(staging)?;

    info!(stage = %spec.stage, image = %spec.image, path = %spec.path.display(), "extracting runtime");
    match &spec.image {
        BaseImage::Docker(reference) => {
            extract_from_container(runner, spec, reference, &tree, timeout, cancel).await?
        }
        BaseImage::Directory(dir) => {
            let (stage, dir, inner, dst, cancel) = (
                spec.stage.clone(),
                dir.clone(),
                spec.path.clone(),
                tree.clone(),
                cancel.clone(),
            );
            blocking(&spec.stage, move || {
                extract_from_directory(&dir, &inner, &dst, &cancel)
                    .map_err(|err| copy_failure(&stage, err, |reason| extraction(&stage, reason)))
            })
            .await?
        }
        BaseImage::Archive(archive) => {
            let (stage, archive, inner, dst, cancel) = (
                spec.stage.clone(),
                archive.clone(),
                spec.path.clone(),
                tree.clone(),
                cancel.clone(),
            );
            blocking(&spec.stage, move || {
                extract_from_archive(&archive, &inner, &dst, &cancel)
                    .map_err(|err| copy_failure(&stage, err, |reason| extraction(&stage, reason)))
            })
            .await?
        }
    }

    info!(stage = %spec.stage, "runtime extracted");
    Ok(tree)
}

fn extraction(stage: &str, reason: impl Into<String>) -> AssemblyError {
    AssemblyError::Extraction {
        stage: stage.to_string(),
        reason: reason.into(),
    }
}

fn extract_from_directory(
    image: &Path,
    inner: &Path,
    dst: &Path,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    if !image.is_dir() {
        bail!("base image directory '{}' does not exist", image.display());
    }
    let src = image.join(inner);
    let meta = fs::symlink_metadata(&src).with_context(|| {
        format!(
            "path '/{}' not found in base image '{}'",
            inner.display(),
            image.display()
        )
    })?;
    if meta.is_dir() {
        copy_dir_recursive(&src, dst, cancel, &mut |_: &Path| {})
    } else {
        copy_entry(&src, dst)
    }
}

/// Strip `wanted` from an archive member path. `None` when the member is
/// outside `wanted` or tries to climb out of the archive root.
fn member_under(raw: &Path, wanted: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    normalized.strip_prefix(wanted).ok().map(Path::to_path_buf)
}

fn extract_from_archive(
    archive_path: &Path,
    inner: &Path,
    dst: &Path,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening base image archive '{}'", archive_path.display()))?;
    let reader: Box<dyn Read> = if is_zstd(archive_path) {
        Box::new(zstd::stream::read::Decoder::new(file).with_context(|| {
            format!("opening zstd stream '{}'", archive_path.display())
        })?)
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut matched = false;
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    let mut hard_links: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in archive
        .entries()
        .with_context(|| format!("reading archive '{}'", archive_path.display()))?
    {
        if cancel.is_cancelled() {
            return Err(CopyCancelled.into());
        }
        let mut entry = entry.context("reading archive entry")?;
        let raw = entry.path().context("decoding entry path")?.into_owned();
        let Some(rel) = member_under(&raw, inner) else {
            continue;
        };
        matched = true;
        // Links unpacked by earlier members must not redirect later ones.
        ensure_no_symlink_parents(dst, &rel)
            .with_context(|| format!("unpacking '{}'", raw.display()))?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(&rel)
        };

        match entry.header().entry_type() {
            EntryType::Directory => {
                ensure_real_dir(&target)?;
                dir_modes.push((target, entry.header().mode().unwrap_or(0o755)));
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .context("decoding hard link target")?
                    .map(|name| name.into_owned())
                    .with_context(|| format!("hard link '{}' has no target", raw.display()))?;
                hard_links.push((link, target));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::Symlink => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating '{}'", parent.display()))?;
                }
                remove_existing(&target)?;
                entry
                    .unpack(&target)
                    .with_context(|| format!("unpacking '{}'", raw.display()))?;
            }
            other => debug!(path = %raw.display(), kind = ?other, "skipping special archive entry"),
        }
    }

    if !matched {
        bail!(
            "path '/{}' not found in base image '{}'",
            inner.display(),
            archive_path.display()
        );
    }

    // Hard links become independent copies of their already-unpacked target.
    for (link, target) in hard_links {
        let Some(rel) = member_under(&link, inner) else {
            bail!(
                "hard link '{}' points outside '/{}'",
                target.display(),
                inner.display()
            );
        };
        let target_rel = target.strip_prefix(dst).unwrap_or(target.as_path());
        for checked in [rel.as_path(), target_rel] {
            ensure_no_symlink_parents(dst, checked)
                .with_context(|| format!("linking '{}'", target.display()))?;
        }
        copy_entry(&dst.join(&rel), &target)?;
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting permissions on '{}'", dir.display()))?;
    }
    Ok(())
}

async fn extract_from_container(
    runner: &dyn CommandRunner,
    spec: &ExtractSpec,
    reference: &str,
    tree: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let fail = |reason: String| extraction(&spec.stage, reason);

    let create = CommandSpec::new("docker").args(["create", reference]);
    let output = runner
        .run(&create, timeout, cancel)
        .await
        .map_err(|err| process_failure(&spec.stage, err, fail))?;
    if !output.success() {
        return Err(fail(failure_detail(&create.display(), &output)));
    }
    let container = output.stdout.trim().to_string();
    if container.is_empty() {
        return Err(fail("docker create printed no container id".to_string()));
    }

    let copy = CommandSpec::new("docker").args([
        "cp".to_string(),
        format!("{container}:/{}", spec.path.display()),
        tree.display().to_string(),
    ]);
    let copied = runner.run(&copy, timeout, cancel).await;

    // The container is removed on every outcome, including cancellation.
    let remove = CommandSpec::new("docker").args(["rm", "-f", container.as_str()]);
    match runner.run(&remove, timeout, &CancelToken::new()).await {
        Ok(output) if output.success() => debug!(container = %container, "removed container"),
        Ok(output) => warn!(container = %container, detail = %output.tail(5), "failed to remove container"),
        Err(err) => warn!(container = %container, error = %err, "failed to remove container"),
    }

    let copied = copied.map_err(|err| process_failure(&spec.stage, err, fail))?;
    if !copied.success() {
        return Err(fail(failure_detail(&copy.display(), &copied)));
    }
    if fs::symlink_metadata(tree).is_err() {
        return Err(fail(format!(
            "path '/{}' not found in image '{reference}'",
            spec.path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ok, ScriptedRunner};
    use crate::process::CommandOutput;
    use std::io::Write;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn spec(image: BaseImage, path: &str) -> ExtractSpec {
        ExtractSpec {
            stage: "toolsuite".into(),
            image,
            path: PathBuf::from(path),
        }
    }

    fn mode_of(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn build_archive(path: &Path, compress: bool) {
        let file = File::create(path).unwrap();
        let writer: Box<dyn std::io::Write> = if compress {
            Box::new(zstd::stream::write::Encoder::new(file, 3).unwrap().auto_finish())
        } else {
            Box::new(file)
        };
        let mut builder = tar::Builder::new(writer);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "root/miniconda3/bin", std::io::empty()).unwrap();

        let body = b"#!/root/miniconda3/bin/python3\nprint('hi')\n";
        let mut file = tar::Header::new_gnu();
        file.set_entry_type(EntryType::Regular);
        file.set_mode(0o755);
        file.set_size(body.len() as u64);
        builder
            .append_data(&mut file, "root/miniconda3/bin/tool", &body[..])
            .unwrap();

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_mode(0o777);
        link.set_size(0);
        builder
            .append_link(&mut link, "root/miniconda3/bin/tool-link", "tool")
            .unwrap();

        let mut hard = tar::Header::new_gnu();
        hard.set_entry_type(EntryType::Link);
        hard.set_mode(0o755);
        hard.set_size(0);
        builder
            .append_link(&mut hard, "root/miniconda3/bin/tool-hard", "root/miniconda3/bin/tool")
            .unwrap();

        let other = b"unrelated";
        let mut outside = tar::Header::new_gnu();
        outside.set_entry_type(EntryType::Regular);
        outside.set_mode(0o644);
        outside.set_size(other.len() as u64);
        builder.append_data(&mut outside, "etc/os-release", &other[..]).unwrap();

        builder.into_inner().unwrap().flush().unwrap();
    }

    #[test]
    fn parse_classifies_image_references() {
        let base = Path::new("/defs");
        assert_eq!(
            BaseImage::parse("docker://continuumio/miniconda3:4.9.2", base),
            BaseImage::Docker("continuumio/miniconda3:4.9.2".into())
        );
        assert_eq!(
            BaseImage::parse("images/conda.tar.zst", base),
            BaseImage::Archive(PathBuf::from("/defs/images/conda.tar.zst"))
        );
        assert_eq!(
            BaseImage::parse("/srv/rootfs", base),
            BaseImage::Directory(PathBuf::from("/srv/rootfs"))
        );
    }

    #[tokio::test]
    async fn directory_image_keeps_modes_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("image");
        let bin = image.join("root/miniconda3/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("python3.9"), "elf").unwrap();
        fs::set_permissions(bin.join("python3.9"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("python3.9", bin.join("python3")).unwrap();

        let tree = extract_runtime(
            &ScriptedRunner::new(),
            &spec(BaseImage::Directory(image), "root/miniconda3"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(mode_of(&tree.join("bin/python3.9")), 0o755);
        assert_eq!(
            fs::read_link(tree.join("bin/python3")).unwrap(),
            PathBuf::from("python3.9")
        );
    }

    #[tokio::test]
    async fn missing_path_is_an_extraction_error() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("image");
        fs::create_dir_all(&image).unwrap();

        let err = extract_runtime(
            &ScriptedRunner::new(),
            &spec(BaseImage::Directory(image), "root/miniconda3"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AssemblyError::Extraction { .. }), "{err}");
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[tokio::test]
    async fn archive_image_extracts_only_requested_subtree() {
        for compress in [false, true] {
            let temp = TempDir::new().unwrap();
            let name = if compress { "image.tar.zst" } else { "image.tar" };
            let archive = temp.path().join(name);
            build_archive(&archive, compress);

            let tree = extract_runtime(
                &ScriptedRunner::new(),
                &spec(BaseImage::Archive(archive), "root/miniconda3"),
                &temp.path().join("staging"),
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(mode_of(&tree.join("bin/tool")), 0o755);
            assert_eq!(
                fs::read_link(tree.join("bin/tool-link")).unwrap(),
                PathBuf::from("tool")
            );
            assert_eq!(
                fs::read(tree.join("bin/tool-hard")).unwrap(),
                fs::read(tree.join("bin/tool")).unwrap()
            );
            assert!(!tree.join("etc").exists());
        }
    }

    #[tokio::test]
    async fn archive_without_requested_path_fails() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("image.tar");
        build_archive(&archive, false);

        let err = extract_runtime(
            &ScriptedRunner::new(),
            &spec(BaseImage::Archive(archive), "opt/conda"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AssemblyError::Extraction { .. }), "{err}");
    }

    #[tokio::test]
    async fn archive_symlink_cannot_redirect_later_members() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let archive = temp.path().join("image.tar");

        let mut builder = tar::Builder::new(File::create(&archive).unwrap());
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_mode(0o777);
        link.set_size(0);
        builder.append_link(&mut link, "opt/rt/lib", &outside).unwrap();
        let body = b"payload";
        let mut file = tar::Header::new_gnu();
        file.set_entry_type(EntryType::Regular);
        file.set_mode(0o644);
        file.set_size(body.len() as u64);
        builder.append_data(&mut file, "opt/rt/lib/pwned", &body[..]).unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let err = extract_runtime(
            &ScriptedRunner::new(),
            &spec(BaseImage::Archive(archive), "opt/rt"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AssemblyError::Extraction { .. }), "{err}");
        assert!(!outside.join("pwned").exists());
    }

    #[tokio::test]
    async fn container_is_removed_even_when_copy_fails() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("docker", |cmd| match cmd.args[0].as_str() {
            "create" => Ok(CommandOutput {
                code: Some(0),
                stdout: "c0ffee\n".into(),
                stderr: String::new(),
            }),
            "cp" => exit(1, "Error: No such container:path: c0ffee:/root/miniconda3"),
            _ => ok(),
        });

        let err = extract_runtime(
            &runner,
            &spec(BaseImage::Docker("miniconda3:4.9.2".into()), "root/miniconda3"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AssemblyError::Extraction { .. }), "{err}");
        let calls = runner.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.args, vec!["rm", "-f", "c0ffee"]);
        assert_eq!(calls[1].args[1], "c0ffee:/root/miniconda3");
    }

    #[tokio::test]
    async fn container_copy_lands_in_staging_tree() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("docker", |cmd| match cmd.args[0].as_str() {
            "create" => Ok(CommandOutput {
                code: Some(0),
                stdout: "abc123".into(),
                stderr: String::new(),
            }),
            "cp" => {
                let dest = PathBuf::from(&cmd.args[2]);
                fs::create_dir_all(dest.join("bin")).unwrap();
                ok()
            }
            _ => ok(),
        });

        let tree = extract_runtime(
            &runner,
            &spec(BaseImage::Docker("miniconda3".into()), "root/miniconda3"),
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(tree.join("bin").is_dir());
        assert_eq!(runner.calls().len(), 3);
    }
}
