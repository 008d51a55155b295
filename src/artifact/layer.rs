//! Export of an assembled tree as a reproducible image layer.
//!
//! The layer is a zstd-compressed tar with normalized metadata (mtime 0,
//! uid/gid 0, sorted entries), accompanied by an image config carrying the
//! labels and the layer's `diff_id`.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, EntryType, Header};
use walkdir::WalkDir;

use crate::artifact::filesystem::sha256_file;
use crate::stage_runs::write_json_atomic;

/// Writer that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub archive: PathBuf,
    pub config: PathBuf,
    /// `sha256:` digest of the uncompressed tar.
    pub diff_id: String,
    /// `sha256:` digest of the compressed archive.
    pub digest: String,
    pub size: u64,
    pub entries: usize,
}

#[derive(Debug, Serialize)]
struct ImageConfig<'a> {
    architecture: &'static str,
    os: &'static str,
    config: ImageRuntimeConfig<'a>,
    rootfs: ImageRootfs,
}

#[derive(Debug, Serialize)]
struct ImageRuntimeConfig<'a> {
    #[serde(rename = "Labels")]
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ImageRootfs {
    #[serde(rename = "type")]
    kind: &'static str,
    diff_ids: Vec<String>,
}

fn image_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Pack `src_dir` into `<out_dir>/<name>.tar.zst` and write
/// `<out_dir>/<name>.config.json`.
pub fn export_layer(
    src_dir: &Path,
    out_dir: &Path,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<LayerSummary> {
    if !src_dir.is_dir() {
        anyhow::bail!("cannot export '{}': not a directory", src_dir.display());
    }
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory '{}'", out_dir.display()))?;
    let archive = out_dir.join(format!("{name}.tar.zst"));
    let config = out_dir.join(format!("{name}.config.json"));

    let (diff_id, entries) = write_layer(src_dir, &archive)?;
    let (digest, size) = sha256_file(&archive)?;

    let image_config = ImageConfig {
        architecture: image_architecture(),
        os: "linux",
        config: ImageRuntimeConfig { labels },
        rootfs: ImageRootfs {
            kind: "layers",
            diff_ids: vec![format!("sha256:{diff_id}")],
        },
    };
    write_json_atomic(&config, &image_config)
        .with_context(|| format!("writing image config '{}'", config.display()))?;

    Ok(LayerSummary {
        archive,
        config,
        diff_id: format!("sha256:{diff_id}"),
        digest: format!("sha256:{digest}"),
        size,
        entries,
    })
}

fn write_layer(src_dir: &Path, out_path: &Path) -> Result<(String, usize)> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(HashingWriter::new(encoder));

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(src_dir).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("walking '{}'", src_dir.display()))?;
        entries.push(entry.path().to_path_buf());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    let count = entries.len();
    for path in entries {
        let rel = path.strip_prefix(src_dir).unwrap_or(&path).to_path_buf();
        let md = fs::symlink_metadata(&path)
            .with_context(|| format!("reading metadata '{}'", path.display()))?;

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(md.permissions().mode());

        if md.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else if md.is_file() {
            let mut file = File::open(&path)?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, &mut file)?;
        }
    }

    let hashing = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    let (encoder, diff_id) = hashing.finish();
    encoder.finish()?;
    Ok((diff_id, count))
}
