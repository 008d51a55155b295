//! Interpreter-line rewriting for relocated runtimes.
//!
//! Scripts copied out of a base image keep `#!` lines pointing at the
//! original install prefix. The rewriter replaces a matching prefix on the
//! first line only and leaves every other byte of the file untouched.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{AssemblyError, Result, RewriteWarning};

const SHEBANG: &[u8] = b"#!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    match_prefix: String,
    replace_prefix: String,
}

impl RewriteRule {
    pub fn new(match_prefix: impl Into<String>, replace_prefix: impl Into<String>) -> Result<Self> {
        let match_prefix = match_prefix.into();
        let replace_prefix = replace_prefix.into();
        for (field, value) in [("match_prefix", &match_prefix), ("replace_prefix", &replace_prefix)] {
            if !value.starts_with('/') {
                return Err(AssemblyError::Validation(format!(
                    "rewrite rule {field} must be a non-empty absolute path, got '{value}'"
                )));
            }
        }
        if match_prefix.contains('\n') || replace_prefix.contains('\n') {
            return Err(AssemblyError::Validation(
                "rewrite rule prefixes must be single-line".to_string(),
            ));
        }
        Ok(Self {
            match_prefix,
            replace_prefix,
        })
    }

    pub fn match_prefix(&self) -> &str {
        &self.match_prefix
    }

    pub fn replace_prefix(&self) -> &str {
        &self.replace_prefix
    }

    /// Rewrite an interpreter line (without its newline).
    ///
    /// Returns `None` when the rule does not apply, including when the line
    /// already carries the replacement so repeated runs are no-ops.
    pub fn apply(&self, line: &[u8]) -> Option<Vec<u8>> {
        let rest = line.strip_prefix(SHEBANG)?;
        let blanks = rest
            .iter()
            .take_while(|byte| **byte == b' ' || **byte == b'\t')
            .count();
        let (padding, interpreter) = rest.split_at(blanks);

        let from = self.match_prefix.as_bytes();
        let to = self.replace_prefix.as_bytes();
        if to.starts_with(from) && interpreter.starts_with(to) {
            return None;
        }
        let tail = interpreter.strip_prefix(from)?;

        let mut out = Vec::with_capacity(line.len() + to.len());
        out.extend_from_slice(SHEBANG);
        out.extend_from_slice(padding);
        out.extend_from_slice(to);
        out.extend_from_slice(tail);
        Some(out)
    }
}

/// Reject rule sets where one rule's output is another rule's input.
///
/// A chained set rewrites `/a` to `/b` on one pass and `/b` to `/c` on the
/// next, so repeated runs would not converge.
pub fn check_rule_chain(rules: &[RewriteRule]) -> Result<()> {
    for (i, produced) in rules.iter().enumerate() {
        for (j, consumed) in rules.iter().enumerate() {
            if i != j && produced.replace_prefix.starts_with(&consumed.match_prefix) {
                return Err(AssemblyError::Validation(format!(
                    "rewrite rule '{}' -> '{}' produces paths matched by rule '{}' -> '{}'",
                    produced.match_prefix,
                    produced.replace_prefix,
                    consumed.match_prefix,
                    consumed.replace_prefix
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RewriteReport {
    pub scanned: usize,
    pub rewritten: Vec<PathBuf>,
    pub warnings: Vec<RewriteWarning>,
}

impl RewriteReport {
    fn merge(&mut self, other: RewriteReport) {
        self.scanned += other.scanned;
        self.rewritten.extend(other.rewritten);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    rules: Vec<RewriteRule>,
}

impl PathRewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Result<Self> {
        check_rule_chain(&rules)?;
        Ok(Self { rules })
    }

    /// First rule that changes the line wins.
    pub fn rewrite_line(&self, line: &[u8]) -> Option<Vec<u8>> {
        self.rules.iter().find_map(|rule| rule.apply(line))
    }

    /// Rewrite one file in place. `Ok(false)` when it was left untouched.
    ///
    /// The file is truncated and rewritten rather than replaced, so its
    /// inode, ownership and mode survive.
    pub fn rewrite_file(&self, path: &Path) -> std::result::Result<bool, RewriteWarning> {
        let warning = |reason: String| RewriteWarning {
            path: path.to_path_buf(),
            reason,
        };

        let meta = fs::symlink_metadata(path).map_err(|err| warning(format!("cannot stat: {err}")))?;
        if !meta.is_file() {
            return Ok(false);
        }

        let mut marker = [0u8; 2];
        let mut file = File::open(path).map_err(|err| warning(format!("cannot read: {err}")))?;
        if file.read_exact(&mut marker).is_err() || marker != SHEBANG {
            return Ok(false);
        }
        let mut contents = marker.to_vec();
        file.read_to_end(&mut contents)
            .map_err(|err| warning(format!("cannot read: {err}")))?;
        drop(file);

        let eol = contents
            .iter()
            .position(|byte| *byte == b'\n')
            .unwrap_or(contents.len());
        let Some(mut rewritten) = self.rewrite_line(&contents[..eol]) else {
            return Ok(false);
        };
        rewritten.extend_from_slice(&contents[eol..]);

        let mut out = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| warning(format!("cannot open for writing: {err}")))?;
        out.seek(SeekFrom::Start(0))
            .and_then(|_| out.write_all(&rewritten))
            .and_then(|_| out.set_len(rewritten.len() as u64))
            .map_err(|err| warning(format!("write failed: {err}")))?;
        Ok(true)
    }

    /// Rewrite every regular file below `root`. Symbolic links are not
    /// followed; problems become warnings and scanning continues.
    pub fn rewrite_tree(&self, root: &Path) -> RewriteReport {
        let mut report = RewriteReport::default();
        if fs::symlink_metadata(root).is_err() {
            report.warnings.push(RewriteWarning {
                path: root.to_path_buf(),
                reason: "rewrite root does not exist".to_string(),
            });
            return report;
        }

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    report.warnings.push(RewriteWarning {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.scanned += 1;
            match self.rewrite_file(entry.path()) {
                Ok(true) => {
                    debug!(path = %entry.path().display(), "rewrote interpreter line");
                    report.rewritten.push(entry.path().to_path_buf());
                }
                Ok(false) => {}
                Err(warning) => {
                    warn!(path = %warning.path.display(), reason = %warning.reason, "interpreter rewrite skipped");
                    report.warnings.push(warning);
                }
            }
        }
        report
    }

    /// Rewrite each target-relative root in turn; an empty list means the
    /// whole target.
    pub fn rewrite_roots(&self, target: &Path, roots: &[PathBuf]) -> RewriteReport {
        let mut report = RewriteReport::default();
        if roots.is_empty() {
            report.merge(self.rewrite_tree(target));
        } else {
            for root in roots {
                report.merge(self.rewrite_tree(&target.join(root)));
            }
        }
        info!(
            scanned = report.scanned,
            rewritten = report.rewritten.len(),
            warnings = report.warnings.len(),
            "interpreter rewrite finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use tempfile::TempDir;

    fn rewriter() -> PathRewriter {
        PathRewriter::new(vec![
            RewriteRule::new("/root/toolsuite/bin", "/usr/local").unwrap(),
            RewriteRule::new("/root/miniconda3/bin", "/usr/local/bin").unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn rewrites_matching_prefix_only_in_first_line() {
        let line = rewriter().rewrite_line(b"#!/root/toolsuite/bin/python3").unwrap();
        assert_eq!(line, b"#!/usr/local/python3");
    }

    #[test]
    fn keeps_space_after_marker_and_arguments() {
        let line = rewriter()
            .rewrite_line(b"#! /root/miniconda3/bin/python3 -u\r")
            .unwrap();
        assert_eq!(line, b"#! /usr/local/bin/python3 -u\r");
    }

    #[test]
    fn non_matching_lines_are_left_alone() {
        assert!(rewriter().rewrite_line(b"#!/bin/sh").is_none());
        assert!(rewriter().rewrite_line(b"# /root/toolsuite/bin/x").is_none());
    }

    #[test]
    fn already_rewritten_lines_are_not_rewritten_again() {
        let rule = RewriteRule::new("/opt/py", "/opt/py-relocated").unwrap();
        let once = rule.apply(b"#!/opt/py/bin/python").unwrap();
        assert_eq!(once, b"#!/opt/py-relocated/bin/python");
        assert!(rule.apply(&once).is_none());
    }

    #[test]
    fn rule_prefixes_must_be_absolute_paths() {
        assert!(RewriteRule::new("", "/usr/local").is_err());
        assert!(RewriteRule::new("/opt/py", "").is_err());
        assert!(RewriteRule::new("opt/py", "/usr/local").is_err());
    }

    #[test]
    fn chained_rules_are_rejected() {
        let chained = vec![
            RewriteRule::new("/a", "/b").unwrap(),
            RewriteRule::new("/b", "/c").unwrap(),
        ];
        let err = PathRewriter::new(chained).unwrap_err();
        assert!(matches!(err, AssemblyError::Validation(_)), "{err}");

        let reversed = vec![
            RewriteRule::new("/b", "/c").unwrap(),
            RewriteRule::new("/a", "/b/sub").unwrap(),
        ];
        assert!(PathRewriter::new(reversed).is_err());

        // A rule whose output extends its own input is guarded per line.
        let nested = vec![RewriteRule::new("/opt/py", "/opt/py-relocated").unwrap()];
        assert!(PathRewriter::new(nested).is_ok());
    }

    #[test]
    fn rewrite_file_preserves_body_inode_and_mode() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("tool");
        let body = "#!/root/toolsuite/bin/python3\nimport sys\n# /root/toolsuite/bin stays\n";
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let inode = fs::metadata(&script).unwrap().ino();

        assert!(rewriter().rewrite_file(&script).unwrap());

        assert_eq!(
            fs::read_to_string(&script).unwrap(),
            "#!/usr/local/python3\nimport sys\n# /root/toolsuite/bin stays\n"
        );
        let meta = fs::metadata(&script).unwrap();
        assert_eq!(meta.ino(), inode);
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn binary_and_short_files_are_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("elf"), b"\x7fELF\x02\x01").unwrap();
        fs::write(temp.path().join("tiny"), b"#").unwrap();
        fs::write(temp.path().join("empty"), b"").unwrap();

        let report = rewriter().rewrite_tree(temp.path());
        assert_eq!(report.scanned, 3);
        assert!(report.rewritten.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn symlinks_are_not_followed() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::write(&outside, "#!/root/toolsuite/bin/python3\n").unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        symlink(&outside, root.join("link")).unwrap();

        let report = rewriter().rewrite_tree(&root);
        assert!(report.rewritten.is_empty());
        assert_eq!(
            fs::read_to_string(&outside).unwrap(),
            "#!/root/toolsuite/bin/python3\n"
        );
    }

    #[test]
    fn tree_rewrite_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("a"), "#!/root/toolsuite/bin/python3\n").unwrap();
        fs::write(bin.join("b"), "#!/bin/sh\necho ok\n").unwrap();

        let first = rewriter().rewrite_roots(temp.path(), &[PathBuf::from("bin")]);
        assert_eq!(first.rewritten, vec![bin.join("a")]);
        let second = rewriter().rewrite_roots(temp.path(), &[PathBuf::from("bin")]);
        assert!(second.rewritten.is_empty());
    }

    #[tokio::test]
    async fn extracted_files_without_matching_shebang_stay_byte_identical() {
        use crate::cancel::CancelToken;
        use crate::process::testing::ScriptedRunner;
        use crate::stages::extract::{extract_runtime, BaseImage, ExtractSpec};
        use std::time::Duration;

        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("image/root/toolsuite/bin");
        fs::create_dir_all(&bin).unwrap();
        let shell = b"#!/bin/sh\r\necho /root/toolsuite/bin\n\x00trailing".to_vec();
        let elf = b"\x7fELF\x02\x01\x01\x00#!/root/toolsuite/bin/python3\n\xff\xfe".to_vec();
        let tool = b"#!/root/toolsuite/bin/python3\nprint('x')\n".to_vec();
        fs::write(bin.join("run.sh"), &shell).unwrap();
        fs::write(bin.join("libfoo.so"), &elf).unwrap();
        fs::write(bin.join("tool"), &tool).unwrap();

        let tree = extract_runtime(
            &ScriptedRunner::new(),
            &ExtractSpec {
                stage: "toolsuite".into(),
                image: BaseImage::Directory(temp.path().join("image")),
                path: PathBuf::from("root/toolsuite"),
            },
            &temp.path().join("staging"),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        let report = rewriter().rewrite_roots(&tree, &[]);

        assert_eq!(report.rewritten, vec![tree.join("bin/tool")]);
        assert_eq!(fs::read(tree.join("bin/run.sh")).unwrap(), shell);
        assert_eq!(fs::read(tree.join("bin/libfoo.so")).unwrap(), elf);
        assert_eq!(
            fs::read(tree.join("bin/tool")).unwrap(),
            b"#!/usr/local/python3\nprint('x')\n".to_vec()
        );
    }

    #[test]
    fn missing_root_is_a_warning() {
        let temp = TempDir::new().unwrap();
        let report = rewriter().rewrite_tree(&temp.path().join("absent"));
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn unwritable_file_becomes_a_warning() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("locked");
        fs::write(&script, "#!/root/toolsuite/bin/python3\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o444)).unwrap();
        if OpenOptions::new().write(true).open(&script).is_ok() {
            // Privileged users can write regardless of mode.
            return;
        }

        let report = rewriter().rewrite_tree(temp.path());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].reason.contains("cannot open for writing"));
    }
}
