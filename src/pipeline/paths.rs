use std::path::{Component, Path, PathBuf};

use crate::error::{AssemblyError, Result};

pub(crate) fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Normalize a path that must stay inside some root.
///
/// A leading `/` is accepted and stripped, `.` components are dropped, and
/// `..` is rejected. The root itself normalizes to an empty path.
pub fn normalize_inside(raw: &str, field: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(AssemblyError::Validation(format!(
                    "{field} '{raw}' must not contain parent-directory traversal"
                )))
            }
        }
    }
    Ok(out)
}

/// Like [`normalize_inside`] but the input must be written relative.
pub(crate) fn parse_relative_path(raw: &str, field: &str) -> Result<PathBuf> {
    if Path::new(raw).is_absolute() {
        return Err(AssemblyError::Validation(format!(
            "{field} must be relative, got absolute path '{raw}'"
        )));
    }
    normalize_inside(raw, field)
}

/// Whether `path` is `output` or lies underneath it (both normalized).
pub(crate) fn is_within(path: &Path, output: &Path) -> bool {
    output.as_os_str().is_empty() || path.starts_with(output)
}

/// Stage identifiers double as directory names.
pub(crate) fn validate_stage_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(AssemblyError::Validation(
            "stage name must not be empty".to_string(),
        ));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.starts_with('.') {
        return Err(AssemblyError::Validation(format!(
            "stage name '{id}' must be a safe filename segment"
        )));
    }
    Ok(())
}
