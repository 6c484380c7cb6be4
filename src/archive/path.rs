use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

fn has_windows_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Convert an archive entry path to a relative PathBuf, rejecting empty, absolute or traversal paths.
///
/// Packs exported on Windows may use backslash separators.
pub(crate) fn parse_entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_windows_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative)
}

/// Whether an entry path ends with `suffix` on a path-segment boundary.
pub(super) fn entry_has_suffix(raw: &str, suffix: &str) -> bool {
    let normalized = raw.replace('\\', "/");
    let Some(head) = normalized.strip_suffix(suffix) else {
        return false;
    };
    head.is_empty() || head.ends_with('/')
}

/// Canonicalize the longest existing prefix of a path, appending the missing tail.
fn canonicalize_longest_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for part in tail.into_iter().rev() {
                    canonical.push(part);
                }
                return Ok(canonical);
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(AppError::io(format!(
                        "failed to canonicalize path {path:?}: reached filesystem root",
                    )));
                };
                tail.push(name.to_owned());
                existing.pop();
            }
            Err(error) => {
                return Err(AppError::io(format!(
                    "failed to canonicalize path {existing:?}: {error}",
                )));
            }
        }
    }
}

/// Join `relative` under `base_dir` and verify the result stays inside it.
pub(super) fn resolve_within_dir(base_dir: &Path, relative: &Path) -> Result<PathBuf> {
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(AppError::io(format!(
            "archive entry {relative:?} is not a plain relative path"
        )));
    }

    let canonical_base = base_dir
        .canonicalize()
        .map_err(|e| AppError::io(format!("failed to canonicalize base dir: {e}")))?;
    let candidate = canonicalize_longest_prefix(&canonical_base.join(relative))?;

    if !candidate.starts_with(&canonical_base) {
        return Err(AppError::io(
            "archive contains path escaping destination, refusing to extract",
        ));
    }
    Ok(candidate)
}
