use std::fs;
use std::io;
use std::io::Read as _;
use std::path::Path;

use crate::error::{AppError, Result};

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| AppError::io(format!("failed to set permissions on {path:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Write one archive entry to disk. A short write against the declared size means a
/// truncated archive.
pub(super) fn write_entry<R>(
    out_path: &Path,
    is_dir: bool,
    reader: &mut R,
    unix_mode: Option<u32>,
    declared_size: Option<u64>,
) -> Result<()>
where
    R: io::Read,
{
    if is_dir {
        fs::create_dir_all(out_path)
            .map_err(|e| AppError::io(format!("failed to create directory {out_path:?}: {e}")))?;
        return Ok(());
    }

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("failed to create directory {parent:?}: {e}")))?;
    }

    let mut outfile = fs::File::create(out_path)
        .map_err(|e| AppError::io(format!("failed to create {out_path:?}: {e}")))?;
    let written = io::copy(reader, &mut outfile)
        .map_err(|e| AppError::io(format!("failed to write {out_path:?}: {e}")))?;
    if let Some(expected) = declared_size {
        if written != expected {
            return Err(AppError::io(format!(
                "truncated archive entry {out_path:?}: expected {expected} bytes, got {written}",
            )));
        }
    }
    set_unix_permissions(out_path, unix_mode)
}

/// Read at most `max_len` bytes of an entry; larger entries are reported as `None`.
pub(super) fn read_bounded<R>(reader: &mut R, max_len: u64) -> Result<Option<Vec<u8>>>
where
    R: io::Read,
{
    let mut buf = Vec::new();
    reader
        .take(max_len + 1)
        .read_to_end(&mut buf)
        .map_err(|e| AppError::io(e.to_string()))?;
    if buf.len() as u64 > max_len {
        return Ok(None);
    }
    Ok(Some(buf))
}
