use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

use super::extract::{read_bounded, write_entry};
use super::path::{entry_has_suffix, parse_entry_rel_path, resolve_within_dir};

fn open_archive(archive_path: &Path) -> Result<zip::ZipArchive<fs::File>> {
    let file = fs::File::open(archive_path).map_err(|e| AppError::io(e.to_string()))?;
    Ok(zip::ZipArchive::new(file)?)
}

/// Extract a zip pack into `dest_dir`. Symlink entries are skipped with a warning.
pub(super) fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let mut archive = open_archive(archive_path)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().to_string();

        let Some(relative) = parse_entry_rel_path(&raw_name) else {
            return Err(AppError::io(format!(
                "archive contains unsafe zip path: {raw_name:?}"
            )));
        };

        if entry.is_symlink() {
            log::warn!("Skipping symlink entry {}", raw_name);
            continue;
        }

        let out_path = resolve_within_dir(dest_dir, &relative)?;
        let is_dir = entry.is_dir();
        let unix_mode = entry.unix_mode();
        let declared_size = if is_dir { None } else { Some(entry.size()) };
        write_entry(&out_path, is_dir, &mut entry, unix_mode, declared_size)?;
    }

    Ok(())
}

pub(super) fn read_zip_entry(
    archive_path: &Path,
    suffix: &str,
    max_len: u64,
) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(archive_path)?;

    let Some(name) = archive
        .file_names()
        .find(|name| !name.ends_with('/') && entry_has_suffix(name, suffix))
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let mut entry = archive.by_name(&name)?;
    read_bounded(&mut entry, max_len)
}
