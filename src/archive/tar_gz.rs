use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

use super::extract::{read_bounded, write_entry};
use super::path::{entry_has_suffix, parse_entry_rel_path, resolve_within_dir};

fn open_archive(archive_path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path).map_err(|e| AppError::io(e.to_string()))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn entry_path_string<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let entry_path = entry.path().map_err(|e| AppError::io(e.to_string()))?;
    entry_path
        .as_ref()
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::io(format!(
                "archive entry path is not valid UTF-8: {:?}",
                entry_path
            ))
        })
}

/// Extract a tar.gz pack into `dest_dir`.
///
/// Link entries are skipped with a warning; packs only need regular files and directories.
pub(super) fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let mut archive = open_archive(archive_path)?;

    for entry in archive.entries().map_err(|e| AppError::io(e.to_string()))? {
        let mut entry = entry.map_err(|e| AppError::io(e.to_string()))?;
        let raw_path = entry_path_string(&entry)?;

        let Some(relative) = parse_entry_rel_path(&raw_path) else {
            if raw_path.trim_matches(|c| c == '.' || c == '/').is_empty() {
                continue;
            }
            return Err(AppError::io(format!(
                "archive contains unsafe entry path: {raw_path:?}"
            )));
        };

        let entry_type = entry.header().entry_type();
        if !entry_type.is_dir() && !entry_type.is_file() {
            log::warn!("Skipping {:?} entry {}", entry_type, raw_path);
            continue;
        }

        let out_path = resolve_within_dir(dest_dir, &relative)?;
        let unix_mode = entry.header().mode().ok();
        let declared_size = if entry_type.is_file() {
            Some(entry.header().size().map_err(|e| AppError::io(e.to_string()))?)
        } else {
            None
        };
        write_entry(
            &out_path,
            entry_type.is_dir(),
            &mut entry,
            unix_mode,
            declared_size,
        )?;
    }

    Ok(())
}

pub(super) fn read_tar_gz_entry(
    archive_path: &Path,
    suffix: &str,
    max_len: u64,
) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(archive_path)?;

    for entry in archive.entries().map_err(|e| AppError::io(e.to_string()))? {
        let mut entry = entry.map_err(|e| AppError::io(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_path = entry_path_string(&entry)?;
        if entry_has_suffix(&raw_path, suffix) {
            return read_bounded(&mut entry, max_len);
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar_gz(path: &Path, files: &[(&str, &[u8], u32)]) {
        let file = fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_nested_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.tar.gz");
        build_tar_gz(
            &archive,
            &[
                ("server/acServer", b"\x7fELF", 0o755),
                ("server/cfg/server_cfg.ini", b"[SERVER]", 0o644),
            ],
        );

        let dest = dir.path().join("out");
        extract_tar_gz(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("server/acServer")).unwrap(), b"\x7fELF");
        assert!(dest.join("server/cfg/server_cfg.ini").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = fs::metadata(dest.join("server/acServer")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn reads_single_entry_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pack.tar.gz");
        build_tar_gz(
            &archive,
            &[
                ("cfg/server_cfg.ini", b"[SERVER]", 0o644),
                ("cfg/cm_wrapper_params.json", br#"{"port": 8090}"#, 0o644),
            ],
        );

        let data = read_tar_gz_entry(&archive, "cm_wrapper_params.json", 1024)
            .unwrap()
            .unwrap();
        assert_eq!(data, br#"{"port": 8090}"#);
        assert!(read_tar_gz_entry(&archive, "missing.json", 1024).unwrap().is_none());
        assert!(read_tar_gz_entry(&archive, "cm_wrapper_params.json", 4)
            .unwrap()
            .is_none());
    }
}
