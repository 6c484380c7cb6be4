//! Pack archive handling: format detection, extraction, single-entry lookup.

mod extract;
mod path;
mod tar_gz;
mod zip_ops;

use std::fs;
use std::io::Read as _;
use std::path::Path;

use crate::error::{AppError, Result};

pub(crate) use path::parse_entry_rel_path;

/// Container format, detected from the leading bytes rather than the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Result<Self> {
        let mut magic = [0u8; 4];
        let mut file = fs::File::open(path).map_err(|e| AppError::io(e.to_string()))?;
        let read = file
            .read(&mut magic)
            .map_err(|e| AppError::io(e.to_string()))?;
        Self::from_magic(&magic[..read])
            .ok_or_else(|| AppError::io(format!("{} is neither tar.gz nor zip", path.display())))
    }

    fn from_magic(magic: &[u8]) -> Option<Self> {
        match magic {
            [0x1f, 0x8b, ..] => Some(Self::TarGz),
            [b'P', b'K', 0x03, 0x04, ..] | [b'P', b'K', 0x05, 0x06, ..] => Some(Self::Zip),
            _ => None,
        }
    }
}

/// Extract a pack into `dest_dir`, keeping its layout.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    match ArchiveFormat::detect(archive_path)? {
        ArchiveFormat::TarGz => tar_gz::extract_tar_gz(archive_path, dest_dir),
        ArchiveFormat::Zip => zip_ops::extract_zip(archive_path, dest_dir),
    }
}

/// Read the first regular file whose path ends with `suffix`, without extracting anything else.
pub fn read_entry_with_suffix(
    archive_path: &Path,
    suffix: &str,
    max_len: u64,
) -> Result<Option<Vec<u8>>> {
    match ArchiveFormat::detect(archive_path)? {
        ArchiveFormat::TarGz => tar_gz::read_tar_gz_entry(archive_path, suffix, max_len),
        ArchiveFormat::Zip => zip_ops::read_zip_entry(archive_path, suffix, max_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        assert_eq!(ArchiveFormat::from_magic(&[0x1f, 0x8b, 8, 0]), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_magic(b"PK\x03\x04"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_magic(b"Rar!"), None);
        assert_eq!(ArchiveFormat::from_magic(&[0x1f]), None);
    }
}
