//! Locate the server executable in an extracted pack and check it can run here.

use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};

pub const SERVER_BINARY_NAME: &str = "acServer";
pub const WRAPPER_BINARY_NAME: &str = "acServerWrapper";
const SEARCH_DEPTH: usize = 3;

/// `e_machine` value for x86-64, the architecture of the provisioned image.
pub const EM_X86_64: u16 = 62;
/// Bytes of the ELF identification plus `e_type` and `e_machine`.
const ELF_MACHINE_HEADER: usize = 20;

/// Executable format, judged from the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    WindowsPe,
    Unknown,
}

impl BinaryFormat {
    pub fn from_header(header: &[u8]) -> Self {
        if header.starts_with(b"\x7fELF") {
            Self::Elf
        } else if header.starts_with(b"MZ") {
            Self::WindowsPe
        } else {
            Self::Unknown
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Find the server binary under `root`.
///
/// `root/acServer` wins outright. Otherwise files up to three levels down whose
/// name starts with `acServer` or `acserver` are candidates; the first executable
/// one is preferred, else the first found. The wrapper binary is never a candidate.
pub fn locate_server(root: &Path) -> Option<PathBuf> {
    let direct = root.join(SERVER_BINARY_NAME);
    if direct.is_file() {
        return Some(direct);
    }

    let mut candidates: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(SEARCH_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            (name.starts_with("acServer") || name.starts_with("acserver"))
                && !name.starts_with(WRAPPER_BINARY_NAME)
        })
        .map(|entry| entry.into_path())
        .collect();
    candidates.sort();

    if let Some(exec) = candidates.iter().find(|p| is_executable(p)) {
        return Some(exec.clone());
    }
    candidates.into_iter().next()
}

/// Look for the wrapper next to the server binary, then in `bin/` and `build/`.
pub fn locate_wrapper(working_dir: &Path) -> Option<PathBuf> {
    [
        working_dir.to_path_buf(),
        working_dir.join("bin"),
        working_dir.join("build"),
    ]
    .into_iter()
    .map(|dir| dir.join(WRAPPER_BINARY_NAME))
    .find(|path| path.is_file())
}

pub fn read_format(path: &Path) -> Result<BinaryFormat> {
    let mut header = [0u8; 4];
    let mut file = fs::File::open(path).map_err(|e| AppError::io(e.to_string()))?;
    let n = file
        .read(&mut header)
        .map_err(|e| AppError::io(e.to_string()))?;
    Ok(BinaryFormat::from_header(&header[..n]))
}

/// Accept only a native (ELF) executable.
pub fn verify_native(path: &Path) -> Result<()> {
    let display = path.display().to_string();
    match read_format(path)? {
        BinaryFormat::Elf => Ok(()),
        BinaryFormat::WindowsPe => Err(AppError::binary_incompatible(
            &display,
            "Windows PE binary; the pack must contain the Linux acServer build",
        )),
        BinaryFormat::Unknown => Err(AppError::binary_incompatible(
            &display,
            "not an ELF executable",
        )),
    }
}

/// `e_machine` of an ELF file, `None` when the header is too short or not ELF.
pub fn elf_machine(header: &[u8]) -> Option<u16> {
    if BinaryFormat::from_header(header) != BinaryFormat::Elf || header.len() < ELF_MACHINE_HEADER {
        return None;
    }
    let raw = [header[18], header[19]];
    // EI_DATA: 1 little-endian, 2 big-endian.
    match header[5] {
        1 => Some(u16::from_le_bytes(raw)),
        2 => Some(u16::from_be_bytes(raw)),
        _ => None,
    }
}

/// Accept only an x86-64 ELF executable, the only kind the provisioned host can run.
pub fn verify_host_executable(path: &Path) -> Result<()> {
    let display = path.display().to_string();
    let mut header = [0u8; ELF_MACHINE_HEADER];
    let mut file = fs::File::open(path).map_err(|e| AppError::io(e.to_string()))?;
    let n = file
        .read(&mut header)
        .map_err(|e| AppError::io(e.to_string()))?;
    let header = &header[..n];

    match (BinaryFormat::from_header(header), elf_machine(header)) {
        (BinaryFormat::Elf, Some(EM_X86_64)) => Ok(()),
        (BinaryFormat::Elf, Some(machine)) => Err(AppError::binary_incompatible(
            &display,
            format!("ELF machine {} is not x86-64", machine),
        )),
        (BinaryFormat::Elf, None) => Err(AppError::binary_incompatible(
            &display,
            "truncated ELF header",
        )),
        (BinaryFormat::WindowsPe, _) => Err(AppError::binary_incompatible(
            &display,
            "Windows PE binary; build the agent for x86_64-unknown-linux",
        )),
        (BinaryFormat::Unknown, _) => Err(AppError::binary_incompatible(
            &display,
            "not an ELF executable; build the agent for x86_64-unknown-linux",
        )),
    }
}

/// Mark the binary executable for its owner, group and others.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let mut perms = fs::metadata(path)
        .map_err(|e| AppError::io(e.to_string()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).map_err(|e| AppError::io(e.to_string()))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn header_classification() {
        assert_eq!(BinaryFormat::from_header(b"\x7fELF\x02"), BinaryFormat::Elf);
        assert_eq!(BinaryFormat::from_header(b"MZ\x90\x00"), BinaryFormat::WindowsPe);
        assert_eq!(BinaryFormat::from_header(b"#!"), BinaryFormat::Unknown);
        assert_eq!(BinaryFormat::from_header(b""), BinaryFormat::Unknown);
    }

    #[test]
    fn windows_binary_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("acServer");
        fs::write(&exe, b"MZ\x90\x00rest").unwrap();
        let err = verify_native(&exe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryIncompatible);

        fs::write(&exe, b"\x7fELFrest").unwrap();
        assert!(verify_native(&exe).is_ok());
    }

    fn elf_header(data: u8, machine: [u8; 2]) -> Vec<u8> {
        let mut header = vec![0x7f, b'E', b'L', b'F', 2, data, 1, 0];
        header.resize(16, 0);
        header.extend_from_slice(&[2, 0]);
        header.extend_from_slice(&machine);
        header
    }

    #[test]
    fn elf_machine_follows_byte_order() {
        assert_eq!(elf_machine(&elf_header(1, [0x3e, 0x00])), Some(EM_X86_64));
        assert_eq!(elf_machine(&elf_header(2, [0x00, 0xb7])), Some(183));
        assert_eq!(elf_machine(b"\x7fELF\x02\x01"), None);
        assert_eq!(elf_machine(b"\xcf\xfa\xed\xfe"), None);
    }

    #[test]
    fn host_executable_must_be_x86_64_elf() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("acserver-agent");

        fs::write(&exe, elf_header(1, [0x3e, 0x00])).unwrap();
        assert!(verify_host_executable(&exe).is_ok());

        // aarch64
        fs::write(&exe, elf_header(1, [0xb7, 0x00])).unwrap();
        let err = verify_host_executable(&exe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryIncompatible);
        assert!(err.to_string().contains("183"));

        // Mach-O
        fs::write(&exe, b"\xcf\xfa\xed\xfe\x07\x00\x00\x01").unwrap();
        assert_eq!(
            verify_host_executable(&exe).unwrap_err().kind(),
            ErrorKind::BinaryIncompatible
        );
    }

    #[test]
    fn root_binary_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("server/bin")).unwrap();
        fs::write(dir.path().join("server/bin/acServer"), b"x").unwrap();
        fs::write(dir.path().join("acServer"), b"x").unwrap();
        assert_eq!(locate_server(dir.path()), Some(dir.path().join("acServer")));
    }

    #[cfg(unix)]
    #[test]
    fn nested_search_prefers_executables_and_skips_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pack/server");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("acServer.cfg.bak"), b"x").unwrap();
        fs::write(nested.join("acServerWrapper"), b"x").unwrap();
        fs::write(nested.join("acserver"), b"x").unwrap();
        make_executable(&nested.join("acserver")).unwrap();
        make_executable(&nested.join("acServerWrapper")).unwrap();

        assert_eq!(locate_server(dir.path()), Some(nested.join("acserver")));
    }

    #[test]
    fn search_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("acServer"), b"x").unwrap();
        assert_eq!(locate_server(dir.path()), None);
    }

    #[test]
    fn wrapper_is_found_in_bin() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/acServerWrapper"), b"x").unwrap();
        assert_eq!(
            locate_wrapper(dir.path()),
            Some(dir.path().join("bin/acServerWrapper"))
        );
    }
}
