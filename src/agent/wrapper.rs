//! Wrapper preset preparation.
//!
//! The wrapper serves a preset directory: a local copy of `cm_content/`, a
//! `content.json` whose file references point into that copy, and
//! `cm_wrapper_params.json`. Nothing here is fatal to the deployment.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::pack::WRAPPER_PARAMS_FILE;

pub const CONTENT_DIR: &str = "cm_content";
pub const CONTENT_JSON: &str = "content.json";

fn copy_dir(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AppError::io(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| AppError::io(e.to_string()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(|e| AppError::io(e.to_string()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn first_existing(candidates: &[PathBuf], want_dir: bool) -> Option<&PathBuf> {
    candidates
        .iter()
        .find(|p| if want_dir { p.is_dir() } else { p.is_file() })
}

fn looks_like_file_path(s: &str) -> bool {
    if s.contains('/') || s.contains('\\') {
        return true;
    }
    // name.ext where the extension starts with a letter, so "1.0" stays as is
    match s.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && ext.starts_with(|c: char| c.is_ascii_alphabetic())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Rewrite one file reference to `cm_content/<file name>`.
pub fn normalize_path(raw: &str) -> String {
    let mut path = raw;
    let bytes = raw.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'/' | b'\\')
    {
        path = &raw[3..];
    }
    let path = path.replace('\\', "/");
    let path = path.trim_start_matches('/');

    if path.starts_with("cm_content/") {
        return path.to_string();
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    format!("{}/{}", CONTENT_DIR, file_name)
}

/// Normalise every string in the document that looks like a file path.
pub fn normalize_content(value: Value) -> Value {
    match value {
        Value::String(s) if looks_like_file_path(&s) => Value::String(normalize_path(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_content).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_content(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Build the preset directory from what the pack provides.
///
/// `working_dir` is the server binary's directory, `pack_root` the extraction root.
pub fn prepare_preset(
    preset_dir: &Path,
    working_dir: &Path,
    pack_root: &Path,
    wrapper_port: u16,
) -> Result<()> {
    let content_dst = preset_dir.join(CONTENT_DIR);
    fs::create_dir_all(&content_dst).map_err(|e| AppError::io(e.to_string()))?;
    log::info!("Preparing wrapper preset in {}", preset_dir.display());

    let content_sources = [working_dir.join(CONTENT_DIR), pack_root.join(CONTENT_DIR)];
    match first_existing(&content_sources, true) {
        Some(src) => {
            let count = copy_dir(src, &content_dst)?;
            log::info!("Copied {} content files from {}", count, src.display());
        }
        None => log::warn!("Pack has no {} directory", CONTENT_DIR),
    }

    let json_sources = [
        working_dir.join(CONTENT_JSON),
        pack_root.join(CONTENT_JSON),
        content_dst.join(CONTENT_JSON),
    ];
    match first_existing(&json_sources, false) {
        Some(src) => {
            let dst = preset_dir.join(CONTENT_JSON);
            if let Err(e) = write_normalized_content(src, &dst) {
                log::warn!("Failed to normalise {}: {}", src.display(), e);
            } else {
                log::info!("Normalised content paths into {}", dst.display());
            }
        }
        None => log::warn!("No {} found", CONTENT_JSON),
    }

    let params_dst = preset_dir.join(WRAPPER_PARAMS_FILE);
    let params_sources = [
        working_dir.join(WRAPPER_PARAMS_FILE),
        pack_root.join(WRAPPER_PARAMS_FILE),
    ];
    match first_existing(&params_sources, false) {
        Some(src) => {
            fs::copy(src, &params_dst).map_err(|e| AppError::io(e.to_string()))?;
        }
        None => {
            let params = serde_json::json!({ "port": wrapper_port, "enabled": true });
            fs::write(&params_dst, serde_json::to_string(&params)?)
                .map_err(|e| AppError::io(e.to_string()))?;
            log::info!("Generated {} for port {}", WRAPPER_PARAMS_FILE, wrapper_port);
        }
    }

    Ok(())
}

fn write_normalized_content(src: &Path, dst: &Path) -> Result<()> {
    let raw = fs::read_to_string(src).map_err(|e| AppError::io(e.to_string()))?;
    let value: Value = serde_json::from_str(&raw)?;
    let normalized = normalize_content(value);
    fs::write(dst, serde_json::to_string_pretty(&normalized)?)
        .map_err(|e| AppError::io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rebased_into_content_dir() {
        assert_eq!(
            normalize_path(r"C:\Users\op\AppData\cm_pack\car.zip"),
            "cm_content/car.zip"
        );
        assert_eq!(normalize_path("/abs/track.zip"), "cm_content/track.zip");
        assert_eq!(normalize_path("cm_content/sub/x.zip"), "cm_content/sub/x.zip");
        assert_eq!(normalize_path("skin.zip"), "cm_content/skin.zip");
    }

    #[test]
    fn only_path_like_strings_change() {
        let doc = serde_json::json!({
            "cars": {"ks_mazda": {"file": "D:\\packs\\ks_mazda.zip", "version": "1.2"}},
            "track": {"file": "tracks/monza.zip", "name": "Monza"},
            "password": null,
            "list": ["a/b.zip", 3]
        });
        let out = normalize_content(doc);
        assert_eq!(out["cars"]["ks_mazda"]["file"], "cm_content/ks_mazda.zip");
        assert_eq!(out["cars"]["ks_mazda"]["version"], "1.2");
        assert_eq!(out["track"]["file"], "cm_content/monza.zip");
        assert_eq!(out["track"]["name"], "Monza");
        assert_eq!(out["list"][0], "cm_content/b.zip");
        assert_eq!(out["list"][1], 3);
    }

    #[test]
    fn preset_copies_content_and_generates_params() {
        let pack = tempfile::tempdir().unwrap();
        let preset = tempfile::tempdir().unwrap();
        let work = pack.path().join("server");
        fs::create_dir_all(pack.path().join("cm_content/cars")).unwrap();
        fs::create_dir_all(&work).unwrap();
        fs::write(pack.path().join("cm_content/cars/a.zip"), b"zip").unwrap();
        fs::write(
            work.join(CONTENT_JSON),
            r#"{"cars":{"a":{"file":"C:\\x\\a.zip"}}}"#,
        )
        .unwrap();

        prepare_preset(preset.path(), &work, pack.path(), 8090).unwrap();

        assert!(preset.path().join("cm_content/cars/a.zip").is_file());
        let content: Value = serde_json::from_str(
            &fs::read_to_string(preset.path().join(CONTENT_JSON)).unwrap(),
        )
        .unwrap();
        assert_eq!(content["cars"]["a"]["file"], "cm_content/a.zip");

        let params: Value = serde_json::from_str(
            &fs::read_to_string(preset.path().join(WRAPPER_PARAMS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(params["port"], 8090);
        assert_eq!(params["enabled"], true);
    }

    #[test]
    fn pack_params_are_copied_verbatim() {
        let pack = tempfile::tempdir().unwrap();
        let preset = tempfile::tempdir().unwrap();
        fs::write(
            pack.path().join(WRAPPER_PARAMS_FILE),
            r#"{"port": 9100, "verboseLog": true}"#,
        )
        .unwrap();

        prepare_preset(preset.path(), pack.path(), pack.path(), 8082).unwrap();
        let params = fs::read_to_string(preset.path().join(WRAPPER_PARAMS_FILE)).unwrap();
        assert!(params.contains("9100"));
        assert!(params.contains("verboseLog"));
    }
}
