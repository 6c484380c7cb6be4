//! Advisory inspection of a pack archive before upload.

use std::path::Path;

use serde_json::Value;

use crate::archive::read_entry_with_suffix;

/// Wrapper parameters document shipped by Content Manager exports.
pub const WRAPPER_PARAMS_FILE: &str = "cm_wrapper_params.json";

const MAX_PARAMS_LEN: u64 = 64 * 1024;

/// Read an integer field from the first entry ending in `suffix`.
///
/// Returns `None` when the entry is absent, unreadable, malformed, or the field does
/// not fit a port. Never fails: this lookup must not block a deployment.
pub fn extract_parameter(archive: &Path, suffix: &str, field: &str) -> Option<u16> {
    let data = match read_entry_with_suffix(archive, suffix, MAX_PARAMS_LEN) {
        Ok(Some(data)) => data,
        Ok(None) => {
            log::debug!("{} not found in {}", suffix, archive.display());
            return None;
        }
        Err(e) => {
            log::warn!("Could not inspect {}: {}", archive.display(), e);
            return None;
        }
    };

    let doc: Value = match serde_json::from_slice(&data) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("Ignoring malformed {}: {}", suffix, e);
            return None;
        }
    };

    let value = doc.get(field)?;
    let port = value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|n| u16::try_from(n).ok())
        .filter(|&n| n != 0);
    if port.is_none() {
        log::warn!("Ignoring non-port {} value {} in {}", field, value, suffix);
    }
    port
}

/// Wrapper port embedded in the pack, if any.
pub fn wrapper_port(archive: &Path) -> Option<u16> {
    extract_parameter(archive, WRAPPER_PARAMS_FILE, "port")
}
