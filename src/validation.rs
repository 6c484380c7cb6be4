use crate::config::{ADMIN_PORT, GAME_TCP_PORT, HTTP_PORT};
use crate::error::{AppError, Result};

/// Reject bucket names the storage provider would refuse.
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let is_valid = (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.'))
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric());

    if !is_valid {
        return Err(AppError::config(format!("Invalid bucket name: {}", name)));
    }
    Ok(())
}

/// Reject strings that are not compute instance ids (`i-` followed by hex).
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    let is_valid = instance_id
        .strip_prefix("i-")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit()));

    if !is_valid {
        return Err(AppError::config(format!(
            "Invalid instance id: {}",
            instance_id
        )));
    }
    Ok(())
}

/// Reject container image tags outside the registry's tag grammar.
pub fn validate_image_tag(tag: &str) -> Result<()> {
    let is_valid = (1..=128).contains(&tag.len())
        && tag
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !is_valid {
        return Err(AppError::config(format!("Invalid image tag: {}", tag)));
    }
    Ok(())
}

/// Reject wrapper ports that are zero or already taken by the server or SSH.
pub fn validate_wrapper_port(port: u16) -> Result<()> {
    let taken = match port {
        0 => return Err(AppError::config("wrapper port must be non-zero")),
        HTTP_PORT => "server HTTP port",
        GAME_TCP_PORT => "game port",
        ADMIN_PORT => "SSH port",
        _ => return Ok(()),
    };
    Err(AppError::config(format!(
        "wrapper port {} collides with the {}",
        port, taken
    )))
}

/// Whether a pack file name looks like a supported archive.
pub fn is_pack_filename(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".zip")
}
