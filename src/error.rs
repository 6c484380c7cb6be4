//! Application error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Application error carrying a kind and a small key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Named resource (instance, bucket, image) could not be found
    ResourceNotFound,
    /// Named resource could not be created
    ResourceCreate,
    /// Caller lacks the identity permissions needed to continue
    Permission,
    /// Server binary is not a native executable for the host
    BinaryIncompatible,
    /// Post-boot validation failed
    ValidationFailed,
    /// Cloud provider returned an error
    Cloud,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::ResourceNotFound => 1001,
            Self::ResourceCreate => 1002,
            Self::Permission => 1003,
            Self::BinaryIncompatible => 2001,
            Self::ValidationFailed => 2002,
            Self::Cloud => 3001,
            Self::Config => 4001,
            Self::Io => 4002,
            Self::Network => 4003,
            Self::Process => 4004,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn resource_not_found(resource: &str, name: &str) -> Self {
        Self::new(
            ErrorKind::ResourceNotFound,
            BTreeMap::from([
                ("resource".to_string(), resource.to_string()),
                ("name".to_string(), name.to_string()),
            ]),
        )
    }

    pub fn resource_create(resource: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ResourceCreate,
            BTreeMap::from([
                ("resource".to_string(), resource.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    /// Fatal identity error naming the capabilities the caller must be granted.
    pub fn permission(missing: &[&str], detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Permission,
            BTreeMap::from([
                ("missing".to_string(), missing.join(", ")),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn binary_incompatible(path: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::BinaryIncompatible,
            BTreeMap::from([
                ("path".to_string(), path.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn validation_failed(reasons: &[String]) -> Self {
        Self::new(
            ErrorKind::ValidationFailed,
            BTreeMap::from([("reasons".to_string(), reasons.join("; "))]),
        )
    }

    /// Provider error tagged with the provider's error code.
    pub fn cloud(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Cloud,
            BTreeMap::from([
                ("code".to_string(), code.to_string()),
                ("detail".to_string(), message.into()),
            ]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            BTreeMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Provider error code, for `Cloud` errors.
    pub fn cloud_code(&self) -> Option<&str> {
        if self.kind != ErrorKind::Cloud {
            return None;
        }
        self.payload.get("code").map(String::as_str)
    }

    pub fn detail(&self) -> Option<&str> {
        self.payload.get("detail").map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_code_is_only_reported_for_cloud_errors() {
        let err = AppError::cloud("LimitExceeded", "profile already has a role");
        assert_eq!(err.cloud_code(), Some("LimitExceeded"));
        assert_eq!(AppError::io("disk full").cloud_code(), None);
    }

    #[test]
    fn display_lists_payload_in_key_order() {
        let err = AppError::resource_not_found("instance", "ac-server-instance");
        assert_eq!(
            err.to_string(),
            "ResourceNotFound: name=ac-server-instance, resource=instance"
        );
    }

    #[test]
    fn serializes_numeric_code() {
        let err = AppError::binary_incompatible("/opt/acserver/acServer", "PE32 executable");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], 2001);
        assert_eq!(value["payload"]["path"], "/opt/acserver/acServer");
    }
}
