//! Parser for `KEY=value` line documents.
//!
//! Used for the agent's env file and for status output collected from the host.
//! Malformed lines are reported, never silently dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// A line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 1-based line number.
    pub line: usize,
    pub content: String,
    pub reason: &'static str,
}

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {} ({:?})", self.line, self.reason, self.content)
    }
}

/// Parsed document: well-formed entries plus every malformed line.
#[derive(Debug, Default, Clone)]
pub struct KeyValues {
    entries: BTreeMap<String, String>,
    malformed: Vec<MalformedLine>,
}

impl KeyValues {
    /// Parse a document. Blank lines and `#` comments are ignored.
    /// A value may be wrapped in single or double quotes. A repeated key keeps the last value.
    pub fn parse(input: &str) -> Self {
        let mut parsed = Self::default();

        for (idx, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = line.split_once('=') else {
                parsed.malformed.push(MalformedLine {
                    line: idx + 1,
                    content: raw.to_string(),
                    reason: "missing '='",
                });
                continue;
            };

            let key = key.trim();
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                parsed.malformed.push(MalformedLine {
                    line: idx + 1,
                    content: raw.to_string(),
                    reason: "invalid key",
                });
                continue;
            }

            parsed
                .entries
                .insert(key.to_string(), unquote(value.trim()).to_string());
        }

        parsed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Required string value.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| AppError::config(format!("missing key {}", key)))
    }

    /// Optional typed value; a present but unparsable value is an error.
    pub fn parse_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| AppError::config(format!("invalid value for {}: {}", key, v))),
        }
    }

    /// Typed value with a default when absent.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    /// Boolean flag; accepts true/false, 1/0, yes/no.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes") => Ok(true),
            Some("false" | "0" | "no") => Ok(false),
            Some(other) => Err(AppError::config(format!(
                "invalid flag for {}: {}",
                key, other
            ))),
        }
    }

    pub fn malformed(&self) -> &[MalformedLine] {
        &self.malformed
    }

    /// Fail if any line was malformed.
    pub fn strict(self) -> Result<Self> {
        if self.malformed.is_empty() {
            return Ok(self);
        }
        let lines: Vec<String> = self.malformed.iter().map(ToString::to_string).collect();
        Err(AppError::config(format!(
            "malformed lines: {}",
            lines.join("; ")
        )))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render entries back into a document, quoting values that need it.
pub fn render<'a>(entries: impl IntoIterator<Item = (&'a str, String)>) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        if value.chars().any(|c| c.is_whitespace() || c == '#' || c == '"') {
            out.push_str(&format!("{}='{}'\n", key, value));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entries_and_reports_malformed_lines() {
        let doc = "\
# agent settings
PACK_URL=\"https://example.com/p?a=1&b=2\"
TCP_PORT=9600
this line is broken
bad-key=1
export WRAPPER_ENABLED=yes
";
        let kv = KeyValues::parse(doc);
        assert_eq!(kv.get("PACK_URL"), Some("https://example.com/p?a=1&b=2"));
        assert_eq!(kv.parse_or::<u16>("TCP_PORT", 0).unwrap(), 9600);
        assert!(kv.flag("WRAPPER_ENABLED", false).unwrap());
        assert_eq!(kv.malformed().len(), 2);
        assert_eq!(kv.malformed()[0].line, 4);
        assert_eq!(kv.malformed()[1].reason, "invalid key");
        assert!(kv.strict().is_err());
    }

    #[test]
    fn unparsable_typed_value_is_an_error() {
        let kv = KeyValues::parse("HTTP_PORT=eighty");
        assert!(kv.parse_opt::<u16>("HTTP_PORT").is_err());
        assert!(kv.require("MISSING").is_err());
    }

    #[test]
    fn rendered_document_parses_back() {
        let doc = render([
            ("INSTANCE", "ac server".to_string()),
            ("PORT", "9600".to_string()),
        ]);
        let kv = KeyValues::parse(&doc).strict().unwrap();
        assert_eq!(kv.get("INSTANCE"), Some("ac server"));
        assert_eq!(kv.len(), 2);
    }
}
