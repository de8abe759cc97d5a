//! Unit names and their D-Bus object paths.
//!
//! The manager exposes every unit at `/org/freedesktop/systemd1/unit/<segment>`
//! where `<segment>` is the unit name with every byte outside `[A-Za-z0-9]`
//! (and a leading digit) written as `_xx`.

use thiserror::Error;
use zvariant::{ObjectPath, OwnedObjectPath};

/// Object path prefix under which the manager publishes units.
pub const UNIT_PATH_PREFIX: &str = "/org/freedesktop/systemd1/unit";

/// Longest unit name the manager accepts, in bytes.
pub const UNIT_NAME_MAX: usize = 255;

/// Unit type suffixes known to the manager.
pub const UNIT_TYPES: &[&str] = &[
    "service",
    "socket",
    "target",
    "device",
    "mount",
    "automount",
    "swap",
    "timer",
    "path",
    "slice",
    "scope",
];

/// Reasons a unit name or path cannot address a unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("unit name is empty")]
    Empty,

    #[error("unit name {name:?} is {len} bytes, limit is {UNIT_NAME_MAX}")]
    TooLong { name: String, len: usize },

    #[error("unit name {name:?} contains invalid character {ch:?}")]
    InvalidChar { name: String, ch: char },

    #[error("unit name {0:?} has no type suffix")]
    MissingSuffix(String),

    #[error("unit name {name:?} has unknown type {suffix:?}")]
    UnknownType { name: String, suffix: String },

    #[error("unit name {0:?} has an empty prefix")]
    EmptyPrefix(String),

    #[error("unit name {0:?} contains more than one '@'")]
    MultipleAt(String),

    #[error("invalid object path {0:?}")]
    InvalidPath(String),
}

fn is_plain(i: usize, b: u8) -> bool {
    b.is_ascii_alphabetic() || (i > 0 && b.is_ascii_digit())
}

/// Escape a unit name into a single object path segment.
pub fn path_bus_escape(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }

    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        if is_plain(i, b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

/// Reverse [`path_bus_escape`].
///
/// Malformed escapes (a `_` not followed by two hex digits) are kept as-is.
pub fn path_bus_unescape(segment: &str) -> String {
    if segment == "_" {
        return String::new();
    }

    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 2 < bytes.len() {
            if let Some(decoded) = decode_hex_pair(bytes[i + 1], bytes[i + 2]) {
                out.push(decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn decode_hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

fn is_unit_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '\\' | '@')
}

/// Check a unit name against the manager's naming rules.
///
/// Accepts plain units (`app.service`), templates (`getty@.service`) and
/// instances (`getty@tty1.service`).
pub fn validate_unit_name(name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.len() > UNIT_NAME_MAX {
        return Err(IdentifierError::TooLong {
            name: name.to_string(),
            len: name.len(),
        });
    }
    if let Some(ch) = name.chars().find(|c| !is_unit_char(*c)) {
        return Err(IdentifierError::InvalidChar {
            name: name.to_string(),
            ch,
        });
    }

    let (stem, suffix) = name
        .rsplit_once('.')
        .ok_or_else(|| IdentifierError::MissingSuffix(name.to_string()))?;
    if !UNIT_TYPES.contains(&suffix) {
        return Err(IdentifierError::UnknownType {
            name: name.to_string(),
            suffix: suffix.to_string(),
        });
    }

    if stem.matches('@').count() > 1 {
        return Err(IdentifierError::MultipleAt(name.to_string()));
    }
    let prefix = stem.split('@').next().unwrap_or_default();
    if prefix.is_empty() {
        return Err(IdentifierError::EmptyPrefix(name.to_string()));
    }

    Ok(())
}

/// Object path of a unit, after validating its name.
pub fn unit_path(name: &str) -> Result<OwnedObjectPath, IdentifierError> {
    validate_unit_name(name)?;
    let path = format!("{}/{}", UNIT_PATH_PREFIX, path_bus_escape(name));
    parse_object_path(&path)
}

/// Parse and structurally validate an object path.
pub fn parse_object_path(path: &str) -> Result<OwnedObjectPath, IdentifierError> {
    ObjectPath::try_from(path)
        .map(OwnedObjectPath::from)
        .map_err(|_| IdentifierError::InvalidPath(path.to_string()))
}

/// Unit name encoded in the last segment of a unit object path.
pub fn unit_name_from_path(path: &ObjectPath<'_>) -> String {
    let segment = path.as_str().rsplit('/').next().unwrap_or_default();
    path_bus_unescape(segment)
}
