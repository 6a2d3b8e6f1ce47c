//! Step arguments: typed values, schema validation, and step kinds.
//!
//! Front-ends hand [`RawArgs`] to `add_step`. They are validated once, there,
//! into a [`StepArgs`] snapshot, so a malformed step never reaches the store
//! and executors can rely on the shape of what they receive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Maximum number of fields outside the well-known schema.
pub const MAX_EXTENSION_FIELDS: usize = 32;

/// Maximum length of a single string or path value, in bytes.
pub const MAX_VALUE_LEN: usize = 4096;

/// Maximum length of an argument name.
const MAX_NAME_LEN: usize = 64;

/// Fields whose values are always file system paths.
const PATH_FIELDS: [&str; 3] = ["output_path", "target_path", "source_path"];

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "webp", "bmp", "tiff"];
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "mkv", "webm", "avi", "m4v"];
const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "ogg", "flac", "m4a"];

/// A primitive argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    String(String),
    Number(f64),
    Bool(bool),
    Path(PathBuf),
}

impl ArgValue {
    /// Parse a `key=value` style command-line value.
    ///
    /// `true`/`false` become booleans, anything that parses as a finite
    /// number becomes a number, and everything else stays a string. Path
    /// fields are promoted during validation.
    pub fn parse_loose(raw: &str) -> Self {
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::String(raw.to_string()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Path(_) => "path",
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p.as_path()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for ArgValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for ArgValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<PathBuf> for ArgValue {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

/// Unvalidated argument map as staged by a front-end.
pub type RawArgs = BTreeMap<String, ArgValue>;

/// What a step produces, derived from its output (or target) path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Image,
    Video,
    Audio,
    Generic,
}

impl StepKind {
    /// Classify a path by its extension.
    pub fn from_path(path: &Path) -> Self {
        let Some(ext) = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
        else {
            return Self::Generic;
        };
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Audio
        } else {
            Self::Generic
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Validation errors for step arguments.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid argument name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("type mismatch for argument '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("argument '{field}' must not be empty")]
    Empty { field: String },

    #[error("argument '{field}' is not valid UTF-8")]
    NonUtf8Path { field: String },

    #[error("argument '{field}' is not a finite number")]
    NonFinite { field: String },

    #[error("argument '{field}' is {len} bytes, maximum is {max}")]
    TooLong { field: String, len: usize, max: usize },

    #[error("too many extension arguments: {count} > {max}")]
    TooManyExtensions { count: usize, max: usize },
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("must be at most 64 characters")
    } else if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        Some("must start with a letter")
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some("must contain only alphanumeric characters and underscores")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_len(field: &str, len: usize) -> Result<(), ValidationError> {
    if len > MAX_VALUE_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            len,
            max: MAX_VALUE_LEN,
        });
    }
    Ok(())
}

/// Records are stored as JSON, which cannot carry a non-UTF-8 path.
fn check_utf8(field: &str, path: &Path) -> Result<(), ValidationError> {
    if path.to_str().is_none() {
        return Err(ValidationError::NonUtf8Path {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn validate_path_field(field: &str, value: ArgValue) -> Result<ArgValue, ValidationError> {
    let path = match value {
        ArgValue::Path(p) => p,
        ArgValue::String(s) => PathBuf::from(s),
        other => {
            return Err(ValidationError::TypeMismatch {
                field: field.to_string(),
                expected: "path",
                got: other.type_name(),
            });
        }
    };
    if path.as_os_str().is_empty() {
        return Err(ValidationError::Empty {
            field: field.to_string(),
        });
    }
    check_utf8(field, &path)?;
    check_len(field, path.as_os_str().len())?;
    Ok(ArgValue::Path(path))
}

fn validate_value(field: &str, value: ArgValue) -> Result<ArgValue, ValidationError> {
    match &value {
        ArgValue::Number(n) if !n.is_finite() => {
            return Err(ValidationError::NonFinite {
                field: field.to_string(),
            });
        }
        ArgValue::String(s) => check_len(field, s.len())?,
        ArgValue::Path(p) => {
            check_utf8(field, p)?;
            check_len(field, p.as_os_str().len())?;
        }
        _ => {}
    }
    Ok(value)
}

/// A validated, immutable argument snapshot for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepArgs {
    fields: BTreeMap<String, ArgValue>,
}

impl StepArgs {
    /// Validate a raw argument map.
    ///
    /// Path fields accept strings and are normalized to paths. Every other
    /// field counts against the extension budget.
    pub fn validate(raw: RawArgs) -> Result<Self, ValidationError> {
        let mut fields = BTreeMap::new();
        let mut extensions = 0usize;

        for (name, value) in raw {
            validate_name(&name)?;
            let value = if PATH_FIELDS.contains(&name.as_str()) {
                validate_path_field(&name, value)?
            } else {
                extensions += 1;
                validate_value(&name, value)?
            };
            fields.insert(name, value);
        }

        if extensions > MAX_EXTENSION_FIELDS {
            return Err(ValidationError::TooManyExtensions {
                count: extensions,
                max: MAX_EXTENSION_FIELDS,
            });
        }

        Ok(Self { fields })
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.fields.get(name)
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.get("output_path").and_then(ArgValue::as_path)
    }

    pub fn target_path(&self) -> Option<&Path> {
        self.get("target_path").and_then(ArgValue::as_path)
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.get("source_path").and_then(ArgValue::as_path)
    }

    /// Step kind, from the output path or, failing that, the target path.
    pub fn kind(&self) -> StepKind {
        self.output_path()
            .or_else(|| self.target_path())
            .map(StepKind::from_path)
            .unwrap_or(StepKind::Generic)
    }

    /// Fields outside the well-known schema.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.iter()
            .filter(|(name, _)| !PATH_FIELDS.contains(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
