use thiserror::Error;

/// Failures while loading the field contract file.
///
/// These are the only errors allowed to abort a run; everything downstream of
/// a loaded registry degrades into data instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read field config {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("malformed field config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {key:?}: {source}")]
    InvalidField {
        key: String,
        source: serde_json::Error,
    },

    #[error("field {key:?}: {reason}")]
    InvalidContract { key: String, reason: String },

    #[error("field {field:?} references undeclared intermediate key {name:?}")]
    UndeclaredKey { field: String, name: String },
}
