//! Errors raised while loading and validating configuration

use crate::loader::FileFormat;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// No loaded source holds this key
    #[error("missing configuration key `{0}`")]
    MissingKey(String),

    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No extension, or one that maps to no [`FileFormat`]
    #[error("cannot tell the configuration format of {0}")]
    UnknownFormat(String),

    #[error("{format:?} syntax error: {reason}")]
    Syntax { format: FileFormat, reason: String },

    #[error("configuration root must be a table, got {0}")]
    NotATable(String),

    #[error("cannot load dotenv file: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("cannot decode {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("environment variable {key}: {source}")]
    Env {
        key: String,
        source: std::env::VarError,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field, for validation failures
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::Invalid { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
