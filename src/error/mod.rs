//! Error types for registry access and mirroring
//!
//! [`RegistryError`] is what the registry capabilities (blob stores, manifest services,
//! connectors) return. [`MirrorError`] is what planning and execution surface to the caller,
//! usually wrapping a registry error together with the source/destination it concerns.

pub mod handlers;

use crate::reference::ImageReference;
use std::fmt;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// A single entry of a registry error body (`{"errors":[{"code":..,"message":..}]}`)
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ErrorCode {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code.to_lowercase().replace('_', " "))
        } else {
            write!(f, "{}: {}", self.code.to_lowercase().replace('_', " "), self.message)
        }
    }
}

pub const ERROR_CODE_MANIFEST_INVALID: &str = "MANIFEST_INVALID";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("blob unknown to registry")]
    BlobUnknown,

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("denied: {0}")]
    Denied(String),

    /// Non-success response carrying the registry's error codes
    #[error("{}", format_registry_errors(.status, .errors))]
    Registry { status: u16, errors: Vec<ErrorCode> },

    #[error("network error: {0}")]
    Network(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("work queue closed")]
    Closed,
}

fn format_registry_errors(status: &u16, errors: &[ErrorCode]) -> String {
    if errors.is_empty() {
        return format!("unexpected status code {}", status);
    }
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RegistryError {
    /// True when the registry rejected a manifest with `MANIFEST_INVALID` as its first error.
    pub fn is_manifest_invalid(&self) -> bool {
        match self {
            RegistryError::Registry { errors, .. } => errors
                .first()
                .is_some_and(|e| e.code == ERROR_CODE_MANIFEST_INVALID),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::BlobUnknown | RegistryError::ManifestUnknown(_)
        )
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Parse(format!("invalid url: {}", err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("{0}")]
    Validation(String),

    /// A planning failure tied to a source and, when known, a destination
    #[error("{message}")]
    Retriever {
        src: ImageReference,
        dst: Option<ImageReference>,
        message: String,
    },

    #[error("{0}")]
    Copy(String),

    #[error("an error occurred during planning")]
    Planning,

    #[error("one or more errors occurred while uploading images")]
    Mirroring,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
}

impl MirrorError {
    pub fn retriever(src: &ImageReference, message: impl Into<String>) -> Self {
        MirrorError::Retriever {
            src: src.clone(),
            dst: None,
            message: message.into(),
        }
    }

    pub fn retriever_to(src: &ImageReference, dst: &ImageReference, message: impl Into<String>) -> Self {
        MirrorError::Retriever {
            src: src.clone(),
            dst: Some(dst.clone()),
            message: message.into(),
        }
    }
}
