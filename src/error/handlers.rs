//! Standardized translation of HTTP failures into registry errors

use crate::error::{ErrorCode, RegistryError};
use reqwest::StatusCode;

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorCode>,
}

/// Turns non-success registry responses into [`RegistryError`]
pub struct ResponseErrorHandler;

impl ResponseErrorHandler {
    /// Parse the registry error body, tolerating empty or non-JSON bodies
    pub fn parse_error_codes(body: &str) -> Vec<ErrorCode> {
        serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.errors)
            .unwrap_or_default()
    }

    /// Classify a failed response. `context` names the operation for messages that
    /// carry no registry error codes.
    pub fn handle(status: StatusCode, body: &str, context: &str) -> RegistryError {
        let errors = Self::parse_error_codes(body);
        let first = errors.first().map(|e| e.code.as_str());

        match (status.as_u16(), first) {
            (404, Some("BLOB_UNKNOWN")) => RegistryError::BlobUnknown,
            (404, Some("MANIFEST_UNKNOWN")) => RegistryError::ManifestUnknown(context.to_string()),
            (401, _) => RegistryError::Unauthorized(Self::describe(context, &errors, body)),
            (403, _) => RegistryError::Denied(Self::describe(context, &errors, body)),
            _ if !errors.is_empty() => RegistryError::Registry {
                status: status.as_u16(),
                errors,
            },
            (404, None) => RegistryError::Registry {
                status: 404,
                errors: vec![ErrorCode {
                    code: "NAME_UNKNOWN".to_string(),
                    message: format!("{} not found", context),
                }],
            },
            (code, _) => RegistryError::Registry {
                status: code,
                errors: Vec::new(),
            },
        }
    }

    fn describe(context: &str, errors: &[ErrorCode], body: &str) -> String {
        if let Some(first) = errors.first() {
            format!("{}: {}", context, first)
        } else if body.trim().is_empty() {
            context.to_string()
        } else {
            format!("{}: {}", context, body.trim())
        }
    }
}

/// Network error categorization
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Network(format!("{} timed out: {}", context, error))
        } else if error.is_connect() {
            RegistryError::Network(format!("connection error during {}: {}", context, error))
        } else {
            RegistryError::Network(format!("{}: {}", context, error))
        }
    }
}
