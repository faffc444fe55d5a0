use std::path::PathBuf;

use thiserror::Error;

/// Errors shared by the console binary and its library
#[derive(Debug, Error)]
pub enum CommonError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Invalid secret reference '{reference}': {reason}")]
    InvalidSecret { reference: String, reason: String },

    #[error("Environment variable '{var}' not set")]
    EnvNotSet { var: String },

    #[error("Failed to read file '{path}': {message}")]
    FileError { path: PathBuf, message: String },
}

impl CommonError {
    pub fn invalid_secret(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSecret {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}
