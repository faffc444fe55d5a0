//! Secret references used in console configuration
//!
//! Values such as the bootstrap admin password or the TLS key can be given as:
//! - `env://VAR_NAME` - read from the process environment
//! - `file:///path/to/file` or a bare absolute/relative path - read from disk
//! - anything else - used literally

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::CommonError;

#[derive(Debug, Clone, PartialEq)]
pub enum SecretRef {
    /// Literal value
    Plain(String),

    /// Environment variable: `env://VAR_NAME`
    Env { var_name: String },

    /// File path: `file:///path/to/file` or just a path
    File { path: PathBuf },
}

impl SecretRef {
    /// Backend name for logging; never includes the value itself
    pub fn backend_name(&self) -> &'static str {
        match self {
            SecretRef::Plain(_) => "plain",
            SecretRef::Env { .. } => "env",
            SecretRef::File { .. } => "file",
        }
    }

    /// Resolve the reference to its value
    pub fn resolve(&self) -> Result<String, CommonError> {
        tracing::debug!(backend = self.backend_name(), "Resolving secret");

        match self {
            SecretRef::Plain(value) => Ok(value.clone()),
            SecretRef::Env { var_name } => {
                std::env::var(var_name).map_err(|_| CommonError::EnvNotSet {
                    var: var_name.clone(),
                })
            }
            SecretRef::File { path } => {
                std::fs::read_to_string(path).map_err(|e| CommonError::FileError {
                    path: path.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Resolve, trimming surrounding whitespace (trailing newlines in files)
    pub fn resolve_trimmed(&self) -> Result<String, CommonError> {
        self.resolve().map(|s| s.trim().to_string())
    }

    /// Resolve a password-like value exactly. Only the line ending of a file
    /// source is dropped; plain and env values keep every byte.
    pub fn resolve_exact(&self) -> Result<String, CommonError> {
        let value = self.resolve()?;
        match self {
            SecretRef::File { .. } => {
                let line = value
                    .strip_suffix('\n')
                    .map(|s| s.strip_suffix('\r').unwrap_or(s))
                    .unwrap_or(&value);
                Ok(line.to_string())
            }
            _ => Ok(value),
        }
    }
}

impl FromStr for SecretRef {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(CommonError::invalid_secret(
                    s,
                    "env reference must name a variable",
                ));
            }
            Ok(SecretRef::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(CommonError::invalid_secret(
                    s,
                    "file reference must name a path",
                ));
            }
            Ok(SecretRef::File {
                path: PathBuf::from(path),
            })
        } else if looks_like_file_path(s) {
            Ok(SecretRef::File {
                path: PathBuf::from(s),
            })
        } else {
            Ok(SecretRef::Plain(s.to_string()))
        }
    }
}

fn looks_like_file_path(s: &str) -> bool {
    s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s.ends_with(".pem")
        || s.ends_with(".crt")
        || s.ends_with(".key")
}

impl<'de> Deserialize<'de> for SecretRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretRef::from_str(&s).map_err(serde::de::Error::custom)
    }
}
