//! Error types for the override engine.
//!
//! Mutations fail with [`ValidationError`] or [`OverrideError::NotFound`];
//! bulk imports aggregate every per-record failure into an [`ImportError`].
//! The lookup path never returns an error.

use crate::rule::RuleId;
use std::fmt;
use thiserror::Error;

/// A rule field violated one of the rule invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The pattern is empty or whitespace.
    #[error("Pattern cannot be empty")]
    EmptyPattern,

    /// An exact or wildcard pattern is not a valid hostname pattern.
    #[error("Invalid hostname pattern '{pattern}': {reason}")]
    InvalidHostnamePattern { pattern: String, reason: String },

    /// A wildcard appears somewhere other than the leading label.
    #[error("Invalid wildcard pattern '{pattern}': only a single leading '*' label is allowed")]
    InvalidWildcard { pattern: String },

    /// A regex pattern failed to compile.
    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    /// The target host is empty.
    #[error("Target host cannot be empty")]
    EmptyTargetHost,

    /// The target host is neither an IP literal nor a hostname.
    #[error("Invalid target host: {host}")]
    InvalidTargetHost { host: String },

    /// The target port is outside 1..=65535.
    #[error("Target port out of range (1-65535): {port}")]
    PortOutOfRange { port: i64 },

    /// A reorder request is not a permutation of the current rules.
    #[error("Invalid rule order: {reason}")]
    InvalidOrder { reason: String },
}

/// One rejected record from a bulk import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    /// Position of the record in the imported sequence.
    pub index: usize,
    /// Why it was rejected.
    pub error: ValidationError,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {}: {}", self.index, self.error)
    }
}

/// All failures collected from a rejected import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportError {
    pub failures: Vec<RecordError>,
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invalid record(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for ImportError {}

/// Main error type for the override engine and its bridge.
#[derive(Error, Debug)]
pub enum OverrideError {
    /// A rule failed validation; the store is unchanged.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The referenced rule does not exist.
    #[error("Rule not found: {id}")]
    NotFound { id: RuleId },

    /// A bulk import was rejected as a whole.
    #[error("Import rejected: {0}")]
    Import(#[from] ImportError),

    /// Configuration or rule file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration or rule file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// The file watcher could not be started.
    #[error("File watcher error: {message}")]
    Watch { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverrideError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Returns the validation error, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias using OverrideError.
pub type Result<T> = std::result::Result<T, OverrideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OverrideError::ConfigNotFound {
            path: "/etc/host-override/config.yaml".to_string(),
        };
        assert!(err.to_string().contains("/etc/host-override/config.yaml"));

        let err = OverrideError::config_parse("invalid yaml");
        assert!(err.to_string().contains("invalid yaml"));

        let err = OverrideError::NotFound { id: RuleId::new(7) };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OverrideError = io_err.into();
        assert!(matches!(err, OverrideError::Io(_)));
    }

    #[test]
    fn test_import_error_lists_every_failure() {
        let err = ImportError {
            failures: vec![
                RecordError {
                    index: 0,
                    error: ValidationError::EmptyPattern,
                },
                RecordError {
                    index: 3,
                    error: ValidationError::PortOutOfRange { port: 70000 },
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 invalid record(s)"));
        assert!(text.contains("record 0"));
        assert!(text.contains("record 3"));
        assert!(text.contains("70000"));
    }

    #[test]
    fn test_as_validation() {
        let err: OverrideError = ValidationError::EmptyTargetHost.into();
        assert_eq!(err.as_validation(), Some(&ValidationError::EmptyTargetHost));
        assert!(OverrideError::config_parse("x").as_validation().is_none());
    }
}
