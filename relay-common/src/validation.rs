//! Configuration validation for the relay.
//!
//! Validation never changes runtime behaviour: the binary logs what it finds
//! and keeps going, so an unknown app type still surfaces per turn.

use thiserror::Error;

use crate::config::{AppMode, Config, DifyConfig, ObservabilityConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ValidationError::Multiple(errors))
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.dify.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        collect(errors)
    }
}

impl Validate for DifyConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.api_base) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(ValidationError::InvalidValue {
                field: "dify.api_base".into(),
                reason: format!("unsupported scheme {}", url.scheme()),
            }),
            Err(e) => errors.push(ValidationError::InvalidValue {
                field: "dify.api_base".into(),
                reason: e.to_string(),
            }),
        }

        if self.api_key.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "dify.api_key".into(),
            });
        }

        if self.app_mode().is_err() {
            errors.push(ValidationError::InvalidValue {
                field: "dify.app_type".into(),
                reason: AppMode::MISCONFIGURED.into(),
            });
        }

        if self.image_upload_enable && self.image_cache_dir.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "dify.image_cache_dir".into(),
            });
        }

        collect(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("unknown level {}", self.log_level),
            });
        }

        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            errors.push(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("unknown format {}", self.log_format),
            });
        }

        collect(errors)
    }
}
