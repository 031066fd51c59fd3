//! Configuration validation.
//!
//! Field-level validation rules with dotted-path error messages, so a single
//! pass over a configuration file reports every problem at once.

use std::time::Duration;
use thiserror::Error;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation context for building error messages.
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self {
            field_path: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    /// Exit the current field context.
    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a field error with automatic path.
    pub fn field_error(&mut self, message: String) {
        self.add_error(ValidationError::FieldError {
            field: self.current_path(),
            message,
        });
    }

    /// Record `result` under `field` if it failed.
    pub fn check(&mut self, field: &str, result: ValidationResult<()>) {
        if let Err(e) = result {
            self.enter(field);
            self.field_error(e.to_string());
            self.exit();
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Consume the context and return a result.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if !self.has_errors() {
            Ok(())
        } else {
            let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
            Err(ValidationError::Multiple(messages.join("; ")))
        }
    }
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Validator for `host:port` transport addresses.
pub struct AddressValidator;

impl AddressValidator {
    pub fn validate(addr: &str) -> ValidationResult<()> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| ValidationError::InvalidFormat {
            field: "address".to_string(),
            message: format!("'{}' is not in host:port form", addr),
        })?;

        if host.trim().is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "address".to_string(),
                message: format!("'{}' has an empty host", addr),
            });
        }

        port.parse::<u16>()
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidFormat {
                field: "address".to_string(),
                message: format!("'{}' has an invalid port", addr),
            })
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_positive_u64(value: u64, field: &str) -> ValidationResult<()> {
        if value == 0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }
}

/// Validator for timeouts.
pub struct DurationValidator;

impl DurationValidator {
    pub fn validate_positive(value: Duration, field: &str) -> ValidationResult<()> {
        if value.is_zero() {
            return Err(ValidationError::FieldError {
                field: field.to_string(),
                message: "duration must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_within(
        value: Duration,
        min: Duration,
        max: Duration,
        field: &str,
    ) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: format!("{:?}", value),
                min: format!("{:?}", min),
                max: format!("{:?}", max),
            });
        }
        Ok(())
    }
}
