//! Error types for the admission service.

use thiserror::Error;

/// Main error type for admission operations.
///
/// Exceeding a limit is not an error; it is reported through a
/// [`Verdict`](crate::ratelimit::Verdict).
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter or its backing state could not evaluate the request
    #[error("Limiter unavailable: {0}")]
    Unavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Whether the error came from malformed or missing configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(self, AdmissionError::Config(_))
    }
}

impl From<config::ConfigError> for AdmissionError {
    fn from(err: config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AdmissionError::Config("permit_limit must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: permit_limit must be positive"
        );
        assert!(err.is_config_error());

        let err = AdmissionError::Unavailable("slot queue closed".to_string());
        assert_eq!(err.to_string(), "Limiter unavailable: slot queue closed");
        assert!(!err.is_config_error());
    }
}
