use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProcessingError(format!("JSON serialization error: {}", err))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::ProcessingError(format!("I/O error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed or missing request fields; raised before any state change.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Durable write or signing failure. Always propagated to the caller.
    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),
}

impl LedgerError {
    /// Stable short name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config_error",
            Self::ValidationError(_) => "validation_error",
            Self::ProcessingError(_) => "processing_error",
            Self::NotFoundError(_) => "not_found",
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::ValidationError(format!("Missing required field: {}", field))
    }

    pub fn unknown_framework(framework: &str) -> Self {
        Self::NotFoundError(format!("Unknown compliance framework: {}", framework))
    }

    pub fn unknown_log_id(log_id: &str) -> Self {
        Self::NotFoundError(format!("No log entry with id {}", log_id))
    }

    pub fn unknown_category(category: &str) -> Self {
        Self::NotFoundError(format!("No retention policy for category: {}", category))
    }
}
