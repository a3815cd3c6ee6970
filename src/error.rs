use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Convenience constructors
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Decode, message)
    }

    pub fn patch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Patch, message)
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StreamIo, message)
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Delivery, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

// ============================================================================
// Error Codes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Recovered locally, the frame is skipped
    Decode,
    Patch,

    // Fatal for the run
    StreamIo,
    InvalidState,
    Config,
    Internal,

    // Logged, never retried
    Delivery,
}

impl ErrorCode {
    /// Whether an error with this code ends the current stream run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decode | Self::Patch | Self::Delivery => false,
            Self::StreamIo | Self::InvalidState | Self::Config | Self::Internal => true,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decode => "DECODE",
            Self::Patch => "PATCH",
            Self::StreamIo => "STREAM_IO",
            Self::InvalidState => "INVALID_STATE",
            Self::Config => "CONFIG",
            Self::Internal => "INTERNAL",
            Self::Delivery => "DELIVERY",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, RelayError>;

// ============================================================================
// Error Conversion Implementations
// ============================================================================

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::stream(format!("IO error: {}", err))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::delivery(format!("HTTP error: {}", err))
    }
}

impl From<crate::stream::patch::PatchError> for RelayError {
    fn from(err: crate::stream::patch::PatchError) -> Self {
        Self::patch(err.to_string())
    }
}

// ============================================================================
// Error Context Extension
// ============================================================================

pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<RelayError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err = e.into();
            err.message = format!("{}: {}", context.into(), err.message);
            err
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn log_error(error: &RelayError) {
    if error.is_fatal() {
        log::error!("{}", error);
    } else {
        log::warn!("{}", error);
    }
}

// ============================================================================
// Tests
// ============================================================================
