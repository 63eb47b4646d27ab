//! Workload Error Types
//!
//! Errors raised by the processor and transmitter workers and by option
//! resolution. Bus errors are wrapped so that their classification stays
//! available to the worker deciding whether to count or to stop.

use exabus::BusError;
use thiserror::Error;

/// Main workload error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BenchError {
    /// Invalid or conflicting workload options
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        field: Option<String>,
    },

    /// Error reported by the bus layer
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Inbound message whose header does not match its content
    #[error("Malformed message header: {message}")]
    Header { message: String },

    /// A blocking transmitter received a response for another request
    #[error("Unexpected response sequence: expected {expected}, got {actual}")]
    Correlation { expected: u32, actual: u32 },

    /// More responses than requests outstanding
    #[error("Disposal violation: {message}")]
    Disposal { message: String },

    /// The workload is shutting down
    #[error("Workload stopped")]
    Stopped,
}

/// Result type alias for workload operations
pub type Result<T> = std::result::Result<T, BenchError>;

impl BenchError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Config {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a header error
    pub fn header(message: impl Into<String>) -> Self {
        Self::Header {
            message: message.into(),
        }
    }

    /// Create a disposal violation
    pub fn disposal(message: impl Into<String>) -> Self {
        Self::Disposal {
            message: message.into(),
        }
    }

    /// Errors that terminate the worker that observed them
    pub fn is_fatal(&self) -> bool {
        match self {
            BenchError::Bus(error) => !error.is_recoverable(),
            BenchError::Stopped => false,
            _ => true,
        }
    }

    pub fn is_configuration(&self) -> bool {
        match self {
            BenchError::Config { .. } => true,
            BenchError::Bus(error) => error.is_configuration(),
            _ => false,
        }
    }

    /// Get error category for the error counter
    pub fn category(&self) -> &'static str {
        match self {
            BenchError::Config { .. } => "config",
            BenchError::Bus(error) => error.category(),
            BenchError::Header { .. } => "header",
            BenchError::Correlation { .. } => "correlation",
            BenchError::Disposal { .. } => "disposal",
            BenchError::Stopped => "stopped",
        }
    }
}
