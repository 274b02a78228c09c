//! Application-level request errors
//!
//! A failing request handler returns a `RequestError`; it travels as an
//! `X` frame and is reconstructed on the calling side.

use std::fmt;
use thiserror::Error;

/// Error code carried in an error response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Numeric(u64),
    Text(String),
}

impl ErrorCode {
    /// Parse a transmitted code: all-digit codes are numeric, anything else is text
    pub fn parse(code: &str) -> Self {
        if !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = code.parse() {
                return ErrorCode::Numeric(n);
            }
        }
        ErrorCode::Text(code.to_string())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Numeric(n) => write!(f, "{}", n),
            ErrorCode::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ErrorCode {
    fn from(code: u64) -> Self {
        ErrorCode::Numeric(code)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode::Numeric(u64::from(code))
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        ErrorCode::Text(code.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        ErrorCode::Text(code)
    }
}

/// Error raised by a request handler, with a code and a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request failed ({code}): {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub(crate) fn no_handler(topic: &str) -> Self {
        Self::new(error_codes::NO_HANDLER, format!("No request handler for topic '{}'", topic))
    }

    pub(crate) fn handler_panicked(topic: &str) -> Self {
        Self::new(error_codes::HANDLER_PANICKED, format!("Request handler for '{}' panicked", topic))
    }
}

/// Codes generated by the server itself
pub mod error_codes {
    pub const NO_HANDLER: &str = "ENOHANDLER";
    pub const HANDLER_PANICKED: &str = "EPANIC";
}
