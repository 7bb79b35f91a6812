//! Error types for bus trace decoding

use thiserror::Error;

/// Result type for decoder operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Errors surfaced to the host.
///
/// Protocol faults seen on the bus (timeouts, aborts, parity errors) are
/// never reported here; they travel as flags on the decoded transaction and
/// as the classification of its annotation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The sample source failed to supply a value or the capture bounds
    #[error("Sample source error: {0}")]
    Source(String),

    /// Capture bounds are unusable
    #[error("Invalid sample range: {0}")]
    InvalidRange(String),

    /// Setting index outside the protocol's setting table
    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    /// Option index outside a setting's option list
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Session was built without a sample source
    #[error("Missing sample source: {0}")]
    MissingSource(String),

    /// Signal group not declared by the protocol
    #[error("Unknown signal group: {0}")]
    UnknownGroup(String),

    /// Command code outside the protocol's command table
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl DecodeError {
    /// Create a new Source error
    pub fn source_failed(msg: impl Into<String>) -> Self {
        DecodeError::Source(msg.into())
    }

    /// Create a new InvalidRange error
    pub fn invalid_range(msg: impl Into<String>) -> Self {
        DecodeError::InvalidRange(msg.into())
    }

    /// Create a new UnknownSetting error
    pub fn unknown_setting(msg: impl Into<String>) -> Self {
        DecodeError::UnknownSetting(msg.into())
    }

    /// Create a new InvalidOption error
    pub fn invalid_option(msg: impl Into<String>) -> Self {
        DecodeError::InvalidOption(msg.into())
    }

    /// Create a new MissingSource error
    pub fn missing_source(msg: impl Into<String>) -> Self {
        DecodeError::MissingSource(msg.into())
    }

    /// Create a new UnknownGroup error
    pub fn unknown_group(msg: impl Into<String>) -> Self {
        DecodeError::UnknownGroup(msg.into())
    }

    /// Create a new UnknownCommand error
    pub fn unknown_command(msg: impl Into<String>) -> Self {
        DecodeError::UnknownCommand(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::invalid_option("ADDR_WIDTH has no option 7");
        assert!(err.to_string().contains("Invalid option"));
        assert!(err.to_string().contains("ADDR_WIDTH"));
    }

    #[test]
    fn test_source_error_display() {
        let err = DecodeError::source_failed("group 3 unavailable");
        assert_eq!(err.to_string(), "Sample source error: group 3 unavailable");
    }
}
