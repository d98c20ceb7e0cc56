//! Common error types for Warden components.

use thiserror::Error;

/// Common errors across Warden components
#[derive(Debug, Error)]
pub enum WardenError {
    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The daemon is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

impl WardenError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::ShuttingDown => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WardenError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(WardenError::ShuttingDown.status_code(), 503);
    }
}
