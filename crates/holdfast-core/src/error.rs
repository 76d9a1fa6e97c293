//! Error types for Holdfast

use crate::auth::AuthError;
use crate::domain::locking::LockError;
use crate::storage::StoreError;
use thiserror::Error;

/// Result type alias using Holdfast's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Holdfast error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E399)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Store errors (E400-E499)
    #[error(transparent)]
    Store(#[from] StoreError),

    // Login errors (E500-E599)
    #[error(transparent)]
    Auth(#[from] AuthError),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock(e) => e.code(),
            Self::Store(StoreError::Unavailable(_)) => "E400",
            Self::Store(StoreError::InvalidKey(_)) => "E401",
            Self::Store(StoreError::Io(_)) => "E402",
            Self::Auth(e) => e.code(),
            Self::ConfigError(_) => "E600",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lock(LockError::StoreUnavailable(_)) | Self::Store(StoreError::Unavailable(_)) => {
                Some("holdfast config get store.dir".to_string())
            }
            Self::Lock(LockError::InvalidConfig(_)) | Self::ConfigError(_) => {
                Some("holdfast config list".to_string())
            }
            Self::Auth(_) => {
                Some("Start the login again from the beginning".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_source_error() {
        let lock: Error = LockError::StoreUnavailable("disabled".to_string()).into();
        assert_eq!(lock.code(), "E301");
        assert_eq!(
            lock.suggestion().as_deref(),
            Some("holdfast config get store.dir")
        );

        let store: Error = StoreError::InvalidKey("../x".to_string()).into();
        assert_eq!(store.code(), "E401");
        assert!(store.suggestion().is_none());

        let auth: Error = AuthError::MissingQueryParameters.into();
        assert_eq!(auth.code(), "E500");
        assert!(auth.suggestion().is_some());
    }

    #[test]
    fn test_config_errors_point_at_config_list() {
        let err = Error::ConfigError("store.poll_interval_ms must be greater than zero".into());
        assert_eq!(err.code(), "E600");
        assert_eq!(err.suggestion().as_deref(), Some("holdfast config list"));
        assert!(err.to_string().starts_with("Configuration error:"));
    }

    #[test]
    fn test_transparent_messages() {
        let err: Error = StoreError::Io("disk full".to_string()).into();
        assert_eq!(err.to_string(), "Store I/O error: disk full");
    }
}
