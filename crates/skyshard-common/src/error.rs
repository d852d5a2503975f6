//! Common error handling utilities and patterns
//!
//! This module provides traits and macros to reduce duplication in error
//! handling across Skyshard crates while maintaining flexibility for
//! crate-specific needs.

use std::fmt;

/// Common error variants that appear across multiple crates
///
/// This trait provides a standardized interface for common error types
/// while allowing crates to add their own specific variants.
pub trait CommonError: std::error::Error + Send + Sync + 'static {
    /// Create an I/O error variant
    fn io_error(msg: impl Into<String>) -> Self
    where
        Self: Sized;

    /// Create a configuration error variant
    fn config_error(msg: impl Into<String>) -> Self
    where
        Self: Sized;

    /// Create an internal-invariant error variant
    fn internal_error(msg: impl Into<String>) -> Self
    where
        Self: Sized;
}

/// Trait for adding context to errors
///
/// This trait provides a consistent way to add context to errors across all
/// crates, similar to anyhow's context() but for custom error types.
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> Result<T, String>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Add context with a closure (lazy evaluation)
    fn with_context<C, F>(self, f: F) -> Result<T, String>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> Result<T, String>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|e| format!("{context}: {e}"))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, String>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|e| format!("{}: {}", f(), e))
    }
}

/// Macro to implement common error conversions
///
/// Generates `From` implementations for error types every crate ends up
/// converting from.
///
/// This will generate:
/// - From<std::io::Error> -> `io_error`
/// - From<anyhow::Error> -> `internal_error`
/// - with the `with_serde` variant, From<serde_json::Error> -> `config_error`
#[macro_export]
macro_rules! impl_common_conversions {
    ($error_type:ident) => {
        impl From<std::io::Error> for $error_type {
            fn from(e: std::io::Error) -> Self {
                <$error_type as $crate::CommonError>::io_error(e.to_string())
            }
        }

        impl From<anyhow::Error> for $error_type {
            fn from(e: anyhow::Error) -> Self {
                <$error_type as $crate::CommonError>::internal_error(e.to_string())
            }
        }
    };

    // Variant with serde_json support
    ($error_type:ident, with_serde) => {
        $crate::impl_common_conversions!($error_type);

        impl From<serde_json::Error> for $error_type {
            fn from(e: serde_json::Error) -> Self {
                <$error_type as $crate::CommonError>::config_error(format!("JSON: {}", e))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("IO error: {0}")]
        Io(String),
        #[error("Configuration error: {0}")]
        Configuration(String),
        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl CommonError for TestError {
        fn io_error(msg: impl Into<String>) -> Self {
            Self::Io(msg.into())
        }

        fn config_error(msg: impl Into<String>) -> Self {
            Self::Configuration(msg.into())
        }

        fn internal_error(msg: impl Into<String>) -> Self {
            Self::Internal(msg.into())
        }
    }

    #[test]
    fn test_common_error_trait() {
        let io_err = TestError::io_error("socket closed");
        assert_eq!(io_err.to_string(), "IO error: socket closed");

        let config_err = TestError::config_error("missing worker address");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: missing worker address"
        );
    }

    #[test]
    fn test_error_context() {
        let result: Result<(), TestError> = Err(TestError::io_error("original error"));
        let with_context = result.context("while dispatching job");
        assert!(with_context.is_err());
        assert!(with_context.unwrap_err().contains("while dispatching job"));
    }
}
