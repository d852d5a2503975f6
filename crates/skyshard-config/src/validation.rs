//! Configuration validation helpers

use crate::{ConfigError, ConfigResult};
use once_cell::sync::Lazy;
use regex::Regex;

static URL_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").ok());

/// Trait for validating configuration values
pub trait Validate {
    /// Validate this configuration object
    ///
    /// # Errors
    /// Returns validation errors if the configuration is invalid
    fn validate(&self) -> ConfigResult<()>;
}

/// Validate an HTTP(S) URL, e.g. the registry endpoint.
///
/// # Errors
/// Returns `ConfigError::InvalidUrl` if the URL format is invalid
pub fn validate_url(url: &str, _field_name: &str) -> ConfigResult<()> {
    let ok = match URL_REGEX.as_ref() {
        Some(regex) => regex.is_match(url),
        // Regex failed to compile: fall back to a scheme check.
        None => url.starts_with("http://") || url.starts_with("https://"),
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            url: url.to_string(),
        })
    }
}

/// Validate a port number
///
/// # Errors
/// Returns `ConfigError::InvalidPort` if port is 0
pub const fn validate_port(port: u16, _field_name: &str) -> ConfigResult<()> {
    if port == 0 {
        Err(ConfigError::InvalidPort { port })
    } else {
        Ok(())
    }
}

/// Validate a value is within an inclusive range
///
/// # Errors
/// Returns `ConfigError::OutOfRange` if value is outside the specified range
pub fn validate_range(value: u64, min: u64, max: u64, field_name: &str) -> ConfigResult<()> {
    if value < min || value > max {
        Err(ConfigError::OutOfRange {
            field: field_name.to_string(),
            value,
            min,
            max,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_urls() {
        assert!(validate_url("http://localhost:25081/workers", "registry").is_ok());
        assert!(validate_url("not-a-url", "registry").is_err());
    }

    #[test]
    fn rejects_port_zero() {
        assert!(validate_port(0, "czar_port").is_err());
        assert!(validate_port(4040, "czar_port").is_ok());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(validate_range(3, 1, 10, "max_attempts").is_ok());
        assert!(validate_range(0, 1, 10, "max_attempts").is_err());
        assert!(validate_range(11, 1, 10, "max_attempts").is_err());
    }
}
