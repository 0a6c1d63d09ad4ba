//! Tracing subscriber setup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingOptions;
use crate::error::{Error, Result};

/// Build the `EnvFilter` described by `options`.
pub fn env_filter(options: &LoggingOptions) -> Result<EnvFilter> {
    let level: Level = options.level.parse().map_err(|_| {
        Error::invalid_arg(format!("invalid log level '{}'", options.level))
    })?;

    let directives = options.filter.as_deref().unwrap_or("tensorserve_core=info");
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse(directives)
        .map_err(|e| Error::invalid_arg(format!("invalid log filter '{}': {}", directives, e)))
}

/// Install the global `tracing` subscriber described by `options`.
///
/// Returns `ALREADY_EXISTS` when a global subscriber is already installed.
pub fn init(options: &LoggingOptions) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(options)?)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| Error::already_exists(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_filter_from_options() {
        assert!(env_filter(&LoggingOptions::default()).is_ok());

        let options = LoggingOptions {
            level: "debug".to_string(),
            filter: Some("tensorserve_core=trace,tokio=warn".to_string()),
        };
        assert!(env_filter(&options).is_ok());
    }

    #[test]
    fn test_bad_level_rejected() {
        let options = LoggingOptions {
            level: "loud".to_string(),
            filter: None,
        };
        let err = env_filter(&options).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
        assert!(err.message().contains("loud"));
    }

    #[test]
    fn test_bad_filter_rejected() {
        let options = LoggingOptions {
            level: "info".to_string(),
            filter: Some("tensorserve_core=notalevel".to_string()),
        };
        assert_eq!(env_filter(&options).unwrap_err().code(), ErrorCode::InvalidArg);
    }
}
