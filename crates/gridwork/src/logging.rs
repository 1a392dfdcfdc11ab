//! Logging bootstrap.
//!
//! Library code only emits `tracing` events. Applications that want them
//! printed call [`init_logging`] once at startup.

use tracing_subscriber::EnvFilter;

use gridwork_core::config::LoggingConfig;
use gridwork_core::error::{GridworkError, Result};

fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_new(&config.level)
        .map_err(|e| GridworkError::InvalidConfig(format!("log level '{}': {e}", config.level)))
}

/// Install a formatting subscriber, failing if one is already installed.
pub fn try_init_logging(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config)?)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| GridworkError::InvalidConfig(format!("logging already initialized: {e}")))
}

/// Install a formatting subscriber. Later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    if let Err(e) = try_init_logging(config) {
        tracing::debug!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LoggingConfig {
            level: "gridwork=loudest".to_string(),
            with_target: false,
        };
        assert!(matches!(
            try_init_logging(&config),
            Err(GridworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_second_init_is_ignored() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
