//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, PoolConfig, PulseConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &PulseConfig) -> ConfigResult<()> {
    validate_pool_config(&config.pool)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

/// Validates pool settings.
fn validate_pool_config(pool: &PoolConfig) -> ConfigResult<()> {
    validate_endpoint(&pool.endpoint)?;

    if pool.workers == 0 {
        return Err(ConfigError::validation("Worker count must be greater than 0"));
    }

    if pool.duration_secs == Some(0) {
        return Err(ConfigError::validation(
            "Duration must be greater than 0 when set",
        ));
    }

    if pool.drain_timeout_ms == 0 || pool.close_timeout_ms == 0 {
        return Err(ConfigError::validation("Timeouts must be greater than 0"));
    }

    if pool.channel_capacity == 0 {
        return Err(ConfigError::validation(
            "Channel capacity must be greater than 0",
        ));
    }

    Ok(())
}

/// Validates logging settings.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }

    if logging.filters.keys().any(|module| module.trim().is_empty()) {
        return Err(ConfigError::validation("Log filter module cannot be empty"));
    }

    Ok(())
}

/// Validates a pool endpoint URL.
pub fn validate_endpoint(url: &str) -> ConfigResult<()> {
    if url.is_empty() {
        return Err(ConfigError::missing_field("pool.endpoint"));
    }

    let valid_schemes = ["ws://", "wss://"];
    let Some(rest) = valid_schemes.iter().find_map(|s| url.strip_prefix(*s)) else {
        return Err(ConfigError::invalid_url(
            url,
            format!("URL must start with one of: {valid_schemes:?}"),
        ));
    };

    if rest.is_empty() || rest.starts_with('/') {
        return Err(ConfigError::invalid_url(url, "URL has no host"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = PulseConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("ws://localhost:8080").is_ok());
        assert!(validate_endpoint("wss://game.example.com/socket").is_ok());
        assert!(matches!(
            validate_endpoint(""),
            Err(ConfigError::MissingField { .. })
        ));
        assert!(matches!(
            validate_endpoint("http://localhost"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_endpoint("ws://"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = PulseConfig::default();
        config.pool.workers = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = PulseConfig::default();
        config.pool.close_timeout_ms = 0;
        assert!(validate_config(&config).is_err());

        let mut config = PulseConfig::default();
        config.pool.duration_secs = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_file_output_needs_path() {
        let mut config = PulseConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));

        config.logging.file_path = Some(PathBuf::from("logs/pulse.log"));
        assert!(validate_config(&config).is_ok());
    }
}
