use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Service URLs are http(s) URLs
/// - Watch buffer is not empty
/// - Settle retry delays are positive and ordered
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    for (name, service) in [
        ("job_engine", &config.job_engine),
        ("placement", &config.placement),
        ("directory", &config.directory),
    ] {
        if !(service.url.starts_with("http://") || service.url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "{}.url must be an http(s) URL, got {:?}",
                name, service.url
            )));
        }
        if service.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{}.timeout_secs cannot be 0",
                name
            )));
        }
    }

    if config.migration.watch_buffer == 0 {
        return Err(ConfigError::ValidationError(
            "migration.watch_buffer cannot be 0".to_string(),
        ));
    }

    let migration = &config.migration;
    if migration.settle_retry_initial_ms == 0 {
        return Err(ConfigError::ValidationError(
            "migration.settle_retry_initial_ms cannot be 0".to_string(),
        ));
    }
    if migration.settle_retry_max_ms < migration.settle_retry_initial_ms {
        return Err(ConfigError::ValidationError(
            "migration.settle_retry_max_ms cannot be below settle_retry_initial_ms".to_string(),
        ));
    }

    Ok(())
}
