//! Configuration validation module.
//!
//! Checks every section up front so a bad value fails startup instead of
//! surfacing mid-export.

use crate::{AppConfig, StoreBackend};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Port number is invalid (must be 1-65535).
    InvalidPort { name: String, value: u16 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// A count or size that must be positive is zero.
    ZeroValue { name: String },
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Initial backoff exceeds the backoff ceiling.
    InvalidBackoff { initial_ms: u64, max_ms: u64 },
    /// Standard cache TTL exceeds the extended one.
    InvalidCacheTtl { standard: u64, extended: u64 },
    /// Progress step must be within 1..=100.
    InvalidProgressStep { value: u8 },
    /// Key prefix is empty.
    EmptyKeyPrefix,
    /// Log level is invalid.
    InvalidLogLevel { value: String },
    /// Log format is invalid.
    InvalidLogFormat { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort { name, value } => {
                write!(f, "Invalid port for {}: {} (must be 1-65535)", name, value)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::ZeroValue { name } => write!(f, "'{}' must be greater than zero", name),
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidBackoff { initial_ms, max_ms } => {
                write!(
                    f,
                    "Initial backoff ({}ms) cannot exceed max backoff ({}ms)",
                    initial_ms, max_ms
                )
            }
            Self::InvalidCacheTtl { standard, extended } => {
                write!(
                    f,
                    "Standard cache TTL ({}s) cannot exceed extended TTL ({}s)",
                    standard, extended
                )
            }
            Self::InvalidProgressStep { value } => {
                write!(f, "Invalid progress step: {}% (must be 1-100)", value)
            }
            Self::EmptyKeyPrefix => write!(f, "Store key prefix cannot be empty"),
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{}' (valid: trace, debug, info, warn, error)",
                    value
                )
            }
            Self::InvalidLogFormat { value } => {
                write!(f, "Invalid log format: '{}' (valid: pretty, json)", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];
    const VALID_LOG_FORMATS: &'static [&'static str] = &["pretty", "json"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::default();

        Self::validate_server(&config.server, &mut result);
        Self::validate_database(&config.database, &mut result);
        Self::validate_store(&config.store, &mut result);
        Self::validate_export(&config.export, &mut result);
        Self::validate_observability(&config.observability, &mut result);

        result.into_result()
    }

    fn validate_server(config: &crate::ServerConfig, result: &mut ValidationResult) {
        if config.port == 0 {
            result.add_error(ConfigValidationError::InvalidPort {
                name: "server.port".to_string(),
                value: config.port,
            });
        }
        if config.request_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "server.request_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_database(config: &crate::DatabaseConfig, result: &mut ValidationResult) {
        if config.url.is_empty() {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        } else if !config.url.starts_with("sqlite:") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL must start with sqlite:".to_string(),
            });
        }
        if config.max_connections == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "database.max_connections".to_string(),
            });
        }
    }

    fn validate_store(config: &crate::StoreConfig, result: &mut ValidationResult) {
        if config.key_prefix.is_empty() {
            result.add_error(ConfigValidationError::EmptyKeyPrefix);
        }
        if config.backend != StoreBackend::Redis {
            return;
        }
        match Url::parse(&config.url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(_) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "store".to_string(),
                message: "URL must use redis:// or rediss://".to_string(),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "store".to_string(),
                message: e.to_string(),
            }),
        }
        if config.pool_size == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "store.pool_size".to_string(),
            });
        }
    }

    fn validate_export(config: &crate::ExportConfig, result: &mut ValidationResult) {
        let queue = &config.queue;
        if queue.concurrency_limit == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "export.queue.concurrency_limit".to_string(),
            });
        }
        if queue.maintenance_interval_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "export.queue.maintenance_interval_secs".to_string(),
                value: 0,
            });
        }
        if queue.initial_backoff_ms > queue.max_backoff_ms {
            result.add_error(ConfigValidationError::InvalidBackoff {
                initial_ms: queue.initial_backoff_ms,
                max_ms: queue.max_backoff_ms,
            });
        }

        let executor = &config.executor;
        if executor.batch_size == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "export.executor.batch_size".to_string(),
            });
        }
        if executor.checkpoint_items == 0 {
            result.add_error(ConfigValidationError::ZeroValue {
                name: "export.executor.checkpoint_items".to_string(),
            });
        }
        if executor.checkpoint_interval_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "export.executor.checkpoint_interval_secs".to_string(),
                value: 0,
            });
        }

        let cache = &config.cache;
        if cache.standard_ttl_secs > cache.extended_ttl_secs {
            result.add_error(ConfigValidationError::InvalidCacheTtl {
                standard: cache.standard_ttl_secs,
                extended: cache.extended_ttl_secs,
            });
        }

        let gateway = &config.gateway;
        if gateway.progress_step_percent == 0 || gateway.progress_step_percent > 100 {
            result.add_error(ConfigValidationError::InvalidProgressStep {
                value: gateway.progress_step_percent,
            });
        }
        if gateway.stall_threshold_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "export.gateway.stall_threshold_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_observability(config: &crate::ObservabilityConfig, result: &mut ValidationResult) {
        if !Self::VALID_LOG_LEVELS.contains(&config.log_level.to_lowercase().as_str()) {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.log_level.clone(),
            });
        }
        if !Self::VALID_LOG_FORMATS.contains(&config.log_format.to_lowercase().as_str()) {
            result.add_error(ConfigValidationError::InvalidLogFormat {
                value: config.log_format.clone(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
