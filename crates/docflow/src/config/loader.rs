use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DOCFLOW_CONFIG";
/// Environment variable overriding `storage.presign_secret`.
pub const PRESIGN_SECRET_ENV: &str = "DOCFLOW_PRESIGN_SECRET";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let mut config: Config = serde_json::from_str(content)?;

    if let Ok(secret) = std::env::var(PRESIGN_SECRET_ENV) {
        config.storage.presign_secret = secret;
    }

    validate_config(&config)?;

    Ok(config)
}

/// Picks the config file: an explicit path first, then `DOCFLOW_CONFIG`.
/// With neither, the defaults apply.
pub fn resolve_config(explicit: Option<PathBuf>) -> Result<Config, ConfigError> {
    match explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
        Some(path) => load_config(path),
        None => {
            let mut config = Config::default();
            if let Ok(secret) = std::env::var(PRESIGN_SECRET_ENV) {
                config.storage.presign_secret = secret;
            }
            validate_config(&config)?;
            Ok(config)
        }
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.storage.max_object_bytes == 0 {
        return Err(invalid("storage.max_object_bytes must be > 0"));
    }

    let pipeline = &config.pipeline;
    if pipeline.chunk_size == 0 {
        return Err(invalid("pipeline.chunk_size must be > 0"));
    }
    if pipeline.chunk_overlap >= pipeline.chunk_size {
        return Err(invalid(format!(
            "pipeline.chunk_overlap ({}) must be smaller than chunk_size ({})",
            pipeline.chunk_overlap, pipeline.chunk_size
        )));
    }
    if pipeline.max_text_bytes == 0 {
        return Err(invalid("pipeline.max_text_bytes must be > 0"));
    }
    if pipeline.soft_deadline_secs == 0 || pipeline.soft_deadline_secs > pipeline.job_timeout_secs {
        return Err(invalid(
            "pipeline.soft_deadline_secs must be between 1 and job_timeout_secs",
        ));
    }

    let queue = &config.queue;
    if queue.worker_count == 0 {
        return Err(invalid("queue.worker_count must be > 0"));
    }
    if queue.lease_secs < pipeline.job_timeout_secs {
        return Err(invalid(format!(
            "queue.lease_secs ({}) must cover pipeline.job_timeout_secs ({})",
            queue.lease_secs, pipeline.job_timeout_secs
        )));
    }
    if queue.backoff_max_secs < queue.backoff_base_secs {
        return Err(invalid("queue.backoff_max_secs must be >= backoff_base_secs"));
    }

    let retention = &config.retention;
    if retention.batch_limit == 0 || retention.interval_secs == 0 {
        return Err(invalid(
            "retention.batch_limit and retention.interval_secs must be > 0",
        ));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.pipeline.max_retries, 3);
        assert_eq!(config.pipeline.chunk_size, 512);
        assert_eq!(config.retention.window_days, 30);
        assert_eq!(config.retention.interval_secs, 6 * 60 * 60);
        assert_eq!(config.queue.backoff_base_secs, 30);
        assert!(config.queue.worker_count > 0);
    }

    #[test]
    fn test_load_valid_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database": { "path": "/var/lib/docflow/docflow.db" },
            "storage": { "root": "/var/lib/docflow/objects", "max_object_bytes": 1048576 },
            "pipeline": { "max_retries": 5, "chunk_size": 256, "chunk_overlap": 20 },
            "queue": { "worker_count": 2 },
            "logging": { "filter": "docflow=debug", "json": true }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.min_chunk_size, 100);
        assert_eq!(config.queue.worker_count, 2);
        assert!(config.logging.json);
        assert_eq!(config.retry_policy().max_attempts(), 6);
        assert_eq!(config.storage.max_object_bytes, 1_048_576);
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_chunk() {
        let err = load_config_from_str(
            r#"{ "pipeline": { "chunk_size": 100, "chunk_overlap": 100 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_rejects_short_lease() {
        let err = load_config_from_str(
            r#"{ "pipeline": { "job_timeout_secs": 600 }, "queue": { "lease_secs": 60 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("lease_secs"));
    }

    #[test]
    fn test_rejects_unknown_version() {
        assert!(load_config_from_str(r#"{ "version": "2.0" }"#).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            load_config_from_str("{ not json"),
            Err(ConfigError::ParseJson(_))
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = load_config("/nonexistent/docflow.json").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
