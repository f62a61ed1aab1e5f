use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use regex::Regex;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(err) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), err),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate config text. Environment variables are expanded first.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    config.storage.path = expand_tilde(&config.storage.path);

    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).expect("env var pattern is valid");
    let mut unexpanded: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded.is_empty() {
        return Ok(());
    }

    unexpanded.sort();
    unexpanded.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         Set them (e.g. export {}=...) or replace the $env{{...}} references with literal values",
        unexpanded.join(", "),
        unexpanded[0]
    )))
}

/// Upper bound for ingest durations; deadlines are computed as `now + duration`.
const MAX_INGEST_DURATION: Duration = Duration::from_secs(24 * 3600);

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let ingest = &config.ingest;

    if ingest.buffer_limit == 0 {
        errors.push("ingest.buffer_limit must be greater than 0".to_string());
    }
    if ingest.batch_size == 0 {
        errors.push("ingest.batch_size must be greater than 0".to_string());
    }
    if ingest.flush_interval.is_zero() {
        errors.push("ingest.flush_interval must be greater than 0".to_string());
    }
    if ingest.flush_timeout.is_zero() {
        errors.push("ingest.flush_timeout must be greater than 0".to_string());
    }
    for (name, value) in [
        ("flush_interval", ingest.flush_interval),
        ("flush_timeout", ingest.flush_timeout),
    ] {
        if value > MAX_INGEST_DURATION {
            errors.push(format!("ingest.{} must be at most 24h", name));
        }
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path must not be empty".to_string());
    }

    if config.web.listen.parse::<SocketAddr>().is_err() {
        errors.push(format!(
            "web.listen '{}' is not a valid socket address (expected host:port)",
            config.web.listen
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const VALID: &str = r#"
ingest:
  buffer_limit: 1000
  batch_size: 100
  flush_interval: 2s
  flush_timeout: 5s
storage:
  path: /tmp/ingestor-test.duckdb
web:
  listen: 127.0.0.1:7300
"#;

    #[test]
    fn test_parse_valid_config() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.ingest.buffer_limit, 1000);
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.ingest.flush_interval, Duration::from_secs(2));
        assert_eq!(config.storage.path, Path::new("/tmp/ingestor-test.duckdb"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", VALID).unwrap();
        file.flush().unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.web.listen, "127.0.0.1:7300");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/ingestor.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().contains("/nonexistent/ingestor.yml"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
ingest:
  buffer_limit: 0
  batch_size: 0
  flush_interval: 0ms
storage:
  path: /tmp/x.duckdb
web:
  listen: not-an-address
"#;
        match parse_config(yaml).unwrap_err() {
            ConfigError::ValidationList(errors) => {
                assert_eq!(errors.len(), 4);
                assert!(errors[0].contains("buffer_limit"));
                assert!(errors[3].contains("web.listen"));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let yaml = "ingest:\n  flush_interval: 25h\n  flush_timeout: 99999999999s\nstorage:\n  path: /tmp/x.duckdb\n";
        match parse_config(yaml).unwrap_err() {
            ConfigError::ValidationList(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("flush_interval"));
                assert!(errors[1].contains("flush_timeout"));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }

    #[test]
    fn test_overflowing_duration_rejected() {
        let yaml = "ingest:\n  flush_timeout: 99999999999999999h\nstorage:\n  path: /tmp/x.duckdb\n";
        assert!(matches!(
            parse_config(yaml).unwrap_err(),
            ConfigError::YamlParse(_)
        ));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let yaml = "ingest:\n  flush_interval: soon\nstorage:\n  path: /tmp/x.duckdb\n";
        assert!(matches!(
            parse_config(yaml).unwrap_err(),
            ConfigError::YamlParse(_)
        ));
    }

    #[test]
    fn test_env_var_expansion_in_storage_path() {
        std::env::set_var("INGESTOR_PARSE_TEST_DIR", "/data/metrics");
        let yaml = "storage:\n  path: $env{INGESTOR_PARSE_TEST_DIR}/db.duckdb\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.storage.path, Path::new("/data/metrics/db.duckdb"));
        std::env::remove_var("INGESTOR_PARSE_TEST_DIR");
    }

    #[test]
    fn test_unset_env_var_reported() {
        let yaml = "storage:\n  path: $env{INGESTOR_SURELY_UNSET_VAR}/db.duckdb\n";
        match parse_config(yaml).unwrap_err() {
            ConfigError::Validation(msg) => assert!(msg.contains("INGESTOR_SURELY_UNSET_VAR")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
