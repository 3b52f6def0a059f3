use ingestor::config::Config as IngestorConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "market_sync".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub ingestor: IngestorConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestor::config::{FailureMode, StoreConfig};
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            ingestor:
                api:
                    base_url: https://universalis.app/api/v2/
                catalog:
                    path: /etc/market-sync/items.csv
                store:
                    type: mongodb
                    connection_string: mongodb://db.internal:27017/?replicaSet=rs0
                regions:
                    - name: NA
                      partitions: [Aether, Primal]
                on_partition_failure: skip
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "market_sync");
        assert_eq!(config.common.logging.level, "debug");
        assert!(config.common.logging.sentry_dsn.is_some());

        assert!(config.ingestor.validate().is_ok());
        assert_eq!(
            config.ingestor.store,
            StoreConfig::Mongodb {
                connection_string: "mongodb://db.internal:27017/?replicaSet=rs0".into()
            }
        );
        assert_eq!(config.ingestor.on_partition_failure, FailureMode::Skip);
    }

    #[test]
    fn common_sections_are_optional() {
        let yaml = r#"
            ingestor:
                api:
                    base_url: http://127.0.0.1:8080/
                catalog:
                    path: items.csv
                store:
                    type: memory
                regions:
                    - name: EU
                      partitions: [Chaos]
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.common.metrics.is_none());
        assert_eq!(config.common.logging, LoggingConfig::default());
    }

    #[test]
    fn load_errors() {
        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/config.yaml")),
            Err(ConfigError::LoadError(_))
        ));

        let tmp = write_tmp_file("logging: {level: info}\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
