//! Node configuration.
//!
//! Aggregates configuration from all modules into a single [`Config`]
//! loaded from YAML files and environment variables.

use std::time::Duration;

use serde::Deserialize;

/// Environment variable selecting the log filter.
pub const LOG_ENV_VAR: &str = "ANCHORAGE_LOG";

/// Environment variable pointing at an additional config file.
pub const CONFIG_ENV_VAR: &str = "ANCHORAGE_CONFIG";

/// Main node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AMQP broker configuration.
    pub amqp: crate::pubsub::amqp::Config,
    /// HTTP server and ingress configuration.
    pub http: HttpConfig,
    /// Witness policy configuration.
    pub policy: PolicyConfig,
    /// Expired-data sweeper configuration.
    pub expiry: ExpiryConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address for the HTTP server.
    pub listen: String,
    /// Ingress subscriber configuration.
    #[serde(flatten)]
    pub ingress: crate::ingress::Config,
    /// Bearer tokens accepted by the ingress endpoint. Empty means no
    /// token authorization is required.
    pub auth_tokens: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8077".to_string(),
            ingress: crate::ingress::Config::default(),
            auth_tokens: Vec::new(),
        }
    }
}

/// Witness policy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// TTL of the parsed policy cache.
    #[serde(with = "humantime_serde")]
    pub cache_expiry: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_expiry: Duration::from_secs(30),
        }
    }
}

/// Expired-data sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Interval between sweeps.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by the `ANCHORAGE_CONFIG` environment variable
    /// 3. Environment variables with the `ANCHORAGE` prefix
    ///    (e.g. `ANCHORAGE__AMQP__URI`)
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new("config.yaml", FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("ANCHORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.amqp.uri, "amqp://localhost:5672");
        assert_eq!(config.http.listen, "0.0.0.0:8077");
        assert_eq!(config.http.ingress.service_endpoint, "/inbox");
        assert_eq!(config.http.ingress.buffer_size, 100);
        assert!(config.http.auth_tokens.is_empty());
        assert_eq!(config.policy.cache_expiry, Duration::from_secs(30));
        assert_eq!(config.expiry.interval, Duration::from_secs(60));
    }

    #[test]
    fn for_test_matches_defaults() {
        let config = Config::for_test();
        assert_eq!(config.amqp.max_redelivery_attempts, 10);
    }
}
