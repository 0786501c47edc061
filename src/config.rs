//! Peer configuration.

use serde::Deserialize;
use std::time::Duration;

/// Connection and identity settings for a cluster peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Broker address as `host:port`.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Username for broker ACL authentication.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for broker authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database index.
    #[serde(default)]
    pub db: i64,
    /// Peer name override. When unset, a unique `peer-<uuid>` is generated.
    #[serde(default)]
    pub name: Option<String>,
    /// Prefix for every key and channel; a trailing `:` is appended when
    /// missing.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Interval between periodic full-state publications (milliseconds).
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_push_pull_interval"
    )]
    pub push_pull_interval: Duration,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn default_addr() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_push_pull_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            username: None,
            password: None,
            db: 0,
            name: None,
            prefix: None,
            push_pull_interval: default_push_pull_interval(),
        }
    }
}

impl PeerConfig {
    /// Loads configuration from `alertmesh.toml` and environment variables.
    ///
    /// # Priority (highest first):
    /// 1. Environment variables (ALERTMESH_*)
    /// 2. `alertmesh` file
    /// 3. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("alertmesh").required(false))
            .add_source(config::Environment::with_prefix("ALERTMESH"));

        builder.build()?.try_deserialize()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| format!("addr '{}' is not host:port", self.addr))?;
        if host.is_empty() {
            return Err(format!("addr '{}' has an empty host", self.addr));
        }
        if port.parse::<u16>().is_err() {
            return Err(format!("addr '{}' has an invalid port", self.addr));
        }
        if self.db < 0 {
            return Err("db must be non-negative".to_string());
        }
        if self.push_pull_interval.is_zero() {
            return Err("push_pull_interval must be non-zero".to_string());
        }
        Ok(())
    }

    /// Returns a new builder for configuration.
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::default()
    }
}

/// Builder for [`PeerConfig`].
#[derive(Default)]
pub struct PeerConfigBuilder {
    addr: Option<String>,
    username: Option<String>,
    password: Option<String>,
    db: Option<i64>,
    name: Option<String>,
    prefix: Option<String>,
    push_pull_interval: Option<Duration>,
}

impl PeerConfigBuilder {
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn db(mut self, db: i64) -> Self {
        self.db = Some(db);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn push_pull_interval(mut self, interval: Duration) -> Self {
        self.push_pull_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<PeerConfig, String> {
        let config = PeerConfig {
            addr: self.addr.unwrap_or_else(default_addr),
            username: self.username,
            password: self.password,
            db: self.db.unwrap_or(0),
            name: self.name,
            prefix: self.prefix,
            push_pull_interval: self
                .push_pull_interval
                .unwrap_or_else(default_push_pull_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PeerConfig::default();
        assert_eq!(config.addr, "127.0.0.1:6379");
        assert_eq!(config.db, 0);
        assert_eq!(config.push_pull_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_addr() {
        let mut config = PeerConfig::default();

        config.addr = "no-port".to_string();
        assert!(config.validate().is_err());

        config.addr = "host:not-a-port".to_string();
        assert!(config.validate().is_err());

        config.addr = ":6379".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_push_pull() {
        let mut config = PeerConfig::default();
        config.push_pull_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = PeerConfig::builder()
            .addr("redis.internal:6380")
            .db(3)
            .name("am-0")
            .prefix("am")
            .push_pull_interval(Duration::from_secs(30))
            .build()
            .unwrap();

        assert_eq!(config.addr, "redis.internal:6380");
        assert_eq!(config.db, 3);
        assert_eq!(config.name.as_deref(), Some("am-0"));
        assert_eq!(config.prefix.as_deref(), Some("am"));
        assert_eq!(config.push_pull_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_durations_deserialize_from_millis() {
        let config: PeerConfig =
            serde_json::from_str(r#"{"push_pull_interval": 15000}"#).unwrap();
        assert_eq!(config.push_pull_interval, Duration::from_secs(15));
    }
}
