//! Node configuration

use crate::error::MeepoError;
use meepo_proto::Addr;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one meepo node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeepoConfig {
    /// Peer id of this node, stamped on every outgoing request
    pub id: String,
    /// How long a control request waits for its response
    #[serde(rename = "request_timeout_ms", with = "duration_millis")]
    pub request_timeout: Duration,
    /// How long the front door waits for a new transport to settle
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Host used for automatically allocated listen addresses
    pub listen_host: String,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for MeepoConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            listen_host: "127.0.0.1".to_string(),
        }
    }
}

impl MeepoConfig {
    pub fn builder() -> MeepoConfigBuilder {
        MeepoConfigBuilder::default()
    }
}

/// Builder for MeepoConfig
#[derive(Default)]
pub struct MeepoConfigBuilder {
    config: MeepoConfig,
}

impl MeepoConfigBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn listen_host(mut self, host: impl Into<String>) -> Self {
        self.config.listen_host = host.into();
        self
    }

    pub fn build(self) -> Result<MeepoConfig, MeepoError> {
        if self.config.id.is_empty() {
            return Err(MeepoError::InvalidConfig("id is required".to_string()));
        }
        if self.config.request_timeout.is_zero() {
            return Err(MeepoError::InvalidConfig(
                "request_timeout must be positive".to_string(),
            ));
        }
        if self.config.listen_host.is_empty() {
            return Err(MeepoError::InvalidConfig(
                "listen_host is required".to_string(),
            ));
        }
        Ok(self.config)
    }
}

/// Caller overrides for a new teleportation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeleportationOptions {
    /// Local listen address; allocated on `listen_host` when absent
    pub local: Option<Addr>,
    /// Teleportation name; `"{network}:{address}"` of the remote when absent
    pub name: Option<String>,
}

impl TeleportationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_address(mut self, local: Addr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MeepoConfig::builder()
            .id("alice")
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.id, "alice");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.listen_host, "127.0.0.1");
    }

    #[test]
    fn test_config_builder_missing_id() {
        let result = MeepoConfig::builder().build();
        assert!(matches!(result, Err(MeepoError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_durations_as_millis() {
        let config = MeepoConfig::builder().id("alice").build().unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout_ms"], 30_000);

        let parsed: MeepoConfig = serde_json::from_str(
            r#"{"id":"bob","request_timeout_ms":3000,"connect_timeout_ms":7000,"listen_host":"0.0.0.0"}"#,
        )
        .unwrap();
        assert_eq!(parsed.connect_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_sub_second_timeout_survives_serde() {
        let config = MeepoConfig::builder()
            .id("alice")
            .request_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let parsed: MeepoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_teleportation_options() {
        let local: Addr = "127.0.0.1:8080".parse().unwrap();
        let opts = TeleportationOptions::new()
            .with_local_address(local)
            .with_name("ssh");

        assert_eq!(opts.local, Some(local));
        assert_eq!(opts.name.as_deref(), Some("ssh"));
    }
}
