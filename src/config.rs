use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SwarmError};

pub const DEFAULT_PRIVATE_KEY: &str = "default_insecure_secret";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Stable identifier of this member.
    pub identifier: String,
    /// Base URL other members reach this process on.
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Base URL of the controller. Absent means this process is the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_address: Option<String>,
    /// Shared cluster secret.
    pub private_key: String,
    /// Nodes that must be connected before an update may proceed.
    pub update_required_node_count: usize,
    pub bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    /// Where staged update packages are written.
    pub staging_directory: PathBuf,
    /// Controller only. Generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_signing_key_base64: Option<String>,
    pub health: HealthConfig,
    #[serde(with = "duration_secs")]
    pub update_commit_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

/// Health check cadence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Controller sweep interval.
    #[serde(with = "duration_secs")]
    pub controller_interval: Duration,
    /// Node ping interval.
    #[serde(with = "duration_secs")]
    pub node_interval: Duration,
    /// Delay before a forced controller sweep, letting a restarted peer boot.
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,
    /// Backoff between node re-registration attempts.
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            controller_interval: Duration::from_secs(180),
            node_interval: Duration::from_secs(300),
            settle_delay: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000);
        Self {
            identifier: "swarmd".into(),
            address: "http://127.0.0.1:5000".into(),
            public_address: None,
            controller_address: None,
            private_key: DEFAULT_PRIVATE_KEY.into(),
            update_required_node_count: 0,
            bind,
            bind_ip: None,
            staging_directory: PathBuf::from("staging"),
            token_signing_key_base64: None,
            health: HealthConfig::default(),
            update_commit_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("swarmd.toml"))
            .merge(Json::file("swarmd.json"))
            .merge(Env::prefixed("SWARMD_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("SWARMD_PRIVATE_KEY_FILE") {
            config.private_key = std::fs::read_to_string(secret_file)?.trim().to_string();
        }

        // If bind_ip is set, override the IP part of bind
        if let Some(ref ip) = config.bind_ip {
            let port = config.bind.port();
            config.bind = format!("{}:{}", ip, port)
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(SwarmError::Config("identifier must not be empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(SwarmError::Config("address must not be empty".into()));
        }
        if self.private_key.is_empty() {
            return Err(SwarmError::Config("private_key must not be empty".into()));
        }
        if let Some(controller) = &self.controller_address {
            if controller.trim_end_matches('/') == self.address.trim_end_matches('/') {
                return Err(SwarmError::Config(
                    "controller_address points at this process; omit it to run as controller"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_controller(&self) -> bool {
        self.controller_address.is_none()
    }
}

/// Serde helper for Duration as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_cadence() {
        let config = Config::default();
        assert!(config.is_controller());
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.health.controller_interval, Duration::from_secs(180));
        assert_eq!(config.health.node_interval, Duration::from_secs(300));
        assert_eq!(config.health.settle_delay, Duration::from_secs(15));
        assert_eq!(config.health.retry_backoff, Duration::from_secs(5));
        assert_eq!(config.update_commit_timeout, Duration::from_secs(600));
    }

    #[test]
    fn layered_values_override_defaults() {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                identifier = "node-a"
                controller_address = "http://controller:5000"
                update_required_node_count = 2

                [health]
                node_interval = 60
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.identifier, "node-a");
        assert!(!config.is_controller());
        assert_eq!(config.update_required_node_count, 2);
        assert_eq!(config.health.node_interval, Duration::from_secs(60));
        assert_eq!(config.health.settle_delay, Duration::from_secs(15));
    }

    #[test]
    fn validate_rejects_self_as_controller() {
        let config = Config {
            controller_address: Some("http://127.0.0.1:5000/".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SwarmError::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let config = Config {
            private_key: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
