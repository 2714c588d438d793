//! Tunables for clients, consumers, the producer and the supervisor.

use std::time::Duration;

use serde::Deserialize;
use switchyard_broker::AckMode;

/// RPC layer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub producer: ProducerConfig,
    pub supervisor: SupervisorConfig,
}

/// Outbound call settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for calls whose declaration names no `TimeoutDuration`.
    #[serde(with = "serde_duration_secs")]
    pub default_timeout: Duration,
    /// Share connections between calls to the same endpoint.
    pub pool_connections: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            pool_connections: true,
        }
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ack_mode: AckMode,
    /// Answer unhandled or failed requests with an error reply instead of
    /// leaving the caller to time out.
    pub error_replies: bool,
    /// Declare the declaration's exchange and bind the input queue to it.
    pub bind_exchanges: bool,
    /// Unacknowledged deliveries per consumer. Only used with manual acks.
    pub prefetch: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::AfterProcessing,
            error_replies: true,
            bind_exchanges: true,
            prefetch: 1,
        }
    }
}

/// Fire-and-forget publishing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub max_attempts: u32,
    #[serde(with = "serde_duration_secs")]
    pub retry_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Restart policy for consumer loops.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(with = "serde_duration_secs")]
    pub restart_delay: Duration,
    /// Restarts allowed per loop before it is abandoned.
    pub max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            max_restarts: 5,
        }
    }
}

/// Serde helper for Duration as (fractional) seconds.
mod serde_duration_secs {
    use serde::{de, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RpcConfig::default();
        assert_eq!(config.client.default_timeout, Duration::from_secs(5));
        assert!(config.client.pool_connections);
        assert_eq!(config.server.ack_mode, AckMode::AfterProcessing);
        assert!(config.server.error_replies);
        assert_eq!(config.server.prefetch, 1);
        assert_eq!(config.producer.max_attempts, 3);
        assert_eq!(config.producer.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: RpcConfig = serde_json::from_str(
            r#"{"client": {"default_timeout": 0.5}, "server": {"ack_mode": "on_delivery"}}"#,
        )
        .unwrap();
        assert_eq!(config.client.default_timeout, Duration::from_millis(500));
        assert!(config.client.pool_connections);
        assert_eq!(config.server.ack_mode, AckMode::OnDelivery);
        assert!(config.server.bind_exchanges);
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result = serde_json::from_str::<ProducerConfig>(r#"{"retry_interval": -1}"#);
        assert!(result.is_err());
    }
}
