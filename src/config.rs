//! # Configuration Module
//!
//! This module defines the runtime configuration of the bot: broker
//! connection parameters, reconnect policy, RPC queue names and timeouts,
//! logging and the Telegram token. Values come from `APP__<SECTION>__<FIELD>`
//! environment variables, optionally seeded from a `.env` file.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};

// Defaults
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_AMQP_PORT: u16 = 5672;
pub const DEFAULT_MANAGEMENT_PORT: u16 = 15672;
pub const DEFAULT_CREDENTIAL: &str = "guest";
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_VHOST: &str = "ad_engine";

/// Reconnect policy for the shared broker connection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of retry attempts after the first failed handshake
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_retry_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 500,  // 0.5 seconds
            max_retry_delay_ms: 10000, // 10 seconds
        }
    }
}

impl ReconnectConfig {
    /// Exponential backoff for the given retry attempt (1-based), before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.base_retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Broker connection parameters
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Port of the HTTP management API
    pub port_api: u16,
    pub username: String,
    pub password: String,
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_AMQP_PORT,
            port_api: DEFAULT_MANAGEMENT_PORT,
            username: DEFAULT_CREDENTIAL.to_string(),
            password: DEFAULT_CREDENTIAL.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for a virtual host
    pub fn amqp_uri(&self, vhost: &str) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: vhost.to_string(),
            ..Default::default()
        }
    }

    /// Base URL of the management API
    pub fn management_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port_api)
    }
}

/// Request/response queue pair for one remote route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePair {
    pub request_queue: String,
    pub response_queue: String,
}

impl RoutePair {
    fn new(request_queue: &str) -> Self {
        Self {
            request_queue: request_queue.to_string(),
            response_queue: format!("{request_queue}.reply"),
        }
    }
}

/// Queues of the ad engine's user routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQueues {
    pub exists: RoutePair,
    pub create: RoutePair,
}

impl Default for UserQueues {
    fn default() -> Self {
        Self {
            exists: RoutePair::new("user.are_exist"),
            create: RoutePair::new("user.create"),
        }
    }
}

/// RPC client settings
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a caller waits for a correlated reply
    pub reply_timeout: Duration,
    /// Virtual host the ad engine queues live in
    pub vhost: String,
    pub user_queues: UserQueues,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
            vhost: DEFAULT_VHOST.to_string(),
            user_queues: UserQueues::default(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// `EnvFilter` directive, e.g. `info` or `adbot=debug,lapin=warn`
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub token: String,
}

/// Complete application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub rpc: RpcConfig,
    pub logger: LoggerConfig,
    /// Absent when no Telegram token is configured
    pub bot: Option<BotConfig>,
}

impl AppConfig {
    /// Load configuration from the environment (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from a map of variables
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string_or = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let broker = BrokerConfig {
            host: string_or("APP__RABBIT_MQ__HOST", &defaults.broker.host),
            port: parse_or(&lookup, "APP__RABBIT_MQ__PORT", defaults.broker.port)?,
            port_api: parse_or(&lookup, "APP__RABBIT_MQ__PORT_API", defaults.broker.port_api)?,
            username: string_or("APP__RABBIT_MQ__USERNAME", &defaults.broker.username),
            password: string_or("APP__RABBIT_MQ__PASSWORD", &defaults.broker.password),
            reconnect: ReconnectConfig {
                max_retries: parse_or(
                    &lookup,
                    "APP__RABBIT_MQ__MAX_RETRIES",
                    defaults.broker.reconnect.max_retries,
                )?,
                base_retry_delay_ms: parse_or(
                    &lookup,
                    "APP__RABBIT_MQ__BASE_RETRY_DELAY_MS",
                    defaults.broker.reconnect.base_retry_delay_ms,
                )?,
                max_retry_delay_ms: parse_or(
                    &lookup,
                    "APP__RABBIT_MQ__MAX_RETRY_DELAY_MS",
                    defaults.broker.reconnect.max_retry_delay_ms,
                )?,
            },
        };

        let reply_timeout_secs = parse_or(
            &lookup,
            "APP__RPC__REPLY_TIMEOUT_SECS",
            DEFAULT_REPLY_TIMEOUT_SECS,
        )?;
        if reply_timeout_secs == 0 {
            bail!("APP__RPC__REPLY_TIMEOUT_SECS must be greater than zero");
        }

        let queues = &defaults.rpc.user_queues;
        let rpc = RpcConfig {
            reply_timeout: Duration::from_secs(reply_timeout_secs),
            vhost: string_or("APP__RPC__VHOST", &defaults.rpc.vhost),
            user_queues: UserQueues {
                exists: RoutePair {
                    request_queue: string_or(
                        "APP__RPC__USER_EXISTS_QUEUE",
                        &queues.exists.request_queue,
                    ),
                    response_queue: string_or(
                        "APP__RPC__USER_EXISTS_REPLY_QUEUE",
                        &queues.exists.response_queue,
                    ),
                },
                create: RoutePair {
                    request_queue: string_or(
                        "APP__RPC__USER_CREATE_QUEUE",
                        &queues.create.request_queue,
                    ),
                    response_queue: string_or(
                        "APP__RPC__USER_CREATE_REPLY_QUEUE",
                        &queues.create.response_queue,
                    ),
                },
            },
        };

        let logger = LoggerConfig {
            level: string_or("APP__LOGGER__LEVEL", &defaults.logger.level),
            json: parse_or(&lookup, "APP__LOGGER__JSON", defaults.logger.json)?,
        };

        let bot = lookup("APP__BOT__TOKEN")
            .filter(|token| !token.trim().is_empty())
            .map(|token| BotConfig { token });

        Ok(Self {
            broker,
            rpc,
            logger,
            bot,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = AppConfig::from_map(&HashMap::new()).unwrap();

        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.broker.port_api, 15672);
        assert_eq!(config.rpc.reply_timeout, Duration::from_secs(30));
        assert_eq!(config.rpc.user_queues.exists.request_queue, "user.are_exist");
        assert_eq!(
            config.rpc.user_queues.create.response_queue,
            "user.create.reply"
        );
        assert!(config.bot.is_none());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = AppConfig::from_map(&vars(&[
            ("APP__RABBIT_MQ__HOST", "rabbit"),
            ("APP__RABBIT_MQ__PORT", "5673"),
            ("APP__RPC__REPLY_TIMEOUT_SECS", "5"),
            ("APP__RPC__VHOST", "ads-vhost"),
            ("APP__LOGGER__JSON", "true"),
            ("APP__BOT__TOKEN", "123:abc"),
        ]))
        .unwrap();

        assert_eq!(config.broker.host, "rabbit");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.rpc.reply_timeout, Duration::from_secs(5));
        assert_eq!(config.rpc.vhost, "ads-vhost");
        assert!(config.logger.json);
        assert_eq!(config.bot.unwrap().token, "123:abc");
    }

    #[test]
    fn test_invalid_number_names_the_key() {
        let err = AppConfig::from_map(&vars(&[("APP__RABBIT_MQ__PORT", "amqp")])).unwrap_err();
        assert!(err.to_string().contains("APP__RABBIT_MQ__PORT"));
    }

    #[test]
    fn test_zero_reply_timeout_is_rejected() {
        assert!(AppConfig::from_map(&vars(&[("APP__RPC__REPLY_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let reconnect = ReconnectConfig {
            max_retries: 5,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 350,
        };
        assert_eq!(reconnect.backoff(1), Duration::from_millis(100));
        assert_eq!(reconnect.backoff(2), Duration::from_millis(200));
        assert_eq!(reconnect.backoff(3), Duration::from_millis(350));
        assert_eq!(reconnect.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_amqp_uri_keeps_vhost_verbatim() {
        let broker = BrokerConfig::default();
        let uri = broker.amqp_uri("ads/vhost");
        assert_eq!(uri.vhost, "ads/vhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(broker.management_url(), "http://localhost:15672/");
    }
}
