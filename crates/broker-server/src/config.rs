use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::{
    AuthOptions, BrokerOptions, DeliveryMode, ListenerOptions, OverflowStrategy, QueueOptions,
    RateLimitOptions, TimingOptions,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub queue_defaults: QueueDefaultsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default = "default_dlq_capacity")]
    pub dlq_capacity: usize,
    #[serde(default = "default_clock_tick", deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub clock_tick: DurationSeconds,
}

/// A thin newtype so `deserialize_duration`'s `T: From<Duration> + Default`
/// bound has somewhere to land without every caller reaching for `Duration`
/// directly in config structs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationSeconds(pub Duration);

impl From<Duration> for DurationSeconds {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { enabled: false, token: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueDefaultsConfig {
    pub delivery_mode: String,
    pub max_size: usize,
    pub auto_create: bool,
    pub dlq_enabled: bool,
    pub max_retry_attempts: u32,
    pub overflow_strategy: String,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_optional_duration")]
    pub message_ttl: Option<Duration>,
}

impl Default for QueueDefaultsConfig {
    fn default() -> Self {
        Self {
            delivery_mode: "round_robin".to_string(),
            max_size: 10_000,
            auto_create: true,
            dlq_enabled: true,
            max_retry_attempts: 3,
            overflow_strategy: "drop_oldest".to_string(),
            message_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_connections_per_ip_per_window: u32,
    pub connection_window_secs: u64,
    pub max_messages_per_client_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections_per_ip_per_window: 20,
            connection_window_secs: 10,
            max_messages_per_client_per_second: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimingConfig {
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub keep_alive_interval: DurationSeconds,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub handshake_timeout: DurationSeconds,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub ack_timeout: DurationSeconds,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub shutdown_grace: DurationSeconds,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub initial_backoff: DurationSeconds,
    #[serde(deserialize_with = "broker_helpers::de::deserialize_duration")]
    pub max_backoff: DurationSeconds,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DurationSeconds(Duration::from_secs(30)),
            handshake_timeout: DurationSeconds(Duration::from_secs(5)),
            ack_timeout: DurationSeconds(Duration::from_secs(30)),
            shutdown_grace: DurationSeconds(Duration::from_secs(30)),
            initial_backoff: DurationSeconds(Duration::from_secs(1)),
            max_backoff: DurationSeconds(Duration::from_secs(5 * 60)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            tls_enabled: false,
            auth: AuthConfig::default(),
            queue_defaults: QueueDefaultsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timing: TimingConfig::default(),
            dlq_capacity: default_dlq_capacity(),
            clock_tick: default_clock_tick(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path)
            .context("server config path not found (BROKER_CONFIG_PATH or broker.yaml/broker.yml)")?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen = trim_owned(self.listen.clone());
        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        self.max_connections = self.max_connections.max(1);
        self.max_message_size = self.max_message_size.max(1024);
        self.queue_defaults.max_size = self.queue_defaults.max_size.max(1);
        self.rate_limit.connection_window_secs = self.rate_limit.connection_window_secs.max(1);
        self.dlq_capacity = self.dlq_capacity.max(1);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.auth.enabled && self.auth.token.as_deref().unwrap_or("").trim().is_empty() {
            bail!("server config has `auth.enabled: true` but no `auth.token`");
        }
        parse_delivery_mode(&self.queue_defaults.delivery_mode)?;
        parse_overflow_strategy(&self.queue_defaults.overflow_strategy)?;
        Ok(())
    }

    /// Converts the loaded, validated YAML config into the construction-time
    /// options the broker core accepts. This is the seam between
    /// filesystem/env configuration and the pure in-memory broker.
    pub fn to_broker_options(&self) -> Result<BrokerOptions> {
        Ok(BrokerOptions {
            listener: ListenerOptions {
                port: self.listen.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(8080),
                max_connections: self.max_connections,
                max_message_size: self.max_message_size,
                tls_enabled: self.tls_enabled,
            },
            auth: AuthOptions { enabled: self.auth.enabled, token: self.auth.token.clone() },
            queue_defaults: QueueOptions {
                delivery_mode: parse_delivery_mode(&self.queue_defaults.delivery_mode)?,
                max_size: self.queue_defaults.max_size,
                auto_create: self.queue_defaults.auto_create,
                message_ttl: self.queue_defaults.message_ttl,
                dlq_enabled: self.queue_defaults.dlq_enabled,
                max_retry_attempts: self.queue_defaults.max_retry_attempts,
                overflow_strategy: parse_overflow_strategy(&self.queue_defaults.overflow_strategy)?,
            },
            rate_limit: RateLimitOptions {
                enabled: self.rate_limit.enabled,
                max_connections_per_ip_per_window: self.rate_limit.max_connections_per_ip_per_window,
                connection_window_secs: self.rate_limit.connection_window_secs,
                max_messages_per_client_per_second: self.rate_limit.max_messages_per_client_per_second,
            },
            timing: TimingOptions {
                keep_alive_interval: self.timing.keep_alive_interval.0,
                handshake_timeout: self.timing.handshake_timeout.0,
                ack_timeout: self.timing.ack_timeout.0,
                shutdown_grace: self.timing.shutdown_grace.0,
                initial_backoff: self.timing.initial_backoff.0,
                max_backoff: self.timing.max_backoff.0,
            },
            dlq_capacity: self.dlq_capacity,
        })
    }

    pub fn clock_tick(&self) -> Duration {
        self.clock_tick.0
    }
}

fn parse_delivery_mode(value: &str) -> Result<DeliveryMode> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "round_robin" => DeliveryMode::RoundRobin,
        "fan_out_ack" => DeliveryMode::FanOutAck,
        "fan_out_no_ack" => DeliveryMode::FanOutNoAck,
        "priority_based" => DeliveryMode::PriorityBased,
        other => bail!("unknown queue_defaults.delivery_mode: {other}"),
    })
}

fn parse_overflow_strategy(value: &str) -> Result<OverflowStrategy> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "drop_oldest" => OverflowStrategy::DropOldest,
        "drop_newest" => OverflowStrategy::DropNewest,
        "block_publisher" => OverflowStrategy::BlockPublisher,
        "redirect_to_dlq" => OverflowStrategy::RedirectToDlq,
        other => bail!("unknown queue_defaults.overflow_strategy: {other}"),
    })
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: broker-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: broker-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw =
        std::fs::read(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_slice(&raw).with_context(|| format!("failed to parse YAML config {}", path.display()))
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("BROKER_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let home_yaml = PathBuf::from(&home).join("broker.yaml");
        if home_yaml.exists() {
            return Some(home_yaml);
        }
        let home_yml = PathBuf::from(home).join("broker.yml");
        if home_yml.exists() {
            return Some(home_yml);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("broker.yaml");
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }
    let cwd_yml = cwd.join("broker.yml");
    if cwd_yml.exists() {
        return Some(cwd_yml);
    }

    None
}

fn default_listen() -> String {
    "0.0.0.0:7420".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> u32 {
    broker_proto::DEFAULT_MAX_FRAME_LEN
}

fn default_dlq_capacity() -> usize {
    10_000
}

fn default_clock_tick() -> DurationSeconds {
    DurationSeconds(Duration::from_secs(1))
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_convert_to_broker_options() {
        let config = Config::default();
        let options = config.to_broker_options().unwrap();
        assert_eq!(options.listener.port, 7420);
        assert_eq!(options.queue_defaults.delivery_mode, DeliveryMode::RoundRobin);
    }

    #[test]
    fn auth_enabled_without_token_fails_validation() {
        let config = Config { auth: AuthConfig { enabled: true, token: None }, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_delivery_mode_fails_validation() {
        let mut queue_defaults = QueueDefaultsConfig::default();
        queue_defaults.delivery_mode = "not_a_mode".to_string();
        let config = Config { queue_defaults, ..Config::default() };
        assert!(config.validate().is_err());
    }
}
