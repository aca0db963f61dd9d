use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

/// Broker selection and stream layout.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// `memory` or `redis`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    /// Key prefix for Redis streams and committed offsets
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// Partitions per topic; a recipient always hashes to the same one
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Approximate MAXLEN applied when appending to a stream
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Topic names for every logical channel.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_user_topic")]
    pub user_notifications: String,
    #[serde(default = "default_kid_topic")]
    pub kid_notifications: String,
    #[serde(default = "default_parent_topic")]
    pub parent_notifications: String,
    #[serde(default = "default_repost_topic")]
    pub repost_notifications: String,
    #[serde(default = "default_safety_topic")]
    pub safety_alerts: String,
    #[serde(default = "default_educational_topic")]
    pub educational: String,
    #[serde(default = "default_generated_topic")]
    pub generated_responses: String,
    #[serde(default = "default_health_topic")]
    pub system_health: String,
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Worker members sharing the partitions of every subscribed channel
    #[serde(default = "default_members")]
    pub members: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pending depth above which members stop pulling
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Pause applied to a halted partition before it retries the same record
    #[serde(default = "default_halt_backoff_ms")]
    pub halt_backoff_ms: u64,
    #[serde(default = "default_revoke_timeout_ms")]
    pub revoke_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// `redis` (pub/sub push) or `log`
    #[serde(default = "default_delivery_channel")]
    pub channel: String,
    #[serde(default = "default_push_prefix")]
    pub push_prefix: String,
    #[serde(default = "default_delivery_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delivery_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_delivery_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_delivery_workers")]
    pub workers: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_redelivery_interval")]
    pub redelivery_interval_seconds: u64,
    /// Undelivered records younger than this are left to the live dispatch path
    #[serde(default = "default_redelivery_min_age")]
    pub redelivery_min_age_seconds: u64,
    #[serde(default = "default_redelivery_batch_size")]
    pub redelivery_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention_interval")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_database_url() -> String {
    "postgres://localhost:5432/notifications".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    600 // 10 minutes
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_stream_prefix() -> String {
    "ara:pipeline".to_string()
}

fn default_partitions() -> u32 {
    12
}

fn default_stream_max_len() -> usize {
    1_000_000
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

fn default_user_topic() -> String {
    "user.notifications".to_string()
}

fn default_kid_topic() -> String {
    "kid.notifications".to_string()
}

fn default_parent_topic() -> String {
    "parent.notifications".to_string()
}

fn default_repost_topic() -> String {
    "repost.notifications".to_string()
}

fn default_safety_topic() -> String {
    "safety.alerts".to_string()
}

fn default_educational_topic() -> String {
    "educational.notifications".to_string()
}

fn default_generated_topic() -> String {
    "generated.responses".to_string()
}

fn default_health_topic() -> String {
    "system.health".to_string()
}

fn default_dead_letter_topic() -> String {
    "notifications.dead-letter".to_string()
}

fn default_group_id() -> String {
    "notification-pipeline".to_string()
}

fn default_members() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_pending() -> usize {
    1_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_halt_backoff_ms() -> u64 {
    5_000
}

fn default_revoke_timeout_ms() -> u64 {
    30_000
}

fn default_delivery_channel() -> String {
    "log".to_string()
}

fn default_push_prefix() -> String {
    "notification:user".to_string()
}

fn default_delivery_max_attempts() -> u32 {
    3
}

fn default_delivery_initial_backoff_ms() -> u64 {
    500
}

fn default_delivery_max_backoff_ms() -> u64 {
    60_000
}

fn default_delivery_workers() -> usize {
    32
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_redelivery_interval() -> u64 {
    60
}

fn default_redelivery_min_age() -> u64 {
    30
}

fn default_redelivery_batch_size() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_retention_interval() -> u64 {
    300 // 5 minutes
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-notification-pipeline".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("broker.backend", "memory")?
            .set_default("store.backend", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA__CONSUMER__BATCH_SIZE, ARA__STORE__BACKEND, etc.
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            )
            // Conventional connection variables win over everything else
            .set_override_option("redis.url", env::var("REDIS_URL").ok())?
            .set_override_option("database.url", env::var("DATABASE_URL").ok())?;

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations that would make the pipeline unsafe to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.partitions == 0 {
            return Err(ConfigError::Message("broker.partitions must be at least 1".into()));
        }
        if self.consumer.members == 0 {
            return Err(ConfigError::Message("consumer.members must be at least 1".into()));
        }
        if self.consumer.batch_size == 0 {
            return Err(ConfigError::Message("consumer.batch_size must be at least 1".into()));
        }
        if self.consumer.retry_attempts == 0 || self.delivery.max_attempts == 0 {
            return Err(ConfigError::Message("retry budgets must allow at least one attempt".into()));
        }
        if self.delivery.workers == 0 {
            return Err(ConfigError::Message("delivery.workers must be at least 1".into()));
        }
        if !matches!(self.broker.backend.as_str(), "memory" | "redis") {
            return Err(ConfigError::Message(format!(
                "unknown broker backend '{}'",
                self.broker.backend
            )));
        }
        if !matches!(self.store.backend.as_str(), "memory" | "postgres") {
            return Err(ConfigError::Message(format!(
                "unknown store backend '{}'",
                self.store.backend
            )));
        }
        if !matches!(self.delivery.channel.as_str(), "redis" | "log") {
            return Err(ConfigError::Message(format!(
                "unknown delivery channel '{}'",
                self.delivery.channel
            )));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            stream_prefix: default_stream_prefix(),
            partitions: default_partitions(),
            stream_max_len: default_stream_max_len(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            user_notifications: default_user_topic(),
            kid_notifications: default_kid_topic(),
            parent_notifications: default_parent_topic(),
            repost_notifications: default_repost_topic(),
            safety_alerts: default_safety_topic(),
            educational: default_educational_topic(),
            generated_responses: default_generated_topic(),
            system_health: default_health_topic(),
            dead_letter: default_dead_letter_topic(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            members: default_members(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_pending: default_max_pending(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            halt_backoff_ms: default_halt_backoff_ms(),
            revoke_timeout_ms: default_revoke_timeout_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            channel: default_delivery_channel(),
            push_prefix: default_push_prefix(),
            max_attempts: default_delivery_max_attempts(),
            initial_backoff_ms: default_delivery_initial_backoff_ms(),
            max_backoff_ms: default_delivery_max_backoff_ms(),
            workers: default_delivery_workers(),
            send_timeout_ms: default_send_timeout_ms(),
            redelivery_interval_seconds: default_redelivery_interval(),
            redelivery_min_age_seconds: default_redelivery_min_age(),
            redelivery_batch_size: default_redelivery_batch_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_retention_interval(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_heartbeat_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8082);
        assert_eq!(settings.consumer.retry_attempts, 3);
        assert_eq!(settings.delivery.max_attempts, 3);
        assert_eq!(settings.retention.interval_seconds, 300);
        assert_eq!(settings.broker.partitions, 12);
        assert_eq!(settings.topics.safety_alerts, "safety.alerts");
    }

    #[test]
    fn test_default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_partitions() {
        let mut settings = Settings::default();
        settings.broker.partitions = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut settings = Settings::default();
        settings.store.backend = "mongodb".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("mongodb"));
    }
}
