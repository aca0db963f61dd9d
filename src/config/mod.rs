mod settings;

pub use settings::{
    BrokerConfig, ConsumerConfig, DatabaseConfig, DeliveryConfig, HeartbeatConfig, LoggingConfig,
    OtelConfig, RedisConfig, RetentionConfig, ServerConfig, Settings, StoreConfig, TopicsConfig,
};
