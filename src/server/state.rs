use std::sync::Arc;
use std::time::Instant;

use crate::broker::{Broker, Producer};
use crate::config::Settings;
use crate::consumer::ConsumerGroupManager;
use crate::notification::DeliveryDispatcher;
use crate::postgres::PostgresPool;
use crate::redis::RedisPool;
use crate::store::NotificationStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub broker: Arc<dyn Broker>,
    pub producer: Producer,
    pub store: Arc<dyn NotificationStore>,
    pub consumer: Arc<ConsumerGroupManager>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    pub start_time: Instant,
}
