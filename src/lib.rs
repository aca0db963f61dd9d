// Infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
pub mod resilience;
pub mod telemetry;

// Pipeline
pub mod broker;
pub mod consumer;
pub mod deadletter;
pub mod envelope;
pub mod notification;
pub mod router;
pub mod store;
pub mod tasks;

// Application
pub mod api;
pub mod runtime;
pub mod server;
pub mod shutdown;
