//! Persistence: health store seam, local SQLite store, gateway, config.

pub mod config;
pub mod database;
pub mod gateway;
pub mod health_store;
pub mod schema;

pub use config::{ConfigError, EngineConfig, SummaryConfig};
pub use database::SqliteHealthStore;
pub use gateway::{spawn_retry_loop, PersistError, PersistenceGateway, RetryPolicy};
pub use health_store::{HealthStore, MemoryHealthStore, StoreError, StoredId};
