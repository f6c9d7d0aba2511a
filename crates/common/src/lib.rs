pub mod config;
pub mod error;
pub mod notification_log;
pub mod redis_pool;
pub mod types;
