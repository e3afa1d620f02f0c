//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Missing or invalid transport settings. Raised at construction so a
    /// service never runs half-configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration file error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    pub(crate) fn configuration(component: &str, message: impl std::fmt::Display) -> Self {
        CacheError::Configuration(format!("{}: {}", component, message))
    }
}
