//! Error types for codex-lb

use thiserror::Error;

/// Main error type for codex-lb
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Token encryption/decryption errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for codex-lb operations
pub type Result<T> = std::result::Result<T, Error>;
