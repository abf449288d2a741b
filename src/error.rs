//! Error types for the Gatekeeper crate.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy service errors
    #[error("Policy fetch error: {0}")]
    PolicyFetch(#[from] crate::entitlement::FetchError),

    /// A policy document failed validation
    #[error("Invalid policy document: {0}")]
    PolicyInvalid(String),

    /// Persisted policy cache errors
    #[error("Policy persistence error: {0}")]
    Persist(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
