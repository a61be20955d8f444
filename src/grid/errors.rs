//! Grid-specific error types

use thiserror::Error;

/// Marker the exchange puts in a rejection when the account cannot fund an order
const INSUFFICIENT_BALANCE_MARKER: &str = "insufficient balance";

/// Errors that can occur in grid trading operations
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid level not found: level {0}")]
    LevelNotFound(u32),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    OrderPlacementFailed { attempts: u32, reason: String },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GridError {
    /// Whether the broker refused the order only because funds were short
    pub fn is_insufficient_balance(&self) -> bool {
        match self {
            GridError::InsufficientBalance { .. } => true,
            GridError::Exchange(msg) | GridError::OrderRejected(msg) => msg
                .to_lowercase()
                .contains(INSUFFICIENT_BALANCE_MARKER),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::Config(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
