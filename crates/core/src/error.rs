use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MartError>;

#[derive(Debug, Error)]
pub enum MartError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid connection string: {0}")]
    ConnectionString(String),

    #[error("Decision engine error: {0}")]
    Engine(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
