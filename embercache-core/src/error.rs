use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmberError>;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Internal error: {0}")]
    Internal(String),
}
