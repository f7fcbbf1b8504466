//! Error types for the application

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Insufficient parameters for \"{0}\"")]
    MissingParams(&'static str),

    #[error("Invalid cloak: {0}")]
    InvalidFormat(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Nothing to change: {0}")]
    NoChange(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable category string carried in wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::MissingParams(_) => "missing_params",
            AppError::InvalidFormat(_) => "invalid_format",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::NoChange(_) => "no_change",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }

    /// Name of the operation a `MissingParams` failure refers to, if any.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            AppError::MissingParams(op) => Some(op),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
