//! Job error taxonomy
//!
//! Every collaborator used by the orchestrator reports failures through
//! [`JobError`]. The orchestrator only distinguishes three groups: version
//! conflicts, destination connection failures and everything else.

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Message recorded on a failed job when the cause is not a destination
/// connection failure.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Status code recorded with [`UNKNOWN_ERROR_MESSAGE`].
pub const UNKNOWN_ERROR_STATUS: u16 = 500;

/// Status code recorded when the destination store cannot be reached.
pub const DESTINATION_UNAVAILABLE_STATUS: u16 = 503;

#[derive(Debug, Error)]
pub enum JobError {
    /// The job record changed since the caller's version token was issued.
    #[error("job {job_id} was updated by another process")]
    Conflict { job_id: Uuid },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    /// The destination store could not be reached or refused the connection.
    #[error("destination connection failed ({status_code}): {message}")]
    DestinationConnection { message: String, status_code: u16 },

    #[error("no anonymization configuration registered for collection '{collection_id}'")]
    ConfigurationNotFound { collection_id: String },

    #[error("invalid anonymization configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid search parameter '{name}': {reason}")]
    InvalidSearchParameter { name: String, reason: String },

    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    #[error("resource {resource_type}/{resource_id} does not exist and creation is not allowed")]
    ResourceNotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("resource {resource_type}/{resource_id} version does not match")]
    ResourceVersionConflict {
        resource_type: String,
        resource_id: String,
    },

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("stored job {job_id} is unreadable: {reason}")]
    CorruptRecord { job_id: Uuid, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    pub fn destination<S: Into<String>>(message: S, status_code: u16) -> Self {
        Self::DestinationConnection {
            message: message.into(),
            status_code,
        }
    }

    /// Classifies an error raised by the destination store. Connection-level
    /// failures become [`JobError::DestinationConnection`].
    pub fn from_destination(err: DbErr) -> Self {
        match err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
                Self::destination(err.to_string(), DESTINATION_UNAVAILABLE_STATUS)
            }
            other => Self::Database(other),
        }
    }
}
