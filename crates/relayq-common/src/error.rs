//! Error types for RelayQ

use thiserror::Error;
use uuid::Uuid;

/// Main error type for RelayQ
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("Invalid status transition for message {id}: {current} -> {requested}")]
    InvalidStatusTransition {
        id: Uuid,
        current: String,
        requested: String,
    },

    #[error("Retry budget exhausted for message {id} after {retry_count} attempts")]
    RetryExhausted { id: Uuid, retry_count: i32 },

    #[error("Message {0} is not in the dead-letter set")]
    NotDeadLetter(Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RelayQ
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Storage(_) => 500,
            Error::Validation(_) => 422,
            Error::MessageNotFound(_) => 404,
            Error::BatchNotFound(_) => 404,
            Error::InvalidStatusTransition { .. } => 409,
            Error::RetryExhausted { .. } => 409,
            Error::NotDeadLetter(_) => 409,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            Error::BatchNotFound(_) => "BATCH_NOT_FOUND",
            Error::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::NotDeadLetter(_) => "NOT_DEAD_LETTER",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Field-level validation failures, rejected before any write.
///
/// Each variant maps to a stable snake_case code surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Recipient token does not match the tenant token grammar")]
    InvalidRecipientToken,

    #[error("Unknown channel: {0}")]
    InvalidChannel(String),

    #[error("Message body must not be empty")]
    BodyRequired,

    #[error("Subject is required for email messages")]
    SubjectRequired,

    #[error("SMS body of {len} characters exceeds the {max} character limit")]
    SmsBodyTooLong { len: usize, max: usize },

    #[error("Batch of {count} recipients exceeds the {max} recipient limit")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Batch must contain at least one recipient")]
    BatchEmpty,
}

impl ValidationError {
    /// Returns the field error code string
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidRecipientToken => "invalid_recipient_token",
            ValidationError::InvalidChannel(_) => "invalid_channel",
            ValidationError::BodyRequired => "body_required",
            ValidationError::SubjectRequired => "subject_required",
            ValidationError::SmsBodyTooLong { .. } => "sms_body_too_long",
            ValidationError::BatchTooLarge { .. } => "batch_too_large",
            ValidationError::BatchEmpty => "batch_empty",
        }
    }
}
