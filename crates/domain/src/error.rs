use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),

    #[error("invalid schema name '{0}'")]
    InvalidSchemaName(String),

    #[error("envelope missing required field '{0}'")]
    MissingField(&'static str),

    #[error("envelope field '{field}' has wrong type: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid command state transition from {from} to {to}")]
    InvalidCommandTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
