use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Missing or inconsistent settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Coordination store unreachable or misbehaving. Retried with backoff.
    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Coordination transport error: {0}")]
    CoordinationTransport(#[from] reqwest::Error),

    /// Queue engine unavailable (channel closed, engine stopped).
    #[error("Queue error: {0}")]
    Queue(String),

    /// Round bookkeeping storage failure.
    #[error("Round store error: {0}")]
    Storage(String),

    /// The external business layer signalled an explicit failure.
    #[error("Business layer failure: {0}")]
    Business(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redb::Error> for ControllerError {
    fn from(e: redb::Error) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for ControllerError {
    fn from(e: redb::DatabaseError) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for ControllerError {
    fn from(e: redb::TransactionError) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for ControllerError {
    fn from(e: redb::TableError) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for ControllerError {
    fn from(e: redb::StorageError) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for ControllerError {
    fn from(e: redb::CommitError) -> Self {
        ControllerError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
