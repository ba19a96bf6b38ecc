//! Shared error types. Per-service error enums live alongside their modules
//! (`admission::AdmissionError`, `secretsvc::SecretStoreError`, ...); this module
//! only holds the error surface of the persistence layer, since every service
//! touches it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("job not found")]
    NotFound,

    #[error("invalid data: {reason}")]
    Invalid { reason: String },
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
