// ABOUTME: Error taxonomy for replication and offline queue operations
// ABOUTME: Classifies driver errors from both stores as transient or permanent

use std::time::Duration;

use sync_queue::StoreSide;
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::codec::CodecError;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity problem; the operation may succeed if retried later.
    #[error("store {store} unreachable: {message}")]
    TransientNetwork { store: StoreSide, message: String },

    #[error("store {store} call timed out after {timeout:?}")]
    Timeout { store: StoreSide, timeout: Duration },

    /// Authentication or authorization rejected by the store.
    #[error("store {store} denied access: {message}")]
    PermanentAuth { store: StoreSide, message: String },

    /// The store rejected the write itself (constraint, type or syntax error).
    #[error("store {store} rejected the write: {message}")]
    Rejected { store: StoreSide, message: String },

    #[error("failed to decrypt queued payload: {0}")]
    Decryption(#[source] CodecError),

    #[error("failed to encrypt payload: {0}")]
    Encryption(#[source] CodecError),

    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("offline queue error: {0:#}")]
    Queue(anyhow::Error),
}

impl SyncError {
    /// Whether the failed operation is worth attempting again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork { .. } | SyncError::Timeout { .. }
        )
    }

    pub fn store(&self) -> Option<StoreSide> {
        match self {
            SyncError::TransientNetwork { store, .. }
            | SyncError::Timeout { store, .. }
            | SyncError::PermanentAuth { store, .. }
            | SyncError::Rejected { store, .. } => Some(*store),
            _ => None,
        }
    }

    pub fn transient(store: StoreSide, message: impl Into<String>) -> Self {
        SyncError::TransientNetwork {
            store,
            message: message.into(),
        }
    }

    /// Classify a PostgreSQL driver error.
    ///
    /// Closed connections and SQLSTATE classes 08 (connection exception),
    /// 53 (insufficient resources) and 57 (operator intervention) are
    /// transient. Class 28 and `insufficient_privilege` are auth failures.
    /// Errors without a SQLSTATE come from the socket and are transient.
    pub fn from_postgres(store: StoreSide, err: &tokio_postgres::Error) -> Self {
        let message = postgres_message(err);
        if err.is_closed() {
            return SyncError::TransientNetwork { store, message };
        }

        match err.code() {
            Some(code) => {
                let class = &code.code()[..2];
                if class == "28" || *code == SqlState::INSUFFICIENT_PRIVILEGE {
                    SyncError::PermanentAuth { store, message }
                } else if matches!(class, "08" | "53" | "57") {
                    SyncError::TransientNetwork { store, message }
                } else {
                    SyncError::Rejected { store, message }
                }
            }
            None => SyncError::TransientNetwork { store, message },
        }
    }

    /// Classify a MongoDB driver error.
    ///
    /// Authentication failures and the `Unauthorized` (13) and
    /// `AuthenticationFailed` (18) command codes are permanent, as are
    /// write and argument errors. Everything else is treated as transient.
    pub fn from_mongo(store: StoreSide, err: &mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        let message = err.to_string();
        match err.kind.as_ref() {
            ErrorKind::Authentication { .. } => SyncError::PermanentAuth { store, message },
            ErrorKind::Command(command) if matches!(command.code, 13 | 18) => {
                SyncError::PermanentAuth { store, message }
            }
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. } => SyncError::TransientNetwork { store, message },
            _ if err.contains_label(mongodb::error::RETRYABLE_WRITE_ERROR) => {
                SyncError::TransientNetwork { store, message }
            }
            ErrorKind::Write(_)
            | ErrorKind::InvalidArgument { .. }
            | ErrorKind::BsonSerialization(_) => SyncError::Rejected { store, message },
            _ => SyncError::TransientNetwork { store, message },
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Queue(err)
    }
}

fn postgres_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => err.to_string(),
    }
}
