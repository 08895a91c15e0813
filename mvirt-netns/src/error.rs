//! Error taxonomy shared by the store, the managers and both service adapters.
//!
//! Every error carries a kind (see [`ErrorKind`]) that survives the trip
//! through `tonic::Status` and back, so a Proxy caller observes the same
//! kind a Local caller would.

use thiserror::Error;
use tonic::{Code, Status};

use crate::plugin::PluginError;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unimplemented,
    DeadlineExceeded,
    Internal,
    Unknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Unknown(String),

    /// Check found drift between the record and the kernel state.
    #[error("attachment unhealthy: {0}")]
    Unhealthy(String),

    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("plugin runtime: {0}")]
    Plugin(#[from] PluginError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unimplemented(_) => ErrorKind::Unimplemented,
            Error::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Error::Internal(_) | Error::Storage(_) | Error::Encoding(_) => ErrorKind::Internal,
            Error::Unknown(_) | Error::Unhealthy(_) => ErrorKind::Unknown,
            Error::Plugin(PluginError::InvalidConfig(_)) => ErrorKind::InvalidArgument,
            Error::Plugin(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

macro_rules! redb_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Storage(e.into())
                }
            }
        )*
    };
}

redb_error_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {e}"))
    }
}

impl From<ErrorKind> for Code {
    fn from(kind: ErrorKind) -> Code {
        match kind {
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::Unimplemented => Code::Unimplemented,
            ErrorKind::DeadlineExceeded => Code::DeadlineExceeded,
            ErrorKind::Internal => Code::Internal,
            ErrorKind::Unknown => Code::Unknown,
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Status {
        Status::new(e.kind().into(), e.to_string())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Error {
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => Error::NotFound(msg),
            Code::AlreadyExists => Error::AlreadyExists(msg),
            Code::InvalidArgument => Error::InvalidArgument(msg),
            Code::Unimplemented => Error::Unimplemented(msg),
            Code::DeadlineExceeded | Code::Cancelled => Error::DeadlineExceeded(msg),
            Code::Internal => Error::Internal(msg),
            _ => Error::Unknown(msg),
        }
    }
}
