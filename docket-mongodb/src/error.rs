//! Error types for MongoDB operations.

use docket_query::{
    DUPLICATE_KEY_SERVER_CODE, ErrorCode, QueryError, TRANSIENT_TRANSACTION_ERROR,
    WRITE_CONFLICT_SERVER_CODE,
};
use mongodb::error::{BulkWriteFailure, ErrorKind, WriteFailure};
use thiserror::Error;

/// Result type for MongoDB operations.
pub type MongoResult<T> = Result<T, MongoError>;

/// Server code reported when a transaction no longer exists.
pub const NO_SUCH_TRANSACTION_SERVER_CODE: i32 = 251;

/// Server code reported when a collection or database does not exist.
pub const NAMESPACE_NOT_FOUND_SERVER_CODE: i32 = 26;

/// Errors that can occur during MongoDB operations.
#[derive(Error, Debug)]
pub enum MongoError {
    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// BSON serialization error.
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// BSON deserialization error.
    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    /// A command reply was missing a field or had the wrong shape.
    #[error("malformed reply to {command}: {message}")]
    Reply {
        /// Command whose reply was malformed.
        command: &'static str,
        /// What was wrong.
        message: String,
    },

    /// A write reported an error.
    #[error("write error {code}: {message}")]
    Write {
        /// Server error code.
        code: i32,
        /// Server message.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),
}

impl MongoError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a malformed-reply error.
    pub fn reply(command: &'static str, message: impl Into<String>) -> Self {
        Self::Reply {
            command,
            message: message.into(),
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// The numeric server error code, if the server reported one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Driver(err) => driver_code(err),
            Self::Write { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn driver_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => Some(concern.code),
        ErrorKind::BulkWrite(failure) => first_bulk_error(failure).map(|(code, _)| code),
        _ => None,
    }
}

/// The code and message of the earliest failed write in a bulk failure,
/// or of its write concern error when no single write failed.
pub(crate) fn first_bulk_error(failure: &BulkWriteFailure) -> Option<(i32, String)> {
    failure
        .write_errors
        .as_ref()
        .and_then(|errors| errors.iter().min_by_key(|e| e.index))
        .map(|e| (e.code, e.message.clone()))
        .or_else(|| {
            failure
                .write_concern_error
                .as_ref()
                .map(|e| (e.code, e.message.clone()))
        })
}

/// Map a server error code and message onto a [`QueryError`].
pub(crate) fn from_server(code: i32, message: String) -> QueryError {
    match code {
        DUPLICATE_KEY_SERVER_CODE => QueryError::duplicate_key(message),
        WRITE_CONFLICT_SERVER_CODE => QueryError::new(ErrorCode::WriteConflict, message)
            .with_server_code(code)
            .with_label(TRANSIENT_TRANSACTION_ERROR),
        NO_SUCH_TRANSACTION_SERVER_CODE => {
            QueryError::transaction_aborted(message).with_server_code(code)
        }
        _ => QueryError::command(code, message),
    }
}

fn from_driver(err: mongodb::error::Error) -> QueryError {
    let base = match err.kind.as_ref() {
        ErrorKind::Command(command) => from_server(command.code, command.message.clone()),
        ErrorKind::Write(WriteFailure::WriteError(write)) => {
            from_server(write.code, write.message.clone())
        }
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => {
            from_server(concern.code, concern.message.clone())
        }
        ErrorKind::BulkWrite(failure) => match first_bulk_error(failure) {
            Some((code, message)) => from_server(code, message),
            None => QueryError::new(ErrorCode::CommandFailed, err.to_string()),
        },
        ErrorKind::ServerSelection { message, .. } => {
            QueryError::new(ErrorCode::ServerSelection, message.clone())
        }
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            QueryError::connection(err.to_string())
        }
        ErrorKind::Transaction { message, .. } => QueryError::transaction_state(message.clone()),
        ErrorKind::InvalidArgument { message, .. } => QueryError::usage(message.clone()),
        _ => QueryError::new(ErrorCode::CommandFailed, err.to_string()),
    };
    let labels: Vec<String> = err.labels().iter().cloned().collect();
    labels
        .into_iter()
        .fold(base, |acc, label| acc.with_label(label))
        .with_source(err)
}

/// Map a driver error straight onto a [`QueryError`].
pub(crate) fn driver_error(err: mongodb::error::Error) -> QueryError {
    from_driver(err)
}

impl From<MongoError> for QueryError {
    fn from(err: MongoError) -> Self {
        match err {
            MongoError::Driver(e) => from_driver(e),
            MongoError::Bson(e) => QueryError::from(e),
            MongoError::BsonDe(e) => QueryError::from(e),
            MongoError::Reply { .. } => QueryError::decode(err.to_string()),
            MongoError::Write { code, message } => from_server(code, message),
            MongoError::Config(msg) => QueryError::config(msg),
            MongoError::Connection(msg) => QueryError::connection(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MongoError::config("test error");
        assert_eq!(err.to_string(), "configuration error: test error");

        let err = MongoError::reply("find", "missing cursor");
        assert_eq!(err.to_string(), "malformed reply to find: missing cursor");
    }

    #[test]
    fn test_write_errors_map_by_code() {
        let err: QueryError = MongoError::Write {
            code: DUPLICATE_KEY_SERVER_CODE,
            message: "E11000 duplicate key error".into(),
        }
        .into();
        assert!(err.is_duplicate_key());

        let err: QueryError = MongoError::Write {
            code: WRITE_CONFLICT_SERVER_CODE,
            message: "WriteConflict".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::WriteConflict);
        assert!(err.is_transient_transaction());

        let err: QueryError = MongoError::Write {
            code: 121,
            message: "Document failed validation".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::CommandFailed);
        assert_eq!(err.server_code, Some(121));
    }

    #[test]
    fn test_bulk_failure_reports_earliest_write() {
        let failure: BulkWriteFailure = bson::from_document(bson::doc! {
            "writeErrors": [
                { "index": 3, "code": 121, "errmsg": "Document failed validation" },
                { "index": 1, "code": DUPLICATE_KEY_SERVER_CODE, "errmsg": "E11000 duplicate key error" },
            ],
        })
        .unwrap();
        assert_eq!(
            first_bulk_error(&failure),
            Some((DUPLICATE_KEY_SERVER_CODE, "E11000 duplicate key error".to_string()))
        );

        let failure: BulkWriteFailure = bson::from_document(bson::doc! {
            "writeConcernError": { "code": 64, "errmsg": "waiting for replication timed out" },
        })
        .unwrap();
        assert_eq!(first_bulk_error(&failure).map(|(code, _)| code), Some(64));
    }

    #[test]
    fn test_config_and_reply_mapping() {
        let err: QueryError = MongoError::config("bad uri").into();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);

        let err: QueryError = MongoError::reply("getMore", "no nextBatch").into();
        assert!(err.is_decode());

        let err = MongoError::connection("refused");
        assert!(err.is_connection_error());
        assert_eq!(err.server_code(), None);
    }
}
