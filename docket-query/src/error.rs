//! Error types for document-store operations.
//!
//! Every fallible operation in docket returns [`QueryResult`]. Errors carry:
//! - an [`ErrorCode`] for programmatic handling
//! - the message reported by docket or by the server
//! - the server error code and error labels, when the server sent any
//! - context about the operation and namespace that failed
//!
//! # Error Codes
//!
//! Codes follow the pattern D{category}{number}:
//! - 1xxx: Request errors (no documents, invalid filter or update)
//! - 2xxx: Write errors (duplicate key, bulk write failures)
//! - 3xxx: Connection errors
//! - 4xxx: Session and transaction errors
//! - 5xxx: Execution errors (cancellation, deadlines, command failures)
//! - 6xxx: Data errors (encoding, decoding)
//! - 7xxx: Usage and configuration errors
//! - 9xxx: Internal errors
//!
//! ```rust
//! use docket_query::{ErrorCode, QueryError};
//!
//! let err = QueryError::no_documents();
//! assert_eq!(err.code, ErrorCode::NoDocuments);
//! assert!(err.is_no_documents());
//!
//! let err = QueryError::write_conflict("document changed underneath the transaction");
//! assert!(err.is_transient_transaction());
//! ```

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for document-store operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Label attached to errors after which a whole transaction may be retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label attached to commit errors whose outcome is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Server code for duplicate key violations.
pub const DUPLICATE_KEY_SERVER_CODE: i32 = 11000;

/// Server code for write conflicts inside transactions.
pub const WRITE_CONFLICT_SERVER_CODE: i32 = 112;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Request errors (1xxx)
    /// A single-result request matched nothing (D1001).
    NoDocuments = 1001,
    /// The filter could not be evaluated (D1002).
    InvalidFilter = 1002,
    /// The update or replacement document is malformed (D1003).
    InvalidUpdate = 1003,
    /// The aggregation pipeline is malformed (D1004).
    InvalidPipeline = 1004,
    /// The store does not support the requested operation (D1005).
    UnsupportedOperation = 1005,

    // Write errors (2xxx)
    /// Duplicate key (D2001).
    DuplicateKey = 2001,
    /// One or more writes of a bulk batch failed (D2002).
    BulkWrite = 2002,

    // Connection errors (3xxx)
    /// Connecting to the deployment failed (D3001).
    ConnectionFailed = 3001,
    /// No suitable server could be selected (D3002).
    ServerSelection = 3002,

    // Session and transaction errors (4xxx)
    /// The deployment does not support sessions or transactions (D4001).
    Capability = 4001,
    /// The session was already ended (D4002).
    SessionEnded = 4002,
    /// A transaction operation was invoked in the wrong state (D4003).
    TransactionState = 4003,
    /// The server aborted the transaction (D4004).
    TransactionAborted = 4004,
    /// A concurrent write conflicted with the transaction (D4005).
    WriteConflict = 4005,

    // Execution errors (5xxx)
    /// The operation context was cancelled (D5001).
    Cancelled = 5001,
    /// The operation context deadline passed (D5002).
    DeadlineExceeded = 5002,
    /// The server rejected a command (D5003).
    CommandFailed = 5003,

    // Data errors (6xxx)
    /// A value could not be encoded as BSON (D6001).
    Serialization = 6001,
    /// A document could not be decoded into the requested type (D6002).
    Decode = 6002,

    // Usage and configuration errors (7xxx)
    /// The API was used in a way it does not allow (D7001).
    Usage = 7001,
    /// Invalid configuration (D7002).
    InvalidConfiguration = 7002,

    // Internal errors (9xxx)
    /// Internal error (D9001).
    Internal = 9001,
}

impl ErrorCode {
    /// Get the error code string (e.g., "D1001").
    pub fn code(&self) -> String {
        format!("D{}", *self as u16)
    }

    /// Get a short description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoDocuments => "No documents matched",
            Self::InvalidFilter => "Invalid filter",
            Self::InvalidUpdate => "Invalid update",
            Self::InvalidPipeline => "Invalid pipeline",
            Self::UnsupportedOperation => "Unsupported operation",
            Self::DuplicateKey => "Duplicate key",
            Self::BulkWrite => "Bulk write failed",
            Self::ConnectionFailed => "Connection failed",
            Self::ServerSelection => "Server selection failed",
            Self::Capability => "Capability not supported",
            Self::SessionEnded => "Session ended",
            Self::TransactionState => "Invalid transaction state",
            Self::TransactionAborted => "Transaction aborted",
            Self::WriteConflict => "Write conflict",
            Self::Cancelled => "Operation cancelled",
            Self::DeadlineExceeded => "Deadline exceeded",
            Self::CommandFailed => "Command failed",
            Self::Serialization => "Serialization error",
            Self::Decode => "Decode error",
            Self::Usage => "Usage error",
            Self::InvalidConfiguration => "Invalid configuration",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Additional context for an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// The operation that was being performed.
    pub operation: Option<String>,
    /// The namespace (`database.collection`) involved.
    pub namespace: Option<String>,
    /// Help text.
    pub help: Option<String>,
}

impl ErrorContext {
    /// Create new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation.
    pub fn operation(mut self, op: impl Into<String>) -> Self {
        self.operation = Some(op.into());
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Set help text.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

/// Errors that can occur during document-store operations.
///
/// `QueryError` is cheap to clone so that sticky iterators can hand out the
/// captured error any number of times.
#[derive(Error, Debug, Clone)]
pub struct QueryError {
    /// The error code.
    pub code: ErrorCode,
    /// The error message.
    pub message: String,
    /// Additional context.
    pub context: ErrorContext,
    /// Error labels reported by the server.
    pub labels: Vec<String>,
    /// The numeric server error code, if the server reported one.
    pub server_code: Option<i32>,
    /// The source error (if any).
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl QueryError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            labels: Vec::new(),
            server_code: None,
            source: None,
        }
    }

    /// Add context about the operation.
    pub fn with_context(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.context.namespace = Some(ns.into());
        self
    }

    /// Add help text.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.context.help = Some(help.into());
        self
    }

    /// Attach an error label. Duplicate labels are ignored.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        self
    }

    /// Set the server error code.
    pub fn with_server_code(mut self, code: i32) -> Self {
        self.server_code = Some(code);
        self
    }

    /// Set the source error.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    // ============== Constructor Functions ==============

    /// A single-result request matched no document.
    pub fn no_documents() -> Self {
        Self::new(ErrorCode::NoDocuments, "no documents in result")
    }

    /// The caller used the API in a way it does not allow.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Usage, message)
    }

    /// The deployment lacks a capability (sessions, transactions).
    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Capability, message).with_help(
            "Transactions need a replica set or sharded cluster running server version 4.0 or newer",
        )
    }

    /// The session this operation relies on was already ended.
    pub fn session_ended() -> Self {
        Self::new(ErrorCode::SessionEnded, "session has already been ended")
    }

    /// A transaction operation was invoked in the wrong state.
    pub fn transaction_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransactionState, message)
    }

    /// The transaction was aborted by the store.
    pub fn transaction_aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransactionAborted, message)
    }

    /// A concurrent write conflicted with a transaction. Always transient.
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WriteConflict, message)
            .with_server_code(WRITE_CONFLICT_SERVER_CODE)
            .with_label(TRANSIENT_TRANSACTION_ERROR)
    }

    /// The operation context was cancelled.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    /// The operation context deadline passed.
    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "operation deadline exceeded")
    }

    /// A duplicate key was written.
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DuplicateKey, message).with_server_code(DUPLICATE_KEY_SERVER_CODE)
    }

    /// The filter could not be evaluated.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFilter, message)
    }

    /// The update or replacement is malformed.
    pub fn invalid_update(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidUpdate, message)
    }

    /// The aggregation pipeline is malformed.
    pub fn invalid_pipeline(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPipeline, message)
    }

    /// The store cannot run the requested operation.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedOperation, message)
    }

    /// The server rejected a command.
    pub fn command(server_code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandFailed, message).with_server_code(server_code)
    }

    /// Connecting to the deployment failed.
    pub fn connection(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorCode::ConnectionFailed, format!("Connection error: {}", message))
    }

    /// A value could not be encoded.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Serialization, message)
    }

    /// A document could not be decoded.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Decode, message)
    }

    /// Invalid configuration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    // ============== Error Checks ==============

    /// Check if a single-result request matched nothing.
    pub fn is_no_documents(&self) -> bool {
        self.code == ErrorCode::NoDocuments
    }

    /// Check if this is a usage error: a misuse of sessions, transactions
    /// or builders rather than a store failure.
    pub fn is_usage(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Usage | ErrorCode::SessionEnded | ErrorCode::TransactionState
        )
    }

    /// Check if the deployment lacks a capability.
    pub fn is_capability(&self) -> bool {
        self.code == ErrorCode::Capability
    }

    /// Check if the operation was cancelled or ran past its deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.code, ErrorCode::Cancelled | ErrorCode::DeadlineExceeded)
    }

    /// Check if a document failed to decode.
    pub fn is_decode(&self) -> bool {
        self.code == ErrorCode::Decode
    }

    /// Check if this is a duplicate key error.
    pub fn is_duplicate_key(&self) -> bool {
        self.code == ErrorCode::DuplicateKey || self.server_code == Some(DUPLICATE_KEY_SERVER_CODE)
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self.code, ErrorCode::ConnectionFailed | ErrorCode::ServerSelection)
    }

    /// Check if the error carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Check if the whole transaction may be retried.
    pub fn is_transient_transaction(&self) -> bool {
        self.has_label(TRANSIENT_TRANSACTION_ERROR)
    }

    /// Check if a commit failed with an unknown outcome.
    pub fn is_unknown_commit_result(&self) -> bool {
        self.has_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    }

    /// Get the error code.
    pub fn error_code(&self) -> &ErrorCode {
        &self.code
    }

    /// Display the error with its context, labels and help text.
    pub fn display_full(&self) -> String {
        let mut output = format!("Error [{}]: {}\n", self.code.code(), self.message);

        if let Some(ref op) = self.context.operation {
            output.push_str(&format!("  -> While: {}\n", op));
        }
        if let Some(ref ns) = self.context.namespace {
            output.push_str(&format!("  -> Namespace: {}\n", ns));
        }
        if let Some(code) = self.server_code {
            output.push_str(&format!("  -> Server code: {}\n", code));
        }
        if !self.labels.is_empty() {
            output.push_str(&format!("  -> Labels: {}\n", self.labels.join(", ")));
        }
        if let Some(ref help) = self.context.help {
            output.push_str(&format!("\nHelp: {}\n", help));
        }

        output
    }
}

impl From<bson::ser::Error> for QueryError {
    fn from(err: bson::ser::Error) -> Self {
        QueryError::serialization(err.to_string()).with_source(err)
    }
}

impl From<bson::de::Error> for QueryError {
    fn from(err: bson::de::Error) -> Self {
        QueryError::decode(err.to_string()).with_source(err)
    }
}
