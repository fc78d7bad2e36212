//! # docket-query
//!
//! Sessions, transactions, sticky-error cursors and fluent request builders
//! for document stores.
//!
//! This crate holds everything that does not depend on a particular
//! database driver:
//! - an operation context carrying cancellation, deadlines and the session
//!   an operation belongs to
//! - the session and transaction state machine, including closure-scoped
//!   transactions with transient-error retry
//! - cursors and change streams that capture an opening failure and report
//!   it when inspected
//! - chainable builders for find, aggregate, bulk, distinct and
//!   find-and-modify requests, compiled into immutable [`RequestOptions`]
//! - the [`DocumentStore`] traits a driver implements, and an in-memory
//!   [`memory::MemoryStore`]
//!
//! ## Sorting
//!
//! Sort keys use a small string language: `"age"` or `"+age"` ascends,
//! `"-age"` descends and `"$textScore:score"` sorts by text relevance.
//!
//! ```rust
//! use bson::doc;
//! use docket_query::SortSpec;
//!
//! let sort = SortSpec::parse(["-age", "name"]);
//! assert_eq!(sort.to_document(), doc! { "age": -1, "name": 1 });
//!
//! let sort = SortSpec::parse(["$textScore:score"]);
//! assert_eq!(sort.to_document(), doc! { "score": { "$meta": "textScore" } });
//! ```
//!
//! ## Transactions
//!
//! ```rust
//! use bson::{doc, Document};
//! use docket_query::{Client, OpContext, memory::MemoryStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> docket_query::QueryResult<()> {
//! let ctx = OpContext::background();
//! let client = Client::connect(MemoryStore::new(), &ctx).await?;
//! let users = client.database("app").collection("users");
//!
//! let tx = client.begin(&ctx).await?;
//! users.insert_one(tx.context(), &doc! { "_id": "uid1" }).await?;
//! users.insert_one(tx.context(), &doc! { "_id": "uid2" }).await?;
//! tx.commit(&ctx).await?;
//!
//! let found: Vec<Document> = users
//!     .find(&ctx, doc! { "_id": { "$in": ["uid1", "uid2"] } })
//!     .sort(["_id"])
//!     .all()
//!     .await?;
//! assert_eq!(found.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use docket_query::{ErrorCode, QueryError};
//!
//! let err = QueryError::session_ended();
//! assert_eq!(err.code, ErrorCode::SessionEnded);
//! assert!(err.is_usage());
//! ```

pub mod capability;
pub mod client;
pub mod context;
pub mod cursor;
pub mod error;
pub mod index;
pub mod logging;
pub mod memory;
pub mod oid;
pub mod operations;
pub mod options;
pub mod session;
pub mod sort;
pub mod store;
pub mod stream;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use capability::{MIN_TRANSACTION_VERSION, ServerInfo, compare_server_versions};
pub use client::{
    Client, Collection, ConnectOptions, DEFAULT_STATUS_TIMEOUT, Database, DeleteResult,
    InsertManyResult, InsertOneResult, UpdateResult,
};
pub use context::OpContext;
pub use cursor::Cursor;
pub use error::{
    DUPLICATE_KEY_SERVER_CODE, ErrorCode, ErrorContext, QueryError, QueryResult,
    TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT, WRITE_CONFLICT_SERVER_CODE,
};
pub use index::IndexView;
pub use oid::{is_valid_object_id, new_object_id, object_id_from_hex};
pub use operations::{
    Aggregate, Bulk, DeleteKind, Distinct, FindAndModify, FindDelete, FindReplace, FindUpdate,
    Query, ReplaceKind, UpdateKind, Watch,
};
pub use options::{
    Collation, FullDocument, Hint, OptionSet, ReadConcern, RequestOptions, RequestShape,
    ReturnDocument, WriteConcern,
};
pub use session::{Session, SessionState};
pub use sort::{SortDirection, SortKey, SortSpec};
pub use store::{
    BulkResult, CursorHandle, CursorRequest, DocumentStore, IndexModel, IndexOptions, Modification,
    Namespace, Reply, Request, ServerStatus, SessionHandle, StreamHandle, TopologyKind,
    WatchRequest, WriteModel,
};
pub use stream::{ChangeEvent, ChangeNamespace, ChangeStream, OperationType, UpdateDescription};
pub use transaction::{
    Transaction, TransactionOptions, TransactionState, WITH_TRANSACTION_TIMEOUT, retry_transaction,
};

// Re-export logging utilities
pub use logging::{
    get_log_format, get_log_level, init as init_logging, init_debug, init_with_level,
    is_debug_enabled,
};

// Re-export the document model
pub use bson::{self, Bson, Document, doc};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, Collection, Database};
    pub use crate::context::OpContext;
    pub use crate::cursor::Cursor;
    pub use crate::error::{QueryError, QueryResult};
    pub use crate::operations::*;
    pub use crate::options::{FullDocument, ReturnDocument};
    pub use crate::session::Session;
    pub use crate::store::{DocumentStore, WriteModel};
    pub use crate::stream::{ChangeEvent, ChangeStream};
    pub use crate::transaction::{Transaction, TransactionOptions};
    pub use bson::{Bson, Document, doc};
}
