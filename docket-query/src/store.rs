//! The contract between docket and a document store.
//!
//! docket never talks to a database directly. Everything network-bound goes
//! through the collaborator traits defined here:
//!
//! - [`DocumentStore`] runs requests, opens cursors and change streams,
//!   starts sessions and reports server status
//! - [`SessionHandle`] drives one logical session and its transactions
//! - [`CursorHandle`] and [`StreamHandle`] iterate server-side results
//!
//! Requests are plain data: a [`Namespace`], a filter or pipeline and the
//! compiled [`RequestOptions`]. A store looks at the context's bound
//! session (see [`OpContext::session`]) to decide whether a request runs
//! inside a transaction.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::future::BoxFuture;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::options::RequestOptions;
use crate::transaction::{TransactionBody, TransactionOptions, retry_transaction};

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// Create a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// What find-and-modify does to the matched document.
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    /// Apply update operators.
    Update(Document),
    /// Replace the document wholesale.
    Replace(Document),
    /// Remove the document.
    Delete,
}

/// One write of a bulk batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    /// Insert a document.
    InsertOne {
        /// The document. Always carries an `_id`.
        document: Document,
    },
    /// Update the first matching document.
    UpdateOne {
        /// Selection filter.
        filter: Document,
        /// Update operators.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Update every matching document.
    UpdateMany {
        /// Selection filter.
        filter: Document,
        /// Update operators.
        update: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Replace the first matching document.
    ReplaceOne {
        /// Selection filter.
        filter: Document,
        /// Replacement document.
        replacement: Document,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// Delete the first matching document.
    DeleteOne {
        /// Selection filter.
        filter: Document,
    },
    /// Delete every matching document.
    DeleteMany {
        /// Selection filter.
        filter: Document,
    },
}

impl WriteModel {
    /// Short name of the write kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsertOne { .. } => "insertOne",
            Self::UpdateOne { .. } => "updateOne",
            Self::UpdateMany { .. } => "updateMany",
            Self::ReplaceOne { .. } => "replaceOne",
            Self::DeleteOne { .. } => "deleteOne",
            Self::DeleteMany { .. } => "deleteMany",
        }
    }
}

/// Counters and generated ids of a bulk batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    /// Documents inserted.
    pub inserted_count: u64,
    /// Documents matched by updates and replaces.
    pub matched_count: u64,
    /// Documents actually changed by updates and replaces.
    pub modified_count: u64,
    /// Documents deleted.
    pub deleted_count: u64,
    /// Documents inserted by upserts.
    pub upserted_count: u64,
    /// `_id` of each inserted document, keyed by model index.
    pub inserted_ids: BTreeMap<usize, Bson>,
    /// `_id` of each upserted document, keyed by model index.
    pub upserted_ids: BTreeMap<usize, Bson>,
}

impl BulkResult {
    /// Fold another partial result into this one, shifting its model
    /// indices by `offset`.
    pub fn merge(&mut self, other: BulkResult, offset: usize) {
        self.inserted_count += other.inserted_count;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.upserted_count += other.upserted_count;
        self.inserted_ids
            .extend(other.inserted_ids.into_iter().map(|(i, id)| (i + offset, id)));
        self.upserted_ids
            .extend(other.upserted_ids.into_iter().map(|(i, id)| (i + offset, id)));
    }
}

/// Options of one index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    /// Index name. Derived from the keys when absent.
    pub name: Option<String>,
    /// Reject duplicate keys.
    pub unique: Option<bool>,
    /// Only index documents containing the keys.
    pub sparse: Option<bool>,
    /// Expire documents this long after the indexed date.
    pub expire_after: Option<Duration>,
}

/// An index definition.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    /// Key pattern.
    pub keys: Document,
    /// Index options.
    pub options: IndexOptions,
}

impl IndexModel {
    /// The index name, explicit or derived from the keys.
    pub fn name(&self) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| crate::sort::index_name_for(&self.keys))
    }
}

/// A request answered with a single reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Fetch the first matching document.
    FindOne {
        /// Target.
        ns: Namespace,
        /// Selection filter.
        filter: Document,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Count matching documents.
    Count {
        /// Target.
        ns: Namespace,
        /// Selection filter.
        filter: Document,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Distinct values of a field.
    Distinct {
        /// Target.
        ns: Namespace,
        /// Field path.
        field: String,
        /// Selection filter.
        filter: Document,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Atomically modify one document and return it.
    FindAndModify {
        /// Target.
        ns: Namespace,
        /// Selection filter.
        filter: Document,
        /// What to do with the match.
        modification: Modification,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Run a batch of writes.
    BulkWrite {
        /// Target.
        ns: Namespace,
        /// Writes in order.
        models: Vec<WriteModel>,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Drop a collection.
    Drop {
        /// Target.
        ns: Namespace,
    },
    /// Create indexes.
    CreateIndexes {
        /// Target.
        ns: Namespace,
        /// Index definitions.
        indexes: Vec<IndexModel>,
    },
    /// Drop an index by name, or every index for `"*"`.
    DropIndexes {
        /// Target.
        ns: Namespace,
        /// Index name.
        name: String,
    },
    /// List index names.
    ListIndexes {
        /// Target.
        ns: Namespace,
    },
}

impl Request {
    /// The command name, for logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindOne { .. } => "findOne",
            Self::Count { .. } => "count",
            Self::Distinct { .. } => "distinct",
            Self::FindAndModify { .. } => "findAndModify",
            Self::BulkWrite { .. } => "bulkWrite",
            Self::Drop { .. } => "drop",
            Self::CreateIndexes { .. } => "createIndexes",
            Self::DropIndexes { .. } => "dropIndexes",
            Self::ListIndexes { .. } => "listIndexes",
        }
    }

    /// The namespace the request targets.
    pub fn namespace(&self) -> &Namespace {
        match self {
            Self::FindOne { ns, .. }
            | Self::Count { ns, .. }
            | Self::Distinct { ns, .. }
            | Self::FindAndModify { ns, .. }
            | Self::BulkWrite { ns, .. }
            | Self::Drop { ns }
            | Self::CreateIndexes { ns, .. }
            | Self::DropIndexes { ns, .. }
            | Self::ListIndexes { ns } => ns,
        }
    }
}

/// A request answered with a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorRequest {
    /// Multi-document find.
    Find {
        /// Target.
        ns: Namespace,
        /// Selection filter.
        filter: Document,
        /// Compiled options.
        options: RequestOptions,
    },
    /// Aggregation pipeline.
    Aggregate {
        /// Target.
        ns: Namespace,
        /// Stages in order.
        pipeline: Vec<Document>,
        /// Compiled options.
        options: RequestOptions,
    },
}

impl CursorRequest {
    /// The namespace the request targets.
    pub fn namespace(&self) -> &Namespace {
        match self {
            Self::Find { ns, .. } | Self::Aggregate { ns, .. } => ns,
        }
    }
}

/// A change stream request.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRequest {
    /// Collection to watch.
    pub ns: Namespace,
    /// Stages applied to change events.
    pub pipeline: Vec<Document>,
    /// Compiled options.
    pub options: RequestOptions,
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A single document, or none.
    Document(Option<Document>),
    /// A count.
    Count(u64),
    /// A list of values.
    Values(Vec<Bson>),
    /// Bulk write counters.
    Bulk(BulkResult),
    /// Index names.
    Names(Vec<String>),
    /// Plain acknowledgment.
    Ack,
}

impl Reply {
    fn mismatch(&self, expected: &str) -> QueryError {
        QueryError::internal(format!("store replied {:?} where {} was expected", self, expected))
    }

    /// Extract a single-document reply.
    pub fn into_document(self) -> QueryResult<Option<Document>> {
        match self {
            Self::Document(doc) => Ok(doc),
            other => Err(other.mismatch("a document")),
        }
    }

    /// Extract a count reply.
    pub fn into_count(self) -> QueryResult<u64> {
        match self {
            Self::Count(n) => Ok(n),
            other => Err(other.mismatch("a count")),
        }
    }

    /// Extract a value-list reply.
    pub fn into_values(self) -> QueryResult<Vec<Bson>> {
        match self {
            Self::Values(values) => Ok(values),
            other => Err(other.mismatch("a value list")),
        }
    }

    /// Extract a bulk reply.
    pub fn into_bulk(self) -> QueryResult<BulkResult> {
        match self {
            Self::Bulk(result) => Ok(result),
            other => Err(other.mismatch("a bulk result")),
        }
    }

    /// Extract a name-list reply.
    pub fn into_names(self) -> QueryResult<Vec<String>> {
        match self {
            Self::Names(names) => Ok(names),
            other => Err(other.mismatch("a name list")),
        }
    }
}

/// Deployment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// A standalone server.
    Single,
    /// A replica set.
    ReplicaSet,
    /// A sharded cluster.
    Sharded,
    /// Servers behind a load balancer.
    LoadBalanced,
    /// Not yet determined.
    Unknown,
}

/// What a store reports about the deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    /// Server version string (e.g. `"7.0.2"`).
    pub version: String,
    /// Deployment kind.
    pub topology: TopologyKind,
}

/// A document store.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Run a request answered with a single reply.
    async fn execute(&self, ctx: &OpContext, request: Request) -> QueryResult<Reply>;

    /// Open a cursor over the results of a find or aggregation.
    async fn open_cursor(
        &self,
        ctx: &OpContext,
        request: CursorRequest,
    ) -> QueryResult<Box<dyn CursorHandle>>;

    /// Open a change stream.
    async fn watch(&self, ctx: &OpContext, request: WatchRequest)
    -> QueryResult<Box<dyn StreamHandle>>;

    /// Start a logical session.
    async fn start_session(&self, ctx: &OpContext) -> QueryResult<Arc<dyn SessionHandle>>;

    /// Report the server version and deployment kind.
    async fn server_status(&self, ctx: &OpContext) -> QueryResult<ServerStatus>;

    /// Check that the deployment is reachable.
    async fn ping(&self, ctx: &OpContext) -> QueryResult<()> {
        self.server_status(ctx).await.map(|_| ())
    }

    /// Release resources held by the store.
    async fn shutdown(&self, _ctx: &OpContext) -> QueryResult<()> {
        Ok(())
    }
}

/// One logical session held by a store.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    /// Session identifier.
    fn id(&self) -> Uuid;

    /// Downcast support for stores that need their concrete session type.
    fn as_any(&self) -> &dyn Any;

    /// Start a transaction on this session.
    async fn start_transaction(&self, options: Option<TransactionOptions>) -> QueryResult<()>;

    /// Commit the active transaction.
    async fn commit_transaction(&self, ctx: &OpContext) -> QueryResult<()>;

    /// Abort the active transaction.
    async fn abort_transaction(&self, ctx: &OpContext) -> QueryResult<()>;

    /// End the session, aborting any active transaction.
    async fn end(&self, ctx: &OpContext);

    /// Run `body` in a transaction, retrying per the store's retry policy.
    ///
    /// The default retries the whole body on `TransientTransactionError`
    /// and the commit on `UnknownTransactionCommitResult`, within a bounded
    /// time window. `ctx` is expected to be bound to this session.
    fn with_transaction<'a>(
        &'a self,
        ctx: &'a OpContext,
        options: Option<TransactionOptions>,
        body: &'a mut TransactionBody<'a>,
    ) -> BoxFuture<'a, QueryResult<()>> {
        Box::pin(retry_transaction(self, ctx, options, body))
    }
}

/// A server-side cursor.
#[async_trait]
pub trait CursorHandle: Send {
    /// Server cursor id. Zero once the server has no more results.
    fn id(&self) -> i64;

    /// The document the cursor is positioned on.
    fn current(&self) -> Option<&Document>;

    /// Documents left in the current local batch.
    fn remaining_batch_length(&self) -> usize;

    /// Move to the next document, fetching batches as needed. Returns
    /// `false` when the results are exhausted.
    async fn advance(&mut self, ctx: &OpContext) -> QueryResult<bool>;

    /// Move to the next document with at most one round trip. Returns
    /// `false` when nothing is available yet.
    async fn try_advance(&mut self, ctx: &OpContext) -> QueryResult<bool>;

    /// Release the server-side cursor.
    async fn close(&mut self, ctx: &OpContext) -> QueryResult<()>;
}

/// A change stream: a cursor over change events that can be resumed.
pub trait StreamHandle: CursorHandle {
    /// Token to resume the stream after the last observed event.
    fn resume_token(&self) -> Option<Document>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_namespace_display() {
        assert_eq!(Namespace::new("app", "users").to_string(), "app.users");
    }

    #[test]
    fn test_bulk_merge_shifts_indices() {
        let mut total = BulkResult::default();
        let mut first = BulkResult::default();
        first.inserted_count = 1;
        first.inserted_ids.insert(0, Bson::Int32(1));
        let mut second = BulkResult::default();
        second.upserted_count = 1;
        second.upserted_ids.insert(0, Bson::Int32(9));

        total.merge(first, 0);
        total.merge(second, 3);
        assert_eq!(total.inserted_ids.get(&0), Some(&Bson::Int32(1)));
        assert_eq!(total.upserted_ids.get(&3), Some(&Bson::Int32(9)));
        assert_eq!(total.upserted_count, 1);
    }

    #[test]
    fn test_reply_mismatch_is_internal() {
        let err = Reply::Count(3).into_document().unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::Internal);
        assert_eq!(Reply::Document(Some(doc! {})).into_document().unwrap(), Some(doc! {}));
    }

    #[test]
    fn test_index_model_name() {
        let model = IndexModel {
            keys: doc! { "age": -1, "name": 1 },
            options: IndexOptions::default(),
        };
        assert_eq!(model.name(), "age_-1_name_1");
    }
}
