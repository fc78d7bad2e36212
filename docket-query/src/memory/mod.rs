//! An in-process document store.
//!
//! [`MemoryStore`] implements the full [`DocumentStore`] contract without a
//! server: filters, updates, aggregation, indexes with unique constraints,
//! sessions with snapshot transactions, and change streams. It backs the
//! test suite and is handy for examples and prototyping.
//!
//! ```rust
//! use docket_query::{Client, OpContext};
//! use docket_query::memory::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> docket_query::QueryResult<()> {
//! let ctx = OpContext::background();
//! let client = Client::connect(MemoryStore::new(), &ctx).await?;
//! assert!(client.transactions_allowed());
//! # Ok(())
//! # }
//! ```

mod collection;
mod compare;
mod cursor;
mod events;
mod matcher;
mod pipeline;
mod session;
mod update;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::store::{
    BulkResult, CursorHandle, CursorRequest, DocumentStore, Namespace, Reply, Request, ServerStatus,
    SessionHandle, StreamHandle, TopologyKind, WatchRequest,
};

use collection::CollectionData;
use cursor::MemoryStream;
use events::{Change, EventLog, parse_resume_token};
use session::MemorySession;

pub use cursor::BufferedCursor;

/// Version reported by default.
pub const DEFAULT_VERSION: &str = "7.0.0";

/// Change events kept for resuming streams, by default.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

pub(crate) struct Shared {
    pub(crate) catalog: RwLock<HashMap<Namespace, CollectionData>>,
    pub(crate) events: Arc<EventLog>,
    version: String,
    topology: TopologyKind,
}

/// Builder for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreBuilder {
    version: String,
    topology: TopologyKind,
    event_capacity: usize,
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            topology: TopologyKind::ReplicaSet,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl MemoryStoreBuilder {
    /// Server version the store reports.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Deployment kind the store reports.
    pub fn topology(mut self, topology: TopologyKind) -> Self {
        self.topology = topology;
        self
    }

    /// Number of change events kept for resuming streams.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the store.
    pub fn build(self) -> MemoryStore {
        MemoryStore {
            shared: Arc::new(Shared {
                catalog: RwLock::new(HashMap::new()),
                events: Arc::new(EventLog::new(self.event_capacity)),
                version: self.version,
                topology: self.topology,
            }),
        }
    }
}

/// An in-process document store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("version", &self.shared.version)
            .field("topology", &self.shared.topology)
            .finish()
    }
}

impl MemoryStore {
    /// A replica-set store reporting [`DEFAULT_VERSION`].
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Configure a store.
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Number of documents currently committed in `ns`.
    pub fn len(&self, ns: &Namespace) -> usize {
        self.shared.catalog.read().get(ns).map_or(0, |c| c.docs.len())
    }

    /// Whether `ns` holds no committed documents.
    pub fn is_empty(&self, ns: &Namespace) -> bool {
        self.len(ns) == 0
    }

    /// The session an operation runs in, if its context is bound to one.
    fn session<'a>(&self, ctx: &'a OpContext) -> QueryResult<Option<&'a MemorySession>> {
        let Some(handle) = ctx.session() else {
            return Ok(None);
        };
        let session = handle
            .as_any()
            .downcast_ref::<MemorySession>()
            .ok_or_else(|| QueryError::usage("session belongs to a different store"))?;
        if !Arc::ptr_eq(&session.shared, &self.shared) {
            return Err(QueryError::usage("session belongs to a different store"));
        }
        if session.state.lock().ended {
            return Err(QueryError::session_ended());
        }
        Ok(Some(session))
    }

    fn in_transaction(&self, ctx: &OpContext) -> QueryResult<bool> {
        Ok(self
            .session(ctx)?
            .is_some_and(|s| s.state.lock().txn.is_some()))
    }

    /// Run `f` on the collection as seen by the context: the transaction's
    /// snapshot inside a transaction, the committed data otherwise.
    fn with_collection<R>(
        &self,
        ctx: &OpContext,
        ns: &Namespace,
        f: impl FnOnce(&mut CollectionData, &mut Vec<Change>) -> QueryResult<R>,
    ) -> QueryResult<R> {
        let mut changes = Vec::new();
        if let Some(session) = self.session(ctx)? {
            let mut state = session.state.lock();
            if state.ended {
                return Err(QueryError::session_ended());
            }
            if let Some(workspace) = state.txn.as_mut() {
                let snapshot = workspace.snapshot(ns, &self.shared);
                let out = f(&mut snapshot.data, &mut changes);
                if !changes.is_empty() {
                    snapshot.dirty = true;
                    workspace
                        .changes
                        .extend(changes.into_iter().map(|change| (ns.clone(), change)));
                }
                return out;
            }
        }

        let mut catalog = self.shared.catalog.write();
        let data = catalog.entry(ns.clone()).or_default();
        let out = f(data, &mut changes);
        if !changes.is_empty() {
            data.version += 1;
            drop(catalog);
            self.shared
                .events
                .publish(changes.into_iter().map(|change| (ns.clone(), change)).collect());
        }
        out
    }

    /// Run `f` on the committed collection, outside any transaction.
    /// Index changes bump the collection version so that transactions that
    /// copied the collection earlier fail to commit.
    fn with_committed<R>(
        &self,
        ns: &Namespace,
        bump: bool,
        f: impl FnOnce(&mut CollectionData) -> QueryResult<R>,
    ) -> QueryResult<R> {
        let mut catalog = self.shared.catalog.write();
        let data = catalog.entry(ns.clone()).or_default();
        let out = f(data)?;
        if bump {
            data.version += 1;
        }
        Ok(out)
    }

    fn bulk_write(
        &self,
        ctx: &OpContext,
        ns: &Namespace,
        models: &[crate::store::WriteModel],
        ordered: bool,
    ) -> QueryResult<BulkResult> {
        self.with_collection(ctx, ns, |data, changes| {
            let mut result = BulkResult::default();
            let mut first_error = None;
            for (index, model) in models.iter().enumerate() {
                if let Err(err) = data.write(model, index, &mut result, changes) {
                    trace!(index, kind = model.kind(), error = %err, "bulk write failed");
                    let err = err.with_context(format!("{} at index {}", model.kind(), index));
                    if ordered {
                        return Err(err);
                    }
                    first_error.get_or_insert(err);
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(result),
            }
        })
    }

    fn drop_collection(&self, ctx: &OpContext, ns: &Namespace) -> QueryResult<()> {
        if self.in_transaction(ctx)? {
            return Err(QueryError::unsupported("cannot drop a collection inside a transaction"));
        }
        let removed = self.shared.catalog.write().remove(ns);
        if removed.is_some() {
            self.shared.events.publish(vec![(ns.clone(), Change::dropped())]);
        }
        Ok(())
    }

    fn stream_position(&self, request: &WatchRequest) -> QueryResult<u64> {
        let options = &request.options;
        if let Some(token) = options.start_after.as_ref().or(options.resume_after.as_ref()) {
            return parse_resume_token(token);
        }
        if let Some(at) = options.start_at_operation_time {
            return Ok(self.shared.events.position_at(at));
        }
        Ok(self.shared.events.head())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn execute(&self, ctx: &OpContext, request: Request) -> QueryResult<Reply> {
        ctx.check()?;
        debug!(command = request.name(), ns = %request.namespace(), "memory store request");
        match request {
            Request::FindOne { ns, filter, options } => {
                let mut options = options;
                options.limit = Some(1);
                let docs = self.with_collection(ctx, &ns, |data, _| data.find(&filter, &options))?;
                Ok(Reply::Document(docs.into_iter().next()))
            }
            Request::Count { ns, filter, options } => self
                .with_collection(ctx, &ns, |data, _| data.count(&filter, &options))
                .map(Reply::Count),
            Request::Distinct { ns, field, filter, .. } => self
                .with_collection(ctx, &ns, |data, _| data.distinct(&field, &filter))
                .map(Reply::Values),
            Request::FindAndModify {
                ns,
                filter,
                modification,
                options,
            } => self
                .with_collection(ctx, &ns, |data, changes| {
                    data.find_and_modify(&filter, &modification, &options, changes)
                })
                .map(Reply::Document),
            Request::BulkWrite { ns, models, options } => self
                .bulk_write(ctx, &ns, &models, options.is_ordered())
                .map(Reply::Bulk),
            Request::Drop { ns } => self.drop_collection(ctx, &ns).map(|_| Reply::Ack),
            Request::CreateIndexes { ns, indexes } => self
                .with_committed(&ns, true, |data| data.create_indexes(&indexes))
                .map(Reply::Names),
            Request::DropIndexes { ns, name } => self
                .with_committed(&ns, true, |data| data.drop_index(&name))
                .map(|_| Reply::Ack),
            Request::ListIndexes { ns } => self
                .with_committed(&ns, false, |data| Ok(data.index_names()))
                .map(Reply::Names),
        }
    }

    async fn open_cursor(
        &self,
        ctx: &OpContext,
        request: CursorRequest,
    ) -> QueryResult<Box<dyn CursorHandle>> {
        ctx.check()?;
        let (docs, batch_size) = match &request {
            CursorRequest::Find { ns, filter, options } => (
                self.with_collection(ctx, ns, |data, _| data.find(filter, options))?,
                options.batch_size,
            ),
            CursorRequest::Aggregate { ns, pipeline, options } => (
                self.with_collection(ctx, ns, |data, _| data.aggregate(pipeline))?,
                options.batch_size,
            ),
        };
        debug!(ns = %request.namespace(), results = docs.len(), "memory store cursor");
        Ok(Box::new(BufferedCursor::new(docs, batch_size)))
    }

    async fn watch(&self, ctx: &OpContext, request: WatchRequest) -> QueryResult<Box<dyn StreamHandle>> {
        ctx.check()?;
        if self.in_transaction(ctx)? {
            return Err(QueryError::unsupported("change streams cannot be opened inside a transaction"));
        }
        let mut filters: Vec<Document> = Vec::with_capacity(request.pipeline.len());
        for stage in &request.pipeline {
            match stage.get_document("$match") {
                Ok(filter) if stage.len() == 1 => filters.push(filter.clone()),
                _ => {
                    return Err(QueryError::unsupported(
                        "the in-memory store only supports $match stages in change streams",
                    ));
                }
            }
        }
        let position = self.stream_position(&request)?;
        let mode = request.options.full_document.unwrap_or_default();
        debug!(ns = %request.ns, position, "memory store change stream");
        Ok(Box::new(MemoryStream::new(
            self.shared.events.clone(),
            request.ns,
            filters,
            mode,
            position,
        )))
    }

    async fn start_session(&self, ctx: &OpContext) -> QueryResult<Arc<dyn SessionHandle>> {
        ctx.check()?;
        Ok(Arc::new(MemorySession::new(self.shared.clone())))
    }

    async fn server_status(&self, _ctx: &OpContext) -> QueryResult<ServerStatus> {
        Ok(ServerStatus {
            version: self.shared.version.clone(),
            topology: self.shared.topology,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RequestOptions;
    use crate::store::{Modification, WriteModel};
    use bson::doc;
    use pretty_assertions::assert_eq;

    fn ns() -> Namespace {
        Namespace::new("app", "users")
    }

    async fn insert(store: &MemoryStore, ctx: &OpContext, docs: Vec<Document>) -> QueryResult<BulkResult> {
        let models = docs.into_iter().map(|document| WriteModel::InsertOne { document }).collect();
        store
            .execute(ctx, Request::BulkWrite { ns: ns(), models, options: RequestOptions::default() })
            .await?
            .into_bulk()
    }

    #[tokio::test]
    async fn test_unordered_bulk_continues_past_errors() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        insert(&store, &ctx, vec![doc! { "_id": 1 }]).await.unwrap();

        let models = vec![
            WriteModel::InsertOne { document: doc! { "_id": 1 } },
            WriteModel::InsertOne { document: doc! { "_id": 2 } },
        ];
        let options = RequestOptions { ordered: Some(false), ..RequestOptions::default() };
        let err = store
            .execute(&ctx, Request::BulkWrite { ns: ns(), models, options })
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(store.len(&ns()), 2);
    }

    #[tokio::test]
    async fn test_transaction_isolation_and_commit() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let handle = store.start_session(&ctx).await.unwrap();
        let txn_ctx = ctx.with_session(handle.clone());

        handle.start_transaction(None).await.unwrap();
        insert(&store, &txn_ctx, vec![doc! { "_id": 1 }]).await.unwrap();
        assert!(store.is_empty(&ns()));

        let inside = store
            .execute(&txn_ctx, Request::Count { ns: ns(), filter: doc! {}, options: RequestOptions::default() })
            .await
            .unwrap();
        assert_eq!(inside, Reply::Count(1));

        handle.commit_transaction(&txn_ctx).await.unwrap();
        assert_eq!(store.len(&ns()), 1);
    }

    #[tokio::test]
    async fn test_conflicting_commit_is_transient() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let handle = store.start_session(&ctx).await.unwrap();
        let txn_ctx = ctx.with_session(handle.clone());

        handle.start_transaction(None).await.unwrap();
        insert(&store, &txn_ctx, vec![doc! { "_id": 1 }]).await.unwrap();
        insert(&store, &ctx, vec![doc! { "_id": 2 }]).await.unwrap();

        let err = handle.commit_transaction(&txn_ctx).await.unwrap_err();
        assert!(err.is_transient_transaction());
        assert_eq!(store.len(&ns()), 1);
    }

    #[tokio::test]
    async fn test_ended_session_rejects_operations() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let handle = store.start_session(&ctx).await.unwrap();
        handle.end(&ctx).await;

        let err = insert(&store, &ctx.with_session(handle), vec![doc! { "_id": 1 }])
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::SessionEnded);
        assert!(store.is_empty(&ns()));
    }

    #[tokio::test]
    async fn test_find_and_modify_upsert() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let request = || Request::FindAndModify {
            ns: ns(),
            filter: doc! { "_id": "seq" },
            modification: Modification::Update(doc! { "$inc": { "n": 1 } }),
            options: RequestOptions {
                upsert: Some(true),
                return_document: Some(crate::options::ReturnDocument::After),
                ..RequestOptions::default()
            },
        };
        store.execute(&ctx, request()).await.unwrap();
        let reply = store.execute(&ctx, request()).await.unwrap();
        assert_eq!(reply, Reply::Document(Some(doc! { "_id": "seq", "n": 2 })));
    }

    #[tokio::test]
    async fn test_watch_rejects_unsupported_stages() {
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let request = WatchRequest {
            ns: ns(),
            pipeline: vec![doc! { "$project": { "a": 1 } }],
            options: RequestOptions::default(),
        };
        let err = store.watch(&ctx, request).await.err().unwrap();
        assert_eq!(err.code, crate::ErrorCode::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_server_status_reports_builder_settings() {
        let store = MemoryStore::builder()
            .version("3.6.0")
            .topology(TopologyKind::Single)
            .build();
        let status = store.server_status(&OpContext::background()).await.unwrap();
        assert_eq!(status.version, "3.6.0");
        assert_eq!(status.topology, TopologyKind::Single);
    }
}
