//! Client, database and collection handles.
//!
//! A [`Client`] owns a [`DocumentStore`] and what was learned about the
//! deployment when it connected. [`Database`] and [`Collection`] are cheap
//! named views onto it; every builder starts from a collection.
//!
//! ```rust,ignore
//! let client = Client::connect(store, &ctx).await?;
//! let users = client.database("app").collection("users");
//!
//! let tx = client.begin(&ctx).await?;
//! users.insert_one(tx.context(), &doc! { "_id": "uid1" }).await?;
//! tx.commit(&ctx).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use serde::Serialize;
use tracing::{debug, info};

use crate::capability::{MIN_TRANSACTION_VERSION, ServerInfo};
use crate::context::OpContext;
use crate::cursor::Cursor;
use crate::error::{QueryError, QueryResult};
use crate::index::IndexView;
use crate::oid::{ensure_id, to_document};
use crate::operations::{
    Aggregate, Bulk, Distinct, FindDelete, FindReplace, FindUpdate, Query, Watch,
};
use crate::options::{OptionSet, RequestShape};
use crate::session::Session;
use crate::store::{
    CursorRequest, DocumentStore, Namespace, Reply, Request, ServerStatus, TopologyKind,
    WatchRequest, WriteModel,
};
use crate::stream::ChangeStream;
use crate::transaction::{Transaction, TransactionOptions};

/// Default timeout of the deployment status check run by [`Client::connect`].
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// Options for [`Client::connect_with`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeout of the initial status check.
    pub status_timeout: Duration,
    /// Lowest server version allowed to run transactions.
    pub min_transaction_version: String,
    /// Use this topology instead of the one the store reports.
    pub topology_override: Option<TopologyKind>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            min_transaction_version: MIN_TRANSACTION_VERSION.to_string(),
            topology_override: None,
        }
    }
}

impl ConnectOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status check timeout.
    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Set the minimum transaction version.
    pub fn min_transaction_version(mut self, version: impl Into<String>) -> Self {
        self.min_transaction_version = version.into();
        self
    }

    /// Override the reported topology.
    pub fn topology_override(mut self, topology: TopologyKind) -> Self {
        self.topology_override = Some(topology);
        self
    }
}

/// Entry point: a store plus what is known about the deployment.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn DocumentStore>,
    info: Arc<ServerInfo>,
}

impl Client {
    /// Connect with default options.
    pub async fn connect<S: DocumentStore>(store: S, ctx: &OpContext) -> QueryResult<Self> {
        Self::connect_with(Arc::new(store), ctx, ConnectOptions::default()).await
    }

    /// Query the deployment and decide whether transactions are allowed.
    pub async fn connect_with(
        store: Arc<dyn DocumentStore>,
        ctx: &OpContext,
        options: ConnectOptions,
    ) -> QueryResult<Self> {
        let status_ctx = ctx.with_timeout(options.status_timeout);
        let mut status = status_ctx
            .run(store.server_status(&status_ctx))
            .await
            .map_err(|err| err.with_context("query deployment status"))?;
        if let Some(topology) = options.topology_override {
            status.topology = topology;
        }

        let info = ServerInfo::detect(&status, &options.min_transaction_version);
        info!(
            version = %info.version,
            topology = ?info.topology,
            transactions = info.transactions_allowed,
            "Connected to document store"
        );

        Ok(Self {
            store,
            info: Arc::new(info),
        })
    }

    /// Build a client from already known deployment facts, without probing.
    pub fn with_server_info(store: Arc<dyn DocumentStore>, info: ServerInfo) -> Self {
        Self {
            store,
            info: Arc::new(info),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// What was learned about the deployment.
    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    /// Server version string.
    pub fn server_version(&self) -> &str {
        &self.info.version
    }

    /// Deployment kind detected at connect time.
    pub fn topology(&self) -> TopologyKind {
        self.info.topology
    }

    /// Whether sessions and transactions may be used.
    pub fn transactions_allowed(&self) -> bool {
        self.info.transactions_allowed
    }

    /// A database handle.
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// Check that the deployment is reachable.
    pub async fn ping(&self, ctx: &OpContext) -> QueryResult<()> {
        ctx.run(self.store.ping(ctx)).await
    }

    /// Ask the store for a fresh status report.
    pub async fn server_status(&self, ctx: &OpContext) -> QueryResult<ServerStatus> {
        ctx.run(self.store.server_status(ctx)).await
    }

    /// Release the store's resources.
    pub async fn close(&self, ctx: &OpContext) -> QueryResult<()> {
        self.store.shutdown(ctx).await
    }

    fn ensure_transactions(&self) -> QueryResult<()> {
        if self.info.transactions_allowed {
            Ok(())
        } else {
            Err(QueryError::capability(format!(
                "sessions are not supported by this deployment (version {}, {:?})",
                self.info.version, self.info.topology
            )))
        }
    }

    /// Start a session.
    pub async fn start_session(&self, ctx: &OpContext) -> QueryResult<Session> {
        self.ensure_transactions()?;
        let handle = ctx.run(self.store.start_session(ctx)).await?;
        debug!(session = %handle.id(), "session started");
        Ok(Session::new(handle, ctx))
    }

    /// Begin a transaction on a fresh session. Committing or rolling back
    /// also ends the session.
    pub async fn begin(&self, ctx: &OpContext) -> QueryResult<Transaction> {
        self.begin_with(ctx, None).await
    }

    /// [`Client::begin`] with transaction options.
    pub async fn begin_with(
        &self,
        ctx: &OpContext,
        options: Option<TransactionOptions>,
    ) -> QueryResult<Transaction> {
        let session = self.start_session(ctx).await?;
        if let Err(err) = session.start_transaction(options).await {
            session.finish(ctx).await;
            return Err(err);
        }
        Ok(Transaction::new(session, true))
    }

    /// Run `f` in a transaction on a fresh session, retrying transient
    /// failures. The session is ended afterwards.
    pub async fn with_transaction<F, Fut, T>(&self, ctx: &OpContext, f: F) -> QueryResult<T>
    where
        F: FnMut(OpContext) -> Fut + Send,
        Fut: Future<Output = QueryResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.with_transaction_opts(ctx, None, f).await
    }

    /// [`Client::with_transaction`] with transaction options.
    pub async fn with_transaction_opts<F, Fut, T>(
        &self,
        ctx: &OpContext,
        options: Option<TransactionOptions>,
        f: F,
    ) -> QueryResult<T>
    where
        F: FnMut(OpContext) -> Fut + Send,
        Fut: Future<Output = QueryResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.start_session(ctx).await?;
        let result = session.with_transaction_opts(ctx, options, f).await;
        session.finish(ctx).await;
        result
    }

    /// Run `f` with a fresh session, ending it afterwards unless `f` did.
    pub async fn use_session<F, Fut, T>(&self, ctx: &OpContext, f: F) -> QueryResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = QueryResult<T>>,
    {
        let session = self.start_session(ctx).await?;
        let result = f(session.clone()).await;
        session.finish(ctx).await;
        result
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("info", &self.info).finish()
    }
}

/// A named database.
#[derive(Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A collection handle.
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        let name = name.into();
        Collection {
            ns: Namespace::new(self.name.clone(), name),
            database: self.clone(),
        }
    }

    /// Start a session on the owning client.
    pub async fn start_session(&self, ctx: &OpContext) -> QueryResult<Session> {
        self.client.start_session(ctx).await
    }

    /// Begin a transaction on a fresh session; see [`Client::begin`].
    pub async fn begin(&self, ctx: &OpContext) -> QueryResult<Transaction> {
        self.client.begin(ctx).await
    }

    /// [`Database::begin`] with transaction options.
    pub async fn begin_with(
        &self,
        ctx: &OpContext,
        options: Option<TransactionOptions>,
    ) -> QueryResult<Transaction> {
        self.client.begin_with(ctx, options).await
    }

    /// Run `f` in a transaction on a fresh session; see
    /// [`Client::with_transaction`].
    pub async fn with_transaction<F, Fut, T>(&self, ctx: &OpContext, f: F) -> QueryResult<T>
    where
        F: FnMut(OpContext) -> Fut + Send,
        Fut: Future<Output = QueryResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.client.with_transaction(ctx, f).await
    }

    /// Run `f` with a fresh session; see [`Client::use_session`].
    pub async fn use_session<F, Fut, T>(&self, ctx: &OpContext, f: F) -> QueryResult<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = QueryResult<T>>,
    {
        self.client.use_session(ctx, f).await
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

/// Outcome of [`Collection::insert_one`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    /// `_id` of the inserted document.
    pub inserted_id: Bson,
}

/// Outcome of [`Collection::insert_many`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    /// `_id` of each inserted document, keyed by input position.
    pub inserted_ids: BTreeMap<usize, Bson>,
}

/// Outcome of updates and replaces.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    /// Documents matched.
    pub matched_count: u64,
    /// Documents changed.
    pub modified_count: u64,
    /// `_id` of the upserted document, if one was inserted.
    pub upserted_id: Option<Bson>,
}

/// Outcome of deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    /// Documents deleted.
    pub deleted_count: u64,
}

/// A named collection.
#[derive(Clone)]
pub struct Collection {
    database: Database,
    ns: Namespace,
}

impl Collection {
    /// Collection name.
    pub fn name(&self) -> &str {
        &self.ns.collection
    }

    /// `database.collection`.
    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// The owning database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// The owning client.
    pub fn client(&self) -> &Client {
        &self.database.client
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.database.client.store
    }

    fn annotate(&self, err: QueryError, operation: &str) -> QueryError {
        let mut err = err;
        if err.context.namespace.is_none() {
            err.context.namespace = Some(self.ns.to_string());
        }
        if err.context.operation.is_none() {
            err.context.operation = Some(operation.to_string());
        }
        err
    }

    pub(crate) async fn execute(&self, ctx: &OpContext, request: Request) -> QueryResult<Reply> {
        let name = request.name();
        debug!(ns = %self.ns, op = name, "execute");
        crate::docket_trace!(ns = %self.ns, request = ?request, "request body");
        ctx.run(self.store().execute(ctx, request))
            .await
            .map_err(|err| self.annotate(err, name))
    }

    pub(crate) async fn open_cursor(&self, ctx: &OpContext, request: CursorRequest) -> Cursor {
        debug!(ns = %self.ns, "open cursor");
        crate::docket_trace!(ns = %self.ns, request = ?request, "cursor request body");
        let opened = ctx
            .run(self.store().open_cursor(ctx, request))
            .await
            .map_err(|err| self.annotate(err, "open cursor"));
        Cursor::new(opened)
    }

    pub(crate) async fn open_stream(&self, ctx: &OpContext, request: WatchRequest) -> ChangeStream {
        debug!(ns = %self.ns, "open change stream");
        let opened = ctx
            .run(self.store().watch(ctx, request))
            .await
            .map_err(|err| self.annotate(err, "watch"));
        ChangeStream::new(opened)
    }

    /// Start a find.
    pub fn find(&self, ctx: &OpContext, filter: Document) -> Query {
        Query::new(self.clone(), ctx.clone(), filter)
    }

    /// Start an aggregation.
    pub fn aggregate(&self, ctx: &OpContext, pipeline: Vec<Document>) -> Aggregate {
        Aggregate::new(self.clone(), ctx.clone(), pipeline)
    }

    /// Start a bulk write batch.
    pub fn bulk(&self, ctx: &OpContext) -> Bulk {
        Bulk::new(self.clone(), ctx.clone())
    }

    /// Start a distinct-values request.
    pub fn distinct(&self, ctx: &OpContext, field: impl Into<String>, filter: Document) -> Distinct {
        Distinct::new(self.clone(), ctx.clone(), field.into(), filter)
    }

    /// Atomically update one document and return it.
    pub fn find_one_and_update(&self, ctx: &OpContext, filter: Document, update: Document) -> FindUpdate {
        FindUpdate::update(self.clone(), ctx.clone(), filter, update)
    }

    /// Atomically replace one document and return it.
    pub fn find_one_and_replace<T: Serialize>(
        &self,
        ctx: &OpContext,
        filter: Document,
        replacement: &T,
    ) -> FindReplace {
        FindReplace::replace(self.clone(), ctx.clone(), filter, to_document(replacement))
    }

    /// Atomically delete one document and return it.
    pub fn find_one_and_delete(&self, ctx: &OpContext, filter: Document) -> FindDelete {
        FindDelete::delete(self.clone(), ctx.clone(), filter)
    }

    /// Start a change stream on this collection.
    pub fn watch(&self, ctx: &OpContext) -> Watch {
        Watch::new(self.clone(), ctx.clone())
    }

    /// Index management.
    pub fn indexes(&self) -> IndexView {
        IndexView::new(self.clone())
    }

    async fn write(&self, ctx: &OpContext, models: Vec<WriteModel>) -> QueryResult<crate::store::BulkResult> {
        let options = OptionSet::new().compile(RequestShape::BulkWrite);
        let request = Request::BulkWrite {
            ns: self.ns.clone(),
            models,
            options,
        };
        self.execute(ctx, request).await?.into_bulk()
    }

    /// Insert one document, generating an `_id` when it has none.
    pub async fn insert_one<T: Serialize>(&self, ctx: &OpContext, document: &T) -> QueryResult<InsertOneResult> {
        let mut document = to_document(document)?;
        let inserted_id = ensure_id(&mut document);
        self.write(ctx, vec![WriteModel::InsertOne { document }]).await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Insert documents in order, stopping at the first failure.
    pub async fn insert_many<T: Serialize>(
        &self,
        ctx: &OpContext,
        documents: impl IntoIterator<Item = T>,
    ) -> QueryResult<InsertManyResult> {
        let mut models = Vec::new();
        let mut inserted_ids = BTreeMap::new();
        for (i, document) in documents.into_iter().enumerate() {
            let mut document = to_document(&document)?;
            inserted_ids.insert(i, ensure_id(&mut document));
            models.push(WriteModel::InsertOne { document });
        }
        if models.is_empty() {
            return Err(QueryError::usage("insert_many needs at least one document"));
        }
        self.write(ctx, models).await?;
        Ok(InsertManyResult { inserted_ids })
    }

    fn update_result(result: crate::store::BulkResult) -> UpdateResult {
        UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_ids.into_values().next(),
        }
    }

    /// Update the first matching document.
    pub async fn update_one(&self, ctx: &OpContext, filter: Document, update: Document) -> QueryResult<UpdateResult> {
        let model = WriteModel::UpdateOne {
            filter,
            update,
            upsert: false,
        };
        Ok(Self::update_result(self.write(ctx, vec![model]).await?))
    }

    /// Update every matching document.
    pub async fn update_many(&self, ctx: &OpContext, filter: Document, update: Document) -> QueryResult<UpdateResult> {
        let model = WriteModel::UpdateMany {
            filter,
            update,
            upsert: false,
        };
        Ok(Self::update_result(self.write(ctx, vec![model]).await?))
    }

    /// Replace the first matching document.
    pub async fn replace_one<T: Serialize>(
        &self,
        ctx: &OpContext,
        filter: Document,
        replacement: &T,
    ) -> QueryResult<UpdateResult> {
        let model = WriteModel::ReplaceOne {
            filter,
            replacement: to_document(replacement)?,
            upsert: false,
        };
        Ok(Self::update_result(self.write(ctx, vec![model]).await?))
    }

    /// Delete the first matching document.
    pub async fn delete_one(&self, ctx: &OpContext, filter: Document) -> QueryResult<DeleteResult> {
        let result = self.write(ctx, vec![WriteModel::DeleteOne { filter }]).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    /// Delete every matching document.
    pub async fn delete_many(&self, ctx: &OpContext, filter: Document) -> QueryResult<DeleteResult> {
        let result = self.write(ctx, vec![WriteModel::DeleteMany { filter }]).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    /// Count matching documents.
    pub async fn count_documents(&self, ctx: &OpContext, filter: Document) -> QueryResult<u64> {
        self.find(ctx, filter).count().await
    }

    /// Drop the collection.
    pub async fn drop(&self, ctx: &OpContext) -> QueryResult<()> {
        self.execute(ctx, Request::Drop { ns: self.ns.clone() }).await?;
        Ok(())
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("ns", &self.ns).finish()
    }
}
