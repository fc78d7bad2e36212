//! The MongoDB [`DocumentStore`].

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Document, doc};
use docket_query::{
    BulkResult, CursorHandle, CursorRequest, DocumentStore, Modification, Namespace, OpContext,
    QueryError, QueryResult, Reply, Request, RequestOptions, ServerStatus, SessionHandle,
    StreamHandle, WatchRequest, WriteModel,
};
use mongodb::{Client, ClientSession, Collection};
use tracing::{debug, info, warn};

use crate::config::MongoConfig;
use crate::convert::{self, WriteRun};
use crate::cursor::{DriverCursor, DriverStream, MongoChangeStream, MongoCursor};
use crate::error::{MongoError, MongoResult, NAMESPACE_NOT_FOUND_SERVER_CODE, driver_error};
use crate::session::MongoSession;

/// Run a driver call inside the context's session when it is bound to one.
///
/// `$session` names the `&mut ClientSession` available to the first form.
macro_rules! in_session {
    ($ctx:expr, |$session:ident| $with:expr, $without:expr $(,)?) => {
        $ctx.run(async {
            match $ctx.session() {
                Some(handle) => {
                    let mut guard = MongoSession::from_handle(handle.as_ref())?.lock().await?;
                    let $session: &mut ClientSession = &mut guard;
                    $with.await.map_err(driver_error)
                }
                None => $without.await.map_err(driver_error),
            }
        })
    };
}

/// A document store backed by a MongoDB deployment.
///
/// The driver pools connections internally; cloning the store is cheap and
/// shares the pool.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    config: Arc<MongoConfig>,
}

impl MongoStore {
    /// Create a store from configuration.
    pub async fn new(config: MongoConfig) -> MongoResult<Self> {
        let options = config.to_client_options().await?;
        let client = Client::with_options(options)
            .map_err(|e| MongoError::connection(format!("failed to create client: {}", e)))?;

        info!(uri = %config.uri, "MongoDB store created");

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Create a store from a URI with default settings.
    pub async fn from_uri(uri: impl Into<String>) -> MongoResult<Self> {
        Self::new(MongoConfig::from_uri(uri)).await
    }

    /// Wrap an existing driver client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            config: Arc::new(MongoConfig::default()),
        }
    }

    /// Get the underlying MongoDB client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the configuration.
    pub fn config(&self) -> &MongoConfig {
        &self.config
    }

    fn collection(&self, ns: &Namespace) -> Collection<Document> {
        self.client.database(&ns.database).collection(&ns.collection)
    }

    /// Run an administrative command outside any session. Only commands the
    /// driver has no typed call for go through here.
    async fn admin_command(&self, ctx: &OpContext, cmd: Document) -> QueryResult<Document> {
        let db = self.client.database("admin");
        ctx.run(async { db.run_command(cmd, None).await.map_err(driver_error) })
            .await
    }

    /// The session a cursor opened under `ctx` iterates on, if any.
    fn cursor_session(ctx: &OpContext) -> QueryResult<Option<Arc<dyn SessionHandle>>> {
        match ctx.session() {
            Some(handle) => {
                MongoSession::from_handle(handle.as_ref())?;
                Ok(Some(handle.clone()))
            }
            None => Ok(None),
        }
    }

    async fn find_and_modify(
        &self,
        ctx: &OpContext,
        coll: &Collection<Document>,
        filter: Document,
        modification: Modification,
        options: &RequestOptions,
    ) -> QueryResult<Option<Document>> {
        match modification {
            Modification::Update(update) => {
                let opts = convert::find_one_and_update_options(options)?;
                in_session!(
                    ctx,
                    |s| coll.find_one_and_update_with_session(filter, update, opts, s),
                    coll.find_one_and_update(filter, update, opts),
                )
                .await
            }
            Modification::Replace(replacement) => {
                let opts = convert::find_one_and_replace_options(options)?;
                in_session!(
                    ctx,
                    |s| coll.find_one_and_replace_with_session(filter, &replacement, opts, s),
                    coll.find_one_and_replace(filter, &replacement, opts),
                )
                .await
            }
            Modification::Delete => {
                let opts = convert::find_one_and_delete_options(options)?;
                in_session!(
                    ctx,
                    |s| coll.find_one_and_delete_with_session(filter, opts, s),
                    coll.find_one_and_delete(filter, opts),
                )
                .await
            }
        }
    }

    async fn insert_run(
        &self,
        ctx: &OpContext,
        coll: &Collection<Document>,
        documents: Vec<Document>,
        options: &RequestOptions,
    ) -> QueryResult<BulkResult> {
        let opts = convert::insert_many_options(options);
        let reply = in_session!(
            ctx,
            |s| coll.insert_many_with_session(&documents, opts, s),
            coll.insert_many(&documents, opts),
        )
        .await?;

        let mut result = BulkResult::default();
        result.inserted_ids = reply.inserted_ids.into_iter().collect();
        result.inserted_count = result.inserted_ids.len() as u64;
        Ok(result)
    }

    async fn write_one(
        &self,
        ctx: &OpContext,
        coll: &Collection<Document>,
        model: WriteModel,
        options: &RequestOptions,
    ) -> QueryResult<BulkResult> {
        let mut result = BulkResult::default();
        let updated = match model {
            WriteModel::InsertOne { document } => {
                return self.insert_run(ctx, coll, vec![document], options).await;
            }
            WriteModel::UpdateOne { filter, update, upsert } => {
                let opts = convert::update_options(upsert, options);
                in_session!(
                    ctx,
                    |s| coll.update_one_with_session(filter, update, opts, s),
                    coll.update_one(filter, update, opts),
                )
                .await?
            }
            WriteModel::UpdateMany { filter, update, upsert } => {
                let opts = convert::update_options(upsert, options);
                in_session!(
                    ctx,
                    |s| coll.update_many_with_session(filter, update, opts, s),
                    coll.update_many(filter, update, opts),
                )
                .await?
            }
            WriteModel::ReplaceOne { filter, replacement, upsert } => {
                let opts = convert::replace_options(upsert, options);
                in_session!(
                    ctx,
                    |s| coll.replace_one_with_session(filter, &replacement, opts, s),
                    coll.replace_one(filter, &replacement, opts),
                )
                .await?
            }
            WriteModel::DeleteOne { filter } => {
                let deleted = in_session!(
                    ctx,
                    |s| coll.delete_one_with_session(filter, convert::delete_options(), s),
                    coll.delete_one(filter, convert::delete_options()),
                )
                .await?;
                result.deleted_count = deleted.deleted_count;
                return Ok(result);
            }
            WriteModel::DeleteMany { filter } => {
                let deleted = in_session!(
                    ctx,
                    |s| coll.delete_many_with_session(filter, convert::delete_options(), s),
                    coll.delete_many(filter, convert::delete_options()),
                )
                .await?;
                result.deleted_count = deleted.deleted_count;
                return Ok(result);
            }
        };

        result.matched_count = updated.matched_count;
        result.modified_count = updated.modified_count;
        if let Some(id) = updated.upserted_id {
            result.upserted_count = 1;
            result.upserted_ids.insert(0, id);
        }
        Ok(result)
    }

    /// Apply a bulk batch: runs of inserts as one `insert_many`, every
    /// other model on its own. Ordered batches stop at the first failure;
    /// unordered ones keep going and report the first failure at the end.
    async fn bulk_write(
        &self,
        ctx: &OpContext,
        coll: &Collection<Document>,
        models: Vec<WriteModel>,
        options: &RequestOptions,
    ) -> QueryResult<BulkResult> {
        let ordered = options.is_ordered();
        let mut result = BulkResult::default();
        let mut first_error: Option<QueryError> = None;

        for run in convert::write_runs(models) {
            let (offset, outcome) = match run {
                WriteRun::Insert { offset, documents } => {
                    (offset, self.insert_run(ctx, coll, documents, options).await)
                }
                WriteRun::Single { index, model } => {
                    (index, self.write_one(ctx, coll, model, options).await)
                }
            };
            match outcome {
                Ok(partial) => result.merge(partial, offset),
                Err(err) if ordered || err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(offset, error = %err, "unordered write failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    fn missing_namespace(err: &QueryError) -> bool {
        err.server_code == Some(NAMESPACE_NOT_FOUND_SERVER_CODE)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn execute(&self, ctx: &OpContext, request: Request) -> QueryResult<Reply> {
        let name = request.name();
        let coll = self.collection(request.namespace());
        debug!(command = name, ns = %request.namespace(), "executing request");

        match request {
            Request::FindOne { filter, options, .. } => {
                let opts = convert::find_one_options(&options)?;
                let found = in_session!(
                    ctx,
                    |s| coll.find_one_with_session(filter, opts, s),
                    coll.find_one(filter, opts),
                )
                .await?;
                Ok(Reply::Document(found))
            }
            Request::Count { filter, options, .. } => {
                let opts = convert::count_options(&options)?;
                let count = in_session!(
                    ctx,
                    |s| coll.count_documents_with_session(filter, opts, s),
                    coll.count_documents(filter, opts),
                )
                .await?;
                Ok(Reply::Count(count))
            }
            Request::Distinct { field, filter, options, .. } => {
                let opts = convert::distinct_options(&options)?;
                let values = in_session!(
                    ctx,
                    |s| coll.distinct_with_session(&field, filter, opts, s),
                    coll.distinct(&field, filter, opts),
                )
                .await?;
                Ok(Reply::Values(values))
            }
            Request::FindAndModify { filter, modification, options, .. } => {
                let found = self
                    .find_and_modify(ctx, &coll, filter, modification, &options)
                    .await?;
                Ok(Reply::Document(found))
            }
            Request::BulkWrite { models, options, .. } => {
                let result = self.bulk_write(ctx, &coll, models, &options).await?;
                Ok(Reply::Bulk(result))
            }
            Request::Drop { .. } => {
                match in_session!(ctx, |s| coll.drop_with_session(None, s), coll.drop(None)).await {
                    Ok(()) => Ok(Reply::Ack),
                    Err(err) if Self::missing_namespace(&err) => Ok(Reply::Ack),
                    Err(err) => Err(err),
                }
            }
            Request::CreateIndexes { indexes, .. } => {
                let models = convert::index_models(&indexes);
                let created = in_session!(
                    ctx,
                    |s| coll.create_indexes_with_session(models, None, s),
                    coll.create_indexes(models, None),
                )
                .await?;
                Ok(Reply::Names(created.index_names))
            }
            Request::DropIndexes { name, .. } if name == "*" => {
                in_session!(
                    ctx,
                    |s| coll.drop_indexes_with_session(None, s),
                    coll.drop_indexes(None),
                )
                .await?;
                Ok(Reply::Ack)
            }
            Request::DropIndexes { name, .. } => {
                in_session!(
                    ctx,
                    |s| coll.drop_index_with_session(&name, None, s),
                    coll.drop_index(&name, None),
                )
                .await?;
                Ok(Reply::Ack)
            }
            Request::ListIndexes { .. } => {
                match in_session!(
                    ctx,
                    |s| coll.list_index_names_with_session(s),
                    coll.list_index_names(),
                )
                .await
                {
                    Ok(names) => Ok(Reply::Names(names)),
                    Err(err) if Self::missing_namespace(&err) => Ok(Reply::Names(Vec::new())),
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn open_cursor(
        &self,
        ctx: &OpContext,
        request: CursorRequest,
    ) -> QueryResult<Box<dyn CursorHandle>> {
        let ns = request.namespace().clone();
        let coll = self.collection(&ns);
        let session = Self::cursor_session(ctx)?;

        let cursor = ctx
            .run(async {
                let cursor = match (request, session) {
                    (CursorRequest::Find { filter, options, .. }, Some(session)) => {
                        let opts = convert::find_options(&options)?;
                        let mut guard = MongoSession::from_handle(session.as_ref())?.lock().await?;
                        let cursor = coll
                            .find_with_session(filter, opts, &mut guard)
                            .await
                            .map_err(driver_error)?;
                        drop(guard);
                        DriverCursor::Explicit { cursor, session }
                    }
                    (CursorRequest::Find { filter, options, .. }, None) => {
                        let opts = convert::find_options(&options)?;
                        DriverCursor::Implicit(coll.find(filter, opts).await.map_err(driver_error)?)
                    }
                    (CursorRequest::Aggregate { pipeline, options, .. }, Some(session)) => {
                        let opts = convert::aggregate_options(&options)?;
                        let mut guard = MongoSession::from_handle(session.as_ref())?.lock().await?;
                        let cursor = coll
                            .aggregate_with_session(pipeline, opts, &mut guard)
                            .await
                            .map_err(driver_error)?;
                        drop(guard);
                        DriverCursor::Explicit { cursor, session }
                    }
                    (CursorRequest::Aggregate { pipeline, options, .. }, None) => {
                        let opts = convert::aggregate_options(&options)?;
                        DriverCursor::Implicit(
                            coll.aggregate(pipeline, opts).await.map_err(driver_error)?,
                        )
                    }
                };
                Ok(cursor)
            })
            .await?;
        debug!(ns = %ns, "cursor opened");

        Ok(Box::new(MongoCursor::new(cursor)))
    }

    async fn watch(
        &self,
        ctx: &OpContext,
        request: WatchRequest,
    ) -> QueryResult<Box<dyn StreamHandle>> {
        let WatchRequest { ns, pipeline, options } = request;
        let initial_token = options.start_after.clone().or_else(|| options.resume_after.clone());
        let opts = convert::change_stream_options(&options)?;
        let coll = self.collection(&ns);
        let session = Self::cursor_session(ctx)?;

        let stream = ctx
            .run(async {
                let stream = match session {
                    Some(session) => {
                        let mut guard = MongoSession::from_handle(session.as_ref())?.lock().await?;
                        let stream = coll
                            .watch_with_session(pipeline, opts, &mut guard)
                            .await
                            .map_err(driver_error)?
                            .with_type::<Document>();
                        drop(guard);
                        DriverStream::Explicit { stream, session }
                    }
                    None => DriverStream::Implicit(
                        coll.watch(pipeline, opts)
                            .await
                            .map_err(driver_error)?
                            .with_type::<Document>(),
                    ),
                };
                Ok(stream)
            })
            .await?;
        debug!(ns = %ns, "change stream opened");

        Ok(Box::new(MongoChangeStream::new(stream, initial_token)))
    }

    async fn start_session(&self, ctx: &OpContext) -> QueryResult<Arc<dyn SessionHandle>> {
        let session = ctx
            .run(async { self.client.start_session(None).await.map_err(driver_error) })
            .await?;
        let session = MongoSession::new(session);
        debug!(session = %session.id(), "session started");
        Ok(Arc::new(session))
    }

    async fn server_status(&self, ctx: &OpContext) -> QueryResult<ServerStatus> {
        let build_info = self.admin_command(ctx, doc! { "buildInfo": 1 }).await?;
        let hello = self.admin_command(ctx, doc! { "hello": 1 }).await?;
        let status = convert::server_status(&build_info, &hello)?;
        debug!(version = %status.version, topology = ?status.topology, "server status");
        Ok(status)
    }

    async fn ping(&self, ctx: &OpContext) -> QueryResult<()> {
        self.admin_command(ctx, doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn shutdown(&self, _ctx: &OpContext) -> QueryResult<()> {
        self.client.clone().shutdown().await;
        info!("MongoDB store shut down");
        Ok(())
    }
}
