//! A store that records requests, for builder tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capability::ServerInfo;
use crate::client::Client;
use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::memory::BufferedCursor;
use crate::store::{
    BulkResult, CursorHandle, CursorRequest, DocumentStore, Reply, Request, ServerStatus,
    SessionHandle, StreamHandle, TopologyKind, WatchRequest,
};

/// Records every request and answers with empty replies.
#[derive(Default)]
pub(crate) struct RecordingStore {
    requests: Mutex<Vec<Request>>,
    cursor_requests: Mutex<Vec<CursorRequest>>,
    watch_requests: Mutex<Vec<WatchRequest>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn last_request(&self) -> Option<Request> {
        self.requests.lock().last().cloned()
    }

    pub(crate) fn last_cursor_request(&self) -> Option<CursorRequest> {
        self.cursor_requests.lock().last().cloned()
    }

    pub(crate) fn last_watch_request(&self) -> Option<WatchRequest> {
        self.watch_requests.lock().last().cloned()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn execute(&self, _ctx: &OpContext, request: Request) -> QueryResult<Reply> {
        let reply = match &request {
            Request::FindOne { .. } | Request::FindAndModify { .. } => Reply::Document(None),
            Request::Count { .. } => Reply::Count(0),
            Request::Distinct { .. } => Reply::Values(Vec::new()),
            Request::BulkWrite { .. } => Reply::Bulk(BulkResult::default()),
            Request::CreateIndexes { indexes, .. } => {
                Reply::Names(indexes.iter().map(|index| index.name()).collect())
            }
            Request::ListIndexes { .. } => Reply::Names(vec!["_id_".to_string()]),
            Request::Drop { .. } | Request::DropIndexes { .. } => Reply::Ack,
        };
        self.requests.lock().push(request);
        Ok(reply)
    }

    async fn open_cursor(
        &self,
        _ctx: &OpContext,
        request: CursorRequest,
    ) -> QueryResult<Box<dyn CursorHandle>> {
        self.cursor_requests.lock().push(request);
        Ok(Box::new(BufferedCursor::new(Vec::new(), None)))
    }

    async fn watch(&self, _ctx: &OpContext, request: WatchRequest) -> QueryResult<Box<dyn StreamHandle>> {
        self.watch_requests.lock().push(request);
        Err(QueryError::unsupported("recording store has no change streams"))
    }

    async fn start_session(&self, _ctx: &OpContext) -> QueryResult<Arc<dyn SessionHandle>> {
        Err(QueryError::unsupported("recording store has no sessions"))
    }

    async fn server_status(&self, _ctx: &OpContext) -> QueryResult<ServerStatus> {
        Ok(ServerStatus {
            version: "7.0.0".to_string(),
            topology: TopologyKind::ReplicaSet,
        })
    }
}

/// A client over `store` that allows transactions, without probing.
pub(crate) fn client_for(store: Arc<RecordingStore>) -> Client {
    Client::with_server_info(
        store,
        ServerInfo {
            version: "7.0.0".to_string(),
            topology: TopologyKind::ReplicaSet,
            transactions_allowed: true,
        },
    )
}
