//! Change streams.
//!
//! [`ChangeStream`] follows the same sticky-error rules as
//! [`crate::Cursor`]: a stream that failed to open reports that failure
//! from every accessor. It adds the resume token of the last observed
//! event.

use std::fmt;

use bson::{Document, Timestamp};
use futures::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::context::OpContext;
use crate::cursor::Sticky;
use crate::error::{QueryError, QueryResult};
use crate::store::StreamHandle;

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    /// A document was inserted.
    Insert,
    /// A document was updated.
    Update,
    /// A document was replaced.
    Replace,
    /// A document was deleted.
    Delete,
    /// The collection was dropped.
    Drop,
    /// The collection was renamed.
    Rename,
    /// The database was dropped.
    DropDatabase,
    /// The stream can no longer continue.
    Invalidate,
    /// Any other event kind.
    #[serde(other)]
    Other,
}

/// Namespace of a change event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeNamespace {
    /// Database name.
    pub db: String,
    /// Collection name.
    pub coll: Option<String>,
}

/// Fields changed by an update event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    /// Fields set, with their new values.
    pub updated_fields: Document,
    /// Fields removed.
    pub removed_fields: Vec<String>,
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T = Document> {
    /// Resume token of this event.
    #[serde(rename = "_id")]
    pub id: Document,
    /// Kind of change.
    pub operation_type: OperationType,
    /// Namespace the change happened in.
    pub ns: Option<ChangeNamespace>,
    /// `_id` (and shard key) of the changed document.
    pub document_key: Option<Document>,
    /// The full document, when the event carries it.
    pub full_document: Option<T>,
    /// What an update changed.
    pub update_description: Option<UpdateDescription>,
    /// Cluster time of the change.
    pub cluster_time: Option<Timestamp>,
}

/// A stream of change events.
pub struct ChangeStream {
    sticky: Sticky<dyn StreamHandle>,
}

impl ChangeStream {
    /// Wrap the outcome of opening a store change stream.
    pub fn new(opened: QueryResult<Box<dyn StreamHandle>>) -> Self {
        Self {
            sticky: Sticky::new(opened),
        }
    }

    /// A stream that failed to open.
    pub fn failed(err: QueryError) -> Self {
        Self::new(Err(err))
    }

    /// Server cursor id; zero when failed.
    pub fn id(&self) -> i64 {
        self.sticky.id()
    }

    /// Token to resume after the last observed event; `None` when failed
    /// or when nothing was observed yet.
    pub fn resume_token(&self) -> Option<Document> {
        self.sticky.handle().and_then(|h| h.resume_token())
    }

    /// Wait for the next event. Returns `false` on error; see
    /// [`ChangeStream::error`].
    pub async fn next(&mut self, ctx: &OpContext) -> bool {
        self.sticky.next(ctx).await
    }

    /// Check for an event with at most one round trip.
    pub async fn try_next(&mut self, ctx: &OpContext) -> bool {
        self.sticky.try_next(ctx).await
    }

    /// Decode the current event document.
    pub fn one<T: DeserializeOwned>(&self) -> QueryResult<T> {
        self.sticky.decode()
    }

    /// Decode the current event as a [`ChangeEvent`].
    pub fn event<T: DeserializeOwned>(&self) -> QueryResult<ChangeEvent<T>> {
        self.sticky.decode()
    }

    /// The current event document, undecoded.
    pub fn current(&self) -> QueryResult<&Document> {
        self.sticky.current()
    }

    /// Close the stream. Closing twice is a no-op; a stream that failed to
    /// open returns the captured error.
    pub async fn close(&mut self, ctx: &OpContext) -> QueryResult<()> {
        self.sticky.close(ctx).await
    }

    /// The error captured while opening, else the last iteration error.
    pub fn error(&self) -> Option<&QueryError> {
        self.sticky.error()
    }

    /// Turn the stream into a `futures` stream of decoded events.
    pub fn into_stream<T>(self, ctx: OpContext) -> impl Stream<Item = QueryResult<ChangeEvent<T>>> + Send
    where
        T: DeserializeOwned + Send + 'static,
    {
        futures::stream::unfold((self, ctx, false), |(mut stream, ctx, done)| async move {
            if done {
                return None;
            }
            if stream.next(&ctx).await {
                let item = stream.event::<T>();
                return Some((item, (stream, ctx, false)));
            }
            let tail = stream.error().cloned();
            let _ = stream.close(&ctx).await;
            tail.map(|err| (Err(err), (stream, ctx, true)))
        })
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("id", &self.id())
            .field("resume_token", &self.resume_token())
            .field("error", &self.error())
            .finish()
    }
}
