//! Change stream requests.

use std::time::Duration;

use bson::{Document, Timestamp};

use crate::client::Collection;
use crate::context::OpContext;
use crate::options::{Collation, FullDocument, OptionSet, RequestShape};
use crate::store::WatchRequest;
use crate::stream::ChangeStream;

/// A change stream on one collection.
///
/// ```rust,ignore
/// let mut stream = users
///     .watch(&ctx)
///     .pipeline(vec![doc! { "$match": { "operationType": "insert" } }])
///     .full_document(FullDocument::UpdateLookup)
///     .stream()
///     .await;
/// while stream.next(&ctx).await {
///     let event: ChangeEvent<User> = stream.event()?;
/// }
/// ```
pub struct Watch {
    collection: Collection,
    ctx: OpContext,
    pipeline: Vec<Document>,
    options: OptionSet,
}

impl Watch {
    pub(crate) fn new(collection: Collection, ctx: OpContext) -> Self {
        Self {
            collection,
            ctx,
            pipeline: Vec::new(),
            options: OptionSet::new(),
        }
    }

    /// Stages applied to change events.
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Events per batch.
    pub fn batch_size(mut self, n: u32) -> Self {
        self.options.batch_size = Some(n);
        self
    }

    /// String comparison rules.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// How update events carry the full document.
    pub fn full_document(mut self, mode: FullDocument) -> Self {
        self.options.full_document = Some(mode);
        self
    }

    /// Maximum wait for new events per round trip.
    pub fn max_await_time(mut self, wait: Duration) -> Self {
        self.options.max_await_time = Some(wait);
        self
    }

    /// Resume after the event with this token.
    pub fn resume_after(mut self, token: Document) -> Self {
        self.options.resume_after = Some(token);
        self
    }

    /// Start after the event with this token.
    pub fn start_after(mut self, token: Document) -> Self {
        self.options.start_after = Some(token);
        self
    }

    /// Start at this cluster time.
    pub fn start_at_operation_time(mut self, time: Timestamp) -> Self {
        self.options.start_at_operation_time = Some(time);
        self
    }

    /// Open the stream. Opening errors are captured in the stream.
    pub async fn stream(self) -> ChangeStream {
        let request = WatchRequest {
            ns: self.collection.namespace().clone(),
            pipeline: self.pipeline,
            options: self.options.compile(RequestShape::Watch),
        };
        self.collection.open_stream(&self.ctx, request).await
    }
}
