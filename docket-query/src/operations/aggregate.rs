//! Aggregation pipeline operation.

use std::time::Duration;

use bson::Document;
use serde::de::DeserializeOwned;

use crate::client::Collection;
use crate::context::OpContext;
use crate::cursor::Cursor;
use crate::error::{QueryError, QueryResult};
use crate::options::{Collation, Hint, OptionSet, RequestOptions, RequestShape};
use crate::store::CursorRequest;

/// An aggregation over one collection.
///
/// ```rust,ignore
/// let totals: Vec<Total> = orders
///     .aggregate(&ctx, vec![
///         doc! { "$match": { "status": "paid" } },
///         doc! { "$sort": { "amount": -1 } },
///     ])
///     .allow_disk_use(true)
///     .all()
///     .await?;
/// ```
pub struct Aggregate {
    collection: Collection,
    ctx: OpContext,
    pipeline: Vec<Document>,
    options: OptionSet,
}

impl Aggregate {
    pub(crate) fn new(collection: Collection, ctx: OpContext, pipeline: Vec<Document>) -> Self {
        Self {
            collection,
            ctx,
            pipeline,
            options: OptionSet::new(),
        }
    }

    /// Allow stages to spill to disk.
    pub fn allow_disk_use(mut self, allow: bool) -> Self {
        self.options.allow_disk_use = Some(allow);
        self
    }

    /// Documents per batch.
    pub fn batch_size(mut self, n: u32) -> Self {
        self.options.batch_size = Some(n);
        self
    }

    /// Skip validation in `$out` and `$merge` stages.
    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.options.bypass_document_validation = Some(bypass);
        self
    }

    /// String comparison rules.
    pub fn collation(mut self, collation: Collation) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Comment attached to the command.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.options.comment = Some(comment.into());
        self
    }

    /// Index to use.
    pub fn hint(mut self, hint: impl Into<Hint>) -> Self {
        self.options.hint = Some(hint.into());
        self
    }

    /// Maximum wait for new data on tailable cursors.
    pub fn max_await_time(mut self, wait: Duration) -> Self {
        self.options.max_await_time = Some(wait);
        self
    }

    /// Server-side time limit.
    pub fn max_time(mut self, limit: Duration) -> Self {
        self.options.max_time = Some(limit);
        self
    }

    /// The compiled options this aggregation would send.
    pub fn compile(&self) -> RequestOptions {
        self.options.compile(RequestShape::Aggregate)
    }

    /// Decode the first result. Fails with a no-documents error when the
    /// pipeline yields nothing.
    pub async fn one<T: DeserializeOwned>(self) -> QueryResult<T> {
        let ctx = self.ctx.clone();
        let mut cursor = self.cursor().await;
        let result = if cursor.next(&ctx).await {
            cursor.one::<T>()
        } else {
            Err(cursor.error().cloned().unwrap_or_else(QueryError::no_documents))
        };
        let _ = cursor.close(&ctx).await;
        result
    }

    /// Decode every result.
    pub async fn all<T: DeserializeOwned>(self) -> QueryResult<Vec<T>> {
        let ctx = self.ctx.clone();
        let mut cursor = self.cursor().await;
        let result = cursor.all(&ctx).await;
        if result.is_err() {
            let _ = cursor.close(&ctx).await;
        }
        result
    }

    /// Open a cursor over the results. Opening errors are captured in the
    /// cursor.
    pub async fn cursor(self) -> Cursor {
        let request = CursorRequest::Aggregate {
            ns: self.collection.namespace().clone(),
            pipeline: self.pipeline,
            options: self.options.compile(RequestShape::Aggregate),
        };
        self.collection.open_cursor(&self.ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingStore, client_for};
    use bson::doc;

    #[tokio::test]
    async fn test_one_on_empty_result() {
        let client = client_for(RecordingStore::new());
        let ctx = OpContext::background();
        let err = client
            .database("app")
            .collection("orders")
            .aggregate(&ctx, vec![doc! { "$match": { "status": "paid" } }])
            .one::<Document>()
            .await
            .unwrap_err();
        assert!(err.is_no_documents());
    }

    #[tokio::test]
    async fn test_options_reach_request() {
        let store = RecordingStore::new();
        let client = client_for(store.clone());
        let ctx = OpContext::background();
        let _ = client
            .database("app")
            .collection("orders")
            .aggregate(&ctx, vec![doc! { "$limit": 1 }])
            .allow_disk_use(true)
            .max_time(Duration::from_secs(2))
            .cursor()
            .await;

        match store.last_cursor_request().unwrap() {
            CursorRequest::Aggregate { pipeline, options, .. } => {
                assert_eq!(pipeline, vec![doc! { "$limit": 1 }]);
                assert_eq!(options.allow_disk_use, Some(true));
                assert_eq!(options.max_time_ms(), Some(2000));
                assert_eq!(options.sort, None);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
