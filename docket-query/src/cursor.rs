//! Sticky-error cursors.
//!
//! Opening a cursor can fail. Rather than making every caller check that
//! failure at the call site, a [`Cursor`] is always returned and holds
//! either a live store cursor or the error captured while opening it. In
//! the error state:
//!
//! - `next` and `try_next` return `false`
//! - `one` and `all` return the captured error
//! - `id` and `remaining_batch_length` return zero
//! - `close` returns the captured error
//! - `error` returns the captured error
//!
//! ```rust,ignore
//! let mut cursor = users.find(&ctx, doc! {}).sort(["_id"]).cursor().await;
//! while cursor.next(&ctx).await {
//!     let user: User = cursor.one()?;
//! }
//! if let Some(err) = cursor.error() {
//!     return Err(err.clone());
//! }
//! cursor.close(&ctx).await?;
//! ```

use std::fmt;

use bson::Document;
use futures::Stream;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::store::CursorHandle;

/// A store iterator that may have failed to open.
///
/// Shared by [`Cursor`] and [`crate::ChangeStream`].
pub(crate) struct Sticky<H: ?Sized + CursorHandle> {
    inner: Result<Box<H>, QueryError>,
    last_error: Option<QueryError>,
    closed: bool,
}

impl<H: ?Sized + CursorHandle> Sticky<H> {
    pub(crate) fn new(inner: Result<Box<H>, QueryError>) -> Self {
        Self {
            inner,
            last_error: None,
            closed: false,
        }
    }

    pub(crate) fn handle(&self) -> Option<&H> {
        self.inner.as_deref().ok()
    }

    pub(crate) fn id(&self) -> i64 {
        self.handle().map_or(0, |h| h.id())
    }

    pub(crate) fn remaining_batch_length(&self) -> usize {
        self.handle().map_or(0, |h| h.remaining_batch_length())
    }

    async fn step(&mut self, ctx: &OpContext, blocking: bool) -> bool {
        let handle = match self.inner.as_deref_mut() {
            Ok(handle) if !self.closed => handle,
            _ => return false,
        };
        let result = if blocking {
            ctx.run(handle.advance(ctx)).await
        } else {
            ctx.run(handle.try_advance(ctx)).await
        };
        match result {
            Ok(found) => found,
            Err(err) => {
                debug!(error = %err, "iteration failed");
                self.last_error = Some(err);
                false
            }
        }
    }

    pub(crate) async fn next(&mut self, ctx: &OpContext) -> bool {
        self.step(ctx, true).await
    }

    pub(crate) async fn try_next(&mut self, ctx: &OpContext) -> bool {
        self.step(ctx, false).await
    }

    pub(crate) fn current(&self) -> QueryResult<&Document> {
        match &self.inner {
            Err(err) => Err(err.clone()),
            Ok(handle) => handle
                .current()
                .ok_or_else(|| QueryError::usage("no current document; advance the iterator first")),
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self) -> QueryResult<T> {
        let doc = self.current()?;
        Ok(bson::from_document(doc.clone())?)
    }

    pub(crate) async fn drain<T: DeserializeOwned>(&mut self, ctx: &OpContext) -> QueryResult<Vec<T>> {
        if let Err(err) = &self.inner {
            return Err(err.clone());
        }
        let mut out = Vec::new();
        while self.next(ctx).await {
            out.push(self.decode::<T>()?);
        }
        if let Some(err) = self.last_error.take() {
            return Err(err);
        }
        self.close(ctx).await?;
        Ok(out)
    }

    pub(crate) async fn close(&mut self, ctx: &OpContext) -> QueryResult<()> {
        match self.inner.as_deref_mut() {
            Err(err) => Err(err.clone()),
            Ok(_) if self.closed => Ok(()),
            Ok(handle) => {
                self.closed = true;
                handle.close(ctx).await
            }
        }
    }

    pub(crate) fn error(&self) -> Option<&QueryError> {
        match &self.inner {
            Err(err) => Some(err),
            Ok(_) => self.last_error.as_ref(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A cursor over query or aggregation results.
pub struct Cursor {
    sticky: Sticky<dyn CursorHandle>,
}

impl Cursor {
    /// Wrap the outcome of opening a store cursor.
    pub fn new(opened: QueryResult<Box<dyn CursorHandle>>) -> Self {
        Self {
            sticky: Sticky::new(opened),
        }
    }

    /// A cursor that failed to open.
    pub fn failed(err: QueryError) -> Self {
        Self::new(Err(err))
    }

    /// Server cursor id; zero when exhausted or failed.
    pub fn id(&self) -> i64 {
        self.sticky.id()
    }

    /// Documents left in the local batch; zero when failed.
    pub fn remaining_batch_length(&self) -> usize {
        self.sticky.remaining_batch_length()
    }

    /// Advance to the next document, waiting for more batches as needed.
    /// Returns `false` when exhausted or on error; see [`Cursor::error`].
    pub async fn next(&mut self, ctx: &OpContext) -> bool {
        self.sticky.next(ctx).await
    }

    /// Advance with at most one round trip to the store.
    pub async fn try_next(&mut self, ctx: &OpContext) -> bool {
        self.sticky.try_next(ctx).await
    }

    /// Decode the current document.
    pub fn one<T: DeserializeOwned>(&self) -> QueryResult<T> {
        self.sticky.decode()
    }

    /// The current document, undecoded.
    pub fn current(&self) -> QueryResult<&Document> {
        self.sticky.current()
    }

    /// Decode every remaining document, then close the cursor.
    pub async fn all<T: DeserializeOwned>(&mut self, ctx: &OpContext) -> QueryResult<Vec<T>> {
        self.sticky.drain(ctx).await
    }

    /// Close the cursor. Closing twice is a no-op; a cursor that failed to
    /// open returns the captured error.
    pub async fn close(&mut self, ctx: &OpContext) -> QueryResult<()> {
        self.sticky.close(ctx).await
    }

    /// The error captured while opening, else the last iteration error.
    pub fn error(&self) -> Option<&QueryError> {
        self.sticky.error()
    }

    /// Turn the cursor into a stream of decoded documents. The stream ends
    /// with the iteration error, if any, and closes the cursor.
    pub fn into_stream<T>(self, ctx: OpContext) -> impl Stream<Item = QueryResult<T>> + Send
    where
        T: DeserializeOwned + Send + 'static,
    {
        futures::stream::unfold((self, ctx, false), |(mut cursor, ctx, done)| async move {
            if done {
                return None;
            }
            if cursor.next(&ctx).await {
                let item = cursor.one::<T>();
                return Some((item, (cursor, ctx, false)));
            }
            let tail = cursor.error().cloned();
            let _ = cursor.close(&ctx).await;
            tail.map(|err| (Err(err), (cursor, ctx, true)))
        })
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id())
            .field("closed", &self.sticky.is_closed())
            .field("error", &self.error())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use bson::doc;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::collections::VecDeque;

    /// Cursor over fixed documents that fails after `fail_after` advances.
    pub(crate) struct ScriptedCursor {
        docs: VecDeque<Document>,
        current: Option<Document>,
        fail_after: Option<usize>,
        advanced: usize,
        pub(crate) closes: usize,
    }

    impl ScriptedCursor {
        pub(crate) fn new(docs: Vec<Document>) -> Self {
            Self {
                docs: docs.into(),
                current: None,
                fail_after: None,
                advanced: 0,
                closes: 0,
            }
        }

        pub(crate) fn failing_after(mut self, n: usize) -> Self {
            self.fail_after = Some(n);
            self
        }
    }

    #[async_trait]
    impl CursorHandle for ScriptedCursor {
        fn id(&self) -> i64 {
            if self.docs.is_empty() { 0 } else { 77 }
        }

        fn current(&self) -> Option<&Document> {
            self.current.as_ref()
        }

        fn remaining_batch_length(&self) -> usize {
            self.docs.len()
        }

        async fn advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
            if Some(self.advanced) == self.fail_after {
                return Err(QueryError::connection("stream reset"));
            }
            self.advanced += 1;
            self.current = self.docs.pop_front();
            Ok(self.current.is_some())
        }

        async fn try_advance(&mut self, ctx: &OpContext) -> QueryResult<bool> {
            self.advance(ctx).await
        }

        async fn close(&mut self, _ctx: &OpContext) -> QueryResult<()> {
            self.closes += 1;
            Ok(())
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        #[serde(rename = "_id")]
        id: i32,
    }

    fn docs() -> Vec<Document> {
        vec![doc! { "_id": 1 }, doc! { "_id": 2 }, doc! { "_id": 3 }]
    }

    #[tokio::test]
    async fn test_failed_cursor_is_sticky() {
        let ctx = OpContext::background();
        let mut cursor = Cursor::failed(QueryError::invalid_filter("unknown operator $bogus"));

        assert!(!cursor.next(&ctx).await);
        assert!(!cursor.try_next(&ctx).await);
        assert_eq!(cursor.id(), 0);
        assert_eq!(cursor.remaining_batch_length(), 0);
        assert_eq!(cursor.one::<Item>().unwrap_err().code, crate::ErrorCode::InvalidFilter);
        assert_eq!(cursor.all::<Item>(&ctx).await.unwrap_err().code, crate::ErrorCode::InvalidFilter);
        assert_eq!(cursor.close(&ctx).await.unwrap_err().code, crate::ErrorCode::InvalidFilter);
        assert_eq!(cursor.close(&ctx).await.unwrap_err().code, crate::ErrorCode::InvalidFilter);
        assert_eq!(cursor.error().map(|e| e.code), Some(crate::ErrorCode::InvalidFilter));
    }

    #[tokio::test]
    async fn test_iterate_and_decode() {
        let ctx = OpContext::background();
        let mut cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()))));
        assert_eq!(cursor.id(), 77);
        assert_eq!(cursor.remaining_batch_length(), 3);

        let mut seen = Vec::new();
        while cursor.next(&ctx).await {
            seen.push(cursor.one::<Item>().unwrap().id);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(cursor.error().is_none());
        cursor.close(&ctx).await.unwrap();
        cursor.close(&ctx).await.unwrap();
        assert!(!cursor.next(&ctx).await);
    }

    #[tokio::test]
    async fn test_one_before_next_is_usage_error() {
        let cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()))));
        assert!(cursor.one::<Item>().unwrap_err().is_usage());
    }

    #[tokio::test]
    async fn test_iteration_error_is_reported() {
        let ctx = OpContext::background();
        let mut cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()).failing_after(1))));
        assert!(cursor.next(&ctx).await);
        assert!(!cursor.next(&ctx).await);
        assert!(cursor.error().unwrap().is_connection_error());
        // The cursor opened fine, so close still succeeds.
        cursor.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_collects_and_closes() {
        let ctx = OpContext::background();
        let mut cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()))));
        let items: Vec<Item> = cursor.all(&ctx).await.unwrap();
        assert_eq!(items, vec![Item { id: 1 }, Item { id: 2 }, Item { id: 3 }]);
        assert!(!cursor.next(&ctx).await);
    }

    #[tokio::test]
    async fn test_decode_error_surfaces_as_is() {
        let ctx = OpContext::background();
        let mut cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(vec![doc! { "_id": "text" }]))));
        assert!(cursor.next(&ctx).await);
        assert!(cursor.one::<Item>().unwrap_err().is_decode());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_iteration() {
        let (ctx, token) = OpContext::background().with_cancel();
        let mut cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()))));
        token.cancel();
        assert!(!cursor.next(&ctx).await);
        assert!(cursor.error().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let cursor = Cursor::new(Ok(Box::new(ScriptedCursor::new(docs()))));
        let ids: Vec<i32> = cursor
            .into_stream::<Item>(OpContext::background())
            .map(|item| item.unwrap().id)
            .collect()
            .await;
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_into_stream_ends_with_error() {
        let cursor = Cursor::failed(QueryError::no_documents());
        let items: Vec<QueryResult<Item>> = cursor
            .into_stream(OpContext::background())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_no_documents());
    }
}
