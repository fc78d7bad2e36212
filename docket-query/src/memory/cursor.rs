//! Cursors over in-memory results and change events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bson::Document;

use super::events::{EventLog, resume_token};
use super::matcher::matches;
use crate::context::OpContext;
use crate::error::QueryResult;
use crate::options::FullDocument;
use crate::store::{CursorHandle, Namespace, StreamHandle};

static NEXT_CURSOR_ID: AtomicI64 = AtomicI64::new(1);

fn next_cursor_id() -> i64 {
    NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// A cursor over precomputed results, handed out in batches.
pub struct BufferedCursor {
    id: i64,
    pending: VecDeque<Document>,
    batch: VecDeque<Document>,
    batch_size: usize,
    current: Option<Document>,
}

impl BufferedCursor {
    /// A cursor over `docs`, with the first batch already fetched.
    /// `batch_size` of `None` or zero means one batch.
    pub fn new(docs: Vec<Document>, batch_size: Option<u32>) -> Self {
        let batch_size = batch_size
            .filter(|n| *n > 0)
            .map_or(usize::MAX, |n| n as usize);
        let mut cursor = Self {
            id: next_cursor_id(),
            pending: docs.into(),
            batch: VecDeque::new(),
            batch_size,
            current: None,
        };
        cursor.fetch();
        cursor
    }

    fn fetch(&mut self) {
        let n = self.batch_size.min(self.pending.len());
        self.batch.extend(self.pending.drain(..n));
        if self.pending.is_empty() {
            self.id = 0;
        }
    }
}

#[async_trait]
impl CursorHandle for BufferedCursor {
    fn id(&self) -> i64 {
        self.id
    }

    fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    fn remaining_batch_length(&self) -> usize {
        self.batch.len()
    }

    async fn advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        if self.batch.is_empty() {
            self.fetch();
        }
        self.current = self.batch.pop_front();
        Ok(self.current.is_some())
    }

    async fn try_advance(&mut self, ctx: &OpContext) -> QueryResult<bool> {
        self.advance(ctx).await
    }

    async fn close(&mut self, _ctx: &OpContext) -> QueryResult<()> {
        self.pending.clear();
        self.batch.clear();
        self.id = 0;
        Ok(())
    }
}

/// A change stream over the store's event log.
pub(crate) struct MemoryStream {
    id: i64,
    events: Arc<EventLog>,
    ns: Namespace,
    filters: Vec<Document>,
    mode: FullDocument,
    position: u64,
    current: Option<Document>,
    closed: bool,
}

impl MemoryStream {
    pub(crate) fn new(
        events: Arc<EventLog>,
        ns: Namespace,
        filters: Vec<Document>,
        mode: FullDocument,
        position: u64,
    ) -> Self {
        Self {
            id: next_cursor_id(),
            events,
            ns,
            filters,
            mode,
            position,
            current: None,
            closed: false,
        }
    }

    fn poll(&mut self) -> QueryResult<bool> {
        while let Some((seq, event)) = self.events.next_from(self.position, &self.ns, self.mode)? {
            self.position = seq + 1;
            let mut keep = true;
            for filter in &self.filters {
                if !matches(&event, filter)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.current = Some(event);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl CursorHandle for MemoryStream {
    fn id(&self) -> i64 {
        if self.closed { 0 } else { self.id }
    }

    fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    fn remaining_batch_length(&self) -> usize {
        0
    }

    async fn advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        loop {
            if self.closed {
                return Ok(false);
            }
            let events = Arc::clone(&self.events);
            let notified = events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.poll()? {
                return Ok(true);
            }
            notified.await;
        }
    }

    async fn try_advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        if self.closed {
            return Ok(false);
        }
        self.poll()
    }

    async fn close(&mut self, _ctx: &OpContext) -> QueryResult<()> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

impl StreamHandle for MemoryStream {
    fn resume_token(&self) -> Option<Document> {
        Some(resume_token(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::events::Change;
    use bson::{Bson, doc};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_batches() {
        let ctx = OpContext::background();
        let docs = (0..5).map(|i| doc! { "_id": i }).collect();
        let mut cursor = BufferedCursor::new(docs, Some(2));
        assert_ne!(cursor.id(), 0);
        assert_eq!(cursor.remaining_batch_length(), 2);

        let mut seen = Vec::new();
        while cursor.advance(&ctx).await.unwrap() {
            seen.push(cursor.current().unwrap().get_i32("_id").unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(cursor.id(), 0);
        assert!(cursor.current().is_none());
    }

    #[tokio::test]
    async fn test_single_batch_has_zero_id() {
        let cursor = BufferedCursor::new(vec![doc! { "_id": 1 }], None);
        assert_eq!(cursor.id(), 0);
        assert_eq!(cursor.remaining_batch_length(), 1);
    }

    #[tokio::test]
    async fn test_stream_wakes_on_publish() {
        let ctx = OpContext::background();
        let log = Arc::new(EventLog::new(16));
        let ns = Namespace::new("app", "users");
        let mut stream = MemoryStream::new(log.clone(), ns.clone(), Vec::new(), FullDocument::Default, log.head());
        assert!(!stream.try_advance(&ctx).await.unwrap());

        let publisher = {
            let log = log.clone();
            let ns = ns.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                log.publish(vec![(ns, Change::insert(Bson::Int32(1), doc! { "_id": 1 }))]);
            })
        };
        assert!(stream.advance(&ctx).await.unwrap());
        publisher.await.unwrap();

        let event = stream.current().unwrap();
        assert_eq!(event.get_str("operationType").unwrap(), "insert");
        assert_eq!(stream.resume_token(), Some(resume_token(1)));
    }

    #[tokio::test]
    async fn test_stream_filters() {
        let ctx = OpContext::background();
        let log = Arc::new(EventLog::new(16));
        let ns = Namespace::new("app", "users");
        log.publish(vec![
            (ns.clone(), Change::insert(Bson::Int32(1), doc! { "_id": 1 })),
            (ns.clone(), Change::delete(Bson::Int32(1))),
        ]);
        let filters = vec![doc! { "operationType": "delete" }];
        let mut stream = MemoryStream::new(log, ns, filters, FullDocument::Default, 0);
        assert!(stream.try_advance(&ctx).await.unwrap());
        assert_eq!(stream.current().unwrap().get_str("operationType").unwrap(), "delete");
        assert!(!stream.try_advance(&ctx).await.unwrap());
    }
}
