//! The change-event log behind in-memory change streams.
//!
//! Every committed write appends one event per changed document. Events
//! carry a sequence number; a resume token encodes the sequence number of
//! the next event a stream should deliver.

use std::collections::VecDeque;

use bson::{Bson, Document, Timestamp, doc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::error::{QueryError, QueryResult};
use crate::options::FullDocument;
use crate::store::Namespace;

const CHANGE_STREAM_HISTORY_LOST: i32 = 286;
const INVALID_RESUME_TOKEN: i32 = 260;

/// One change to one document, before it is sequenced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    operation: &'static str,
    document_key: Option<Bson>,
    full_document: Option<Document>,
    post_image: Option<Document>,
    update_description: Option<Document>,
}

impl Change {
    pub(crate) fn insert(id: Bson, doc: Document) -> Self {
        Self {
            operation: "insert",
            document_key: Some(id),
            full_document: Some(doc),
            post_image: None,
            update_description: None,
        }
    }

    pub(crate) fn replace(id: Bson, doc: Document) -> Self {
        Self {
            operation: "replace",
            ..Self::insert(id, doc)
        }
    }

    pub(crate) fn update(id: Bson, before: &Document, after: Document) -> Self {
        let mut updated = Document::new();
        for (key, value) in &after {
            if before.get(key) != Some(value) {
                updated.insert(key.clone(), value.clone());
            }
        }
        let removed: Vec<Bson> = before
            .keys()
            .filter(|key| !after.contains_key(key.as_str()))
            .map(|key| Bson::String(key.clone()))
            .collect();
        Self {
            operation: "update",
            document_key: Some(id),
            full_document: None,
            post_image: Some(after),
            update_description: Some(doc! { "updatedFields": updated, "removedFields": removed }),
        }
    }

    pub(crate) fn delete(id: Bson) -> Self {
        Self {
            operation: "delete",
            document_key: Some(id),
            full_document: None,
            post_image: None,
            update_description: None,
        }
    }

    pub(crate) fn dropped() -> Self {
        Self {
            operation: "drop",
            document_key: None,
            full_document: None,
            post_image: None,
            update_description: None,
        }
    }
}

struct Stored {
    seq: u64,
    time: u32,
    ns: Namespace,
    change: Change,
}

impl Stored {
    fn cluster_time(&self) -> Timestamp {
        Timestamp {
            time: self.time,
            increment: self.seq as u32,
        }
    }

    fn to_event(&self, mode: FullDocument) -> Document {
        let mut event = doc! {
            "_id": resume_token(self.seq + 1),
            "operationType": self.change.operation,
            "clusterTime": self.cluster_time(),
            "ns": { "db": self.ns.database.as_str(), "coll": self.ns.collection.as_str() },
        };
        if let Some(key) = &self.change.document_key {
            event.insert("documentKey", doc! { "_id": key.clone() });
        }
        if let Some(full) = &self.change.full_document {
            event.insert("fullDocument", full.clone());
        } else if let (Some(post), false) = (&self.change.post_image, mode == FullDocument::Default) {
            event.insert("fullDocument", post.clone());
        }
        if let Some(description) = &self.change.update_description {
            event.insert("updateDescription", description.clone());
        }
        event
    }
}

struct LogInner {
    events: VecDeque<Stored>,
    next_seq: u64,
    capacity: usize,
}

/// A bounded, sequenced log of committed changes.
pub(crate) struct EventLog {
    inner: Mutex<LogInner>,
    notify: Notify,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                events: VecDeque::new(),
                next_seq: 0,
                capacity: capacity.max(1),
            }),
            notify: Notify::new(),
        }
    }

    /// Append committed changes and wake waiting streams.
    pub(crate) fn publish(&self, changes: Vec<(Namespace, Change)>) {
        if changes.is_empty() {
            return;
        }
        let time = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        {
            let mut inner = self.inner.lock();
            for (ns, change) in changes {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.events.push_back(Stored { seq, time, ns, change });
            }
            while inner.events.len() > inner.capacity {
                inner.events.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    /// Sequence number the next published event will get.
    pub(crate) fn head(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// First position whose cluster time is at or after `at`.
    pub(crate) fn position_at(&self, at: Timestamp) -> u64 {
        let inner = self.inner.lock();
        inner
            .events
            .iter()
            .find(|e| (e.time, e.seq as u32) >= (at.time, at.increment))
            .map_or(inner.next_seq, |e| e.seq)
    }

    /// The first event in `ns` at or after `position`, with its sequence
    /// number.
    pub(crate) fn next_from(
        &self,
        position: u64,
        ns: &Namespace,
        mode: FullDocument,
    ) -> QueryResult<Option<(u64, Document)>> {
        let inner = self.inner.lock();
        if let Some(oldest) = inner.events.front() {
            if position < oldest.seq {
                return Err(QueryError::command(
                    CHANGE_STREAM_HISTORY_LOST,
                    "resume point is no longer in the change history",
                ));
            }
        }
        Ok(inner
            .events
            .iter()
            .find(|e| e.seq >= position && &e.ns == ns)
            .map(|e| (e.seq, e.to_event(mode))))
    }

    /// A future completing at the next publish.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// The token of a stream position.
pub(crate) fn resume_token(position: u64) -> Document {
    doc! { "_data": format!("{:016X}", position) }
}

/// The stream position a token encodes.
pub(crate) fn parse_resume_token(token: &Document) -> QueryResult<u64> {
    token
        .get_str("_data")
        .ok()
        .and_then(|data| u64::from_str_radix(data, 16).ok())
        .ok_or_else(|| QueryError::command(INVALID_RESUME_TOKEN, format!("invalid resume token {}", token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ns() -> Namespace {
        Namespace::new("app", "users")
    }

    #[test]
    fn test_resume_token_round_trip() {
        assert_eq!(parse_resume_token(&resume_token(42)).unwrap(), 42);
        assert!(parse_resume_token(&doc! { "_data": "zz" }).is_err());
    }

    #[test]
    fn test_update_description() {
        let change = Change::update(Bson::Int32(1), &doc! { "_id": 1, "a": 1, "b": 2 }, doc! { "_id": 1, "a": 5 });
        assert_eq!(
            change.update_description,
            Some(doc! { "updatedFields": { "a": 5 }, "removedFields": ["b"] })
        );
    }

    #[test]
    fn test_next_from_filters_namespace_and_mode() {
        let log = EventLog::new(10);
        log.publish(vec![
            (Namespace::new("app", "other"), Change::delete(Bson::Int32(9))),
            (ns(), Change::update(Bson::Int32(1), &doc! { "_id": 1 }, doc! { "_id": 1, "a": 1 })),
        ]);
        let (seq, event) = log.next_from(0, &ns(), FullDocument::Default).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(event.get_str("operationType").unwrap(), "update");
        assert!(event.get("fullDocument").is_none());
        assert_eq!(event.get_document("_id").unwrap(), &resume_token(2));

        let (_, event) = log.next_from(0, &ns(), FullDocument::UpdateLookup).unwrap().unwrap();
        assert_eq!(event.get_document("fullDocument").unwrap(), &doc! { "_id": 1, "a": 1 });
        assert!(log.next_from(2, &ns(), FullDocument::Default).unwrap().is_none());
    }

    #[test]
    fn test_evicted_history_is_an_error() {
        let log = EventLog::new(1);
        log.publish(vec![(ns(), Change::dropped()), (ns(), Change::dropped())]);
        assert_eq!(log.head(), 2);
        let err = log.next_from(0, &ns(), FullDocument::Default).unwrap_err();
        assert_eq!(err.server_code, Some(CHANGE_STREAM_HISTORY_LOST));
    }
}
