//! Driver cursors and change streams behind the docket cursor traits.
//!
//! A cursor opened inside a session keeps a handle on that session and
//! iterates on it; the server rejects a `getMore` from a different session.
//! The driver keeps cursor ids private, so [`CursorHandle::id`] reports
//! [`OPEN_CURSOR_ID`] while results may remain and zero afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;
use docket_query::{CursorHandle, OpContext, QueryResult, SessionHandle, StreamHandle};
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::session::SessionChangeStream;
use mongodb::{Cursor, SessionCursor};
use tracing::debug;

use crate::convert;
use crate::error::driver_error;
use crate::session::MongoSession;

/// Id reported by a cursor the driver still holds open.
pub const OPEN_CURSOR_ID: i64 = -1;

/// A driver cursor, with the session it iterates on when it has one.
pub(crate) enum DriverCursor {
    Implicit(Cursor<Document>),
    Explicit {
        cursor: SessionCursor<Document>,
        session: Arc<dyn SessionHandle>,
    },
}

impl DriverCursor {
    async fn advance(&mut self) -> QueryResult<bool> {
        match self {
            Self::Implicit(cursor) => cursor.advance().await.map_err(driver_error),
            Self::Explicit { cursor, session } => {
                let mut guard = MongoSession::from_handle(session.as_ref())?.lock().await?;
                cursor.advance(&mut guard).await.map_err(driver_error)
            }
        }
    }

    fn current(&self) -> QueryResult<Document> {
        match self {
            Self::Implicit(cursor) => cursor.deserialize_current(),
            Self::Explicit { cursor, .. } => cursor.deserialize_current(),
        }
        .map_err(driver_error)
    }
}

/// A find or aggregate cursor.
pub(crate) struct MongoCursor {
    inner: Option<DriverCursor>,
    current: Option<Document>,
}

impl MongoCursor {
    pub(crate) fn new(cursor: DriverCursor) -> Self {
        Self {
            inner: Some(cursor),
            current: None,
        }
    }

    async fn step(&mut self) -> QueryResult<bool> {
        let Some(cursor) = self.inner.as_mut() else {
            self.current = None;
            return Ok(false);
        };
        if cursor.advance().await? {
            self.current = Some(cursor.current()?);
            return Ok(true);
        }
        // Exhausted: the driver has already released the server cursor.
        self.inner = None;
        self.current = None;
        Ok(false)
    }
}

#[async_trait]
impl CursorHandle for MongoCursor {
    fn id(&self) -> i64 {
        if self.inner.is_some() { OPEN_CURSOR_ID } else { 0 }
    }

    fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    fn remaining_batch_length(&self) -> usize {
        0
    }

    async fn advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        self.step().await
    }

    // The driver fetches at most one batch per step.
    async fn try_advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        self.step().await
    }

    async fn close(&mut self, _ctx: &OpContext) -> QueryResult<()> {
        // Dropping a live driver cursor kills it on the server.
        if self.inner.take().is_some() {
            debug!("cursor closed");
        }
        self.current = None;
        Ok(())
    }
}

/// A driver change stream, with its session when it has one.
pub(crate) enum DriverStream {
    Implicit(ChangeStream<Document>),
    Explicit {
        stream: SessionChangeStream<Document>,
        session: Arc<dyn SessionHandle>,
    },
}

impl DriverStream {
    async fn next_if_any(&mut self) -> QueryResult<Option<Document>> {
        match self {
            Self::Implicit(stream) => stream.next_if_any().await.map_err(driver_error),
            Self::Explicit { stream, session } => {
                let mut guard = MongoSession::from_handle(session.as_ref())?.lock().await?;
                stream.next_if_any(&mut guard).await.map_err(driver_error)
            }
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::Implicit(stream) => stream.is_alive(),
            Self::Explicit { stream, .. } => stream.is_alive(),
        }
    }

    fn resume_token(&self) -> Option<Document> {
        let token = match self {
            Self::Implicit(stream) => stream.resume_token(),
            Self::Explicit { stream, .. } => stream.resume_token(),
        };
        token.as_ref().and_then(convert::token_document)
    }
}

/// A change stream over a collection.
pub(crate) struct MongoChangeStream {
    inner: Option<DriverStream>,
    current: Option<Document>,
    /// Token of the last event, kept after the stream closes.
    last_token: Option<Document>,
}

impl MongoChangeStream {
    pub(crate) fn new(stream: DriverStream, initial_token: Option<Document>) -> Self {
        Self {
            inner: Some(stream),
            current: None,
            last_token: initial_token,
        }
    }

    async fn poll_once(&mut self) -> QueryResult<Option<bool>> {
        let Some(stream) = self.inner.as_mut() else {
            self.current = None;
            return Ok(Some(false));
        };
        let event = stream.next_if_any().await?;
        if let Some(token) = stream.resume_token() {
            self.last_token = Some(token);
        }
        match event {
            Some(event) => {
                self.current = Some(event);
                Ok(Some(true))
            }
            None if !stream.is_alive() => {
                debug!("change stream ended by the server");
                self.inner = None;
                self.current = None;
                Ok(Some(false))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CursorHandle for MongoChangeStream {
    fn id(&self) -> i64 {
        if self.inner.is_some() { OPEN_CURSOR_ID } else { 0 }
    }

    fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    fn remaining_batch_length(&self) -> usize {
        0
    }

    async fn advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        loop {
            if let Some(found) = self.poll_once().await? {
                return Ok(found);
            }
        }
    }

    async fn try_advance(&mut self, _ctx: &OpContext) -> QueryResult<bool> {
        Ok(self.poll_once().await?.unwrap_or(false))
    }

    async fn close(&mut self, _ctx: &OpContext) -> QueryResult<()> {
        if self.inner.take().is_some() {
            debug!("change stream closed");
        }
        self.current = None;
        Ok(())
    }
}

impl StreamHandle for MongoChangeStream {
    fn resume_token(&self) -> Option<Document> {
        self.inner
            .as_ref()
            .and_then(DriverStream::resume_token)
            .or_else(|| self.last_token.clone())
    }
}
