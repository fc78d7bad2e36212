//! Logical sessions.
//!
//! A [`Session`] wraps a store's [`SessionHandle`] with a small state
//! machine (idle, in a transaction, ended) so that misuse surfaces as a
//! usage error before anything reaches the store. Operations join a
//! session through its bound context: anything run with
//! [`Session::context`] (or a context derived from it) is routed through
//! the session by the store.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::store::SessionHandle;
use crate::transaction::{Transaction, TransactionBody, TransactionOptions};

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transaction is active.
    Idle,
    /// A transaction is active.
    InTransaction,
    /// The session was ended; every further use fails.
    Ended,
}

struct SessionInner {
    handle: Arc<dyn SessionHandle>,
    state: Mutex<SessionState>,
    ctx: OpContext,
}

/// A logical session. Cloning shares the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap a store session. The session's context derives from `ctx`.
    pub fn new(handle: Arc<dyn SessionHandle>, ctx: &OpContext) -> Self {
        let ctx = ctx.with_session(handle.clone());
        Self {
            inner: Arc::new(SessionInner {
                handle,
                state: Mutex::new(SessionState::Idle),
                ctx,
            }),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.inner.handle.id()
    }

    /// The store's session handle.
    pub fn handle(&self) -> &Arc<dyn SessionHandle> {
        &self.inner.handle
    }

    /// The context bound to this session.
    pub fn context(&self) -> &OpContext {
        &self.inner.ctx
    }

    /// Bind an arbitrary context to this session.
    pub fn bind(&self, ctx: &OpContext) -> OpContext {
        ctx.with_session(self.inner.handle.clone())
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Whether the session was ended.
    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    fn expect_state(&self, expected: SessionState) -> QueryResult<()> {
        match (self.state(), expected) {
            (SessionState::Ended, _) => Err(QueryError::session_ended()),
            (actual, expected) if actual == expected => Ok(()),
            (SessionState::InTransaction, _) => Err(QueryError::transaction_state(
                "a transaction is already in progress on this session",
            )),
            _ => Err(QueryError::transaction_state("no transaction started on this session")),
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.inner.state.lock();
        if *current != SessionState::Ended {
            *current = state;
        }
    }

    /// Start a transaction.
    pub async fn start_transaction(&self, options: Option<TransactionOptions>) -> QueryResult<()> {
        self.expect_state(SessionState::Idle)?;
        self.inner.handle.start_transaction(options).await?;
        self.set_state(SessionState::InTransaction);
        debug!(session = %self.id(), "transaction started");
        Ok(())
    }

    /// Commit the active transaction.
    ///
    /// A commit whose outcome is unknown leaves the transaction active so
    /// the commit can be retried. So does a context that is already
    /// cancelled or past its deadline: nothing is sent to the store.
    pub async fn commit_transaction(&self, ctx: &OpContext) -> QueryResult<()> {
        self.expect_state(SessionState::InTransaction)?;
        ctx.check()?;
        let ctx = self.bind(ctx);
        let result = ctx.run(self.inner.handle.commit_transaction(&ctx)).await;
        match result {
            Err(ref err) if err.is_unknown_commit_result() => {}
            _ => self.set_state(SessionState::Idle),
        }
        debug!(session = %self.id(), ok = result.is_ok(), "transaction commit");
        result
    }

    /// Abort the active transaction.
    pub async fn abort_transaction(&self, ctx: &OpContext) -> QueryResult<()> {
        self.expect_state(SessionState::InTransaction)?;
        ctx.check()?;
        let ctx = self.bind(ctx);
        let result = ctx.run(self.inner.handle.abort_transaction(&ctx)).await;
        self.set_state(SessionState::Idle);
        debug!(session = %self.id(), ok = result.is_ok(), "transaction abort");
        result
    }

    /// Begin an explicitly controlled transaction on this session. Finishing
    /// it leaves the session open.
    pub async fn begin(&self, ctx: &OpContext) -> QueryResult<Transaction> {
        self.begin_with(ctx, None).await
    }

    /// Begin an explicitly controlled transaction with options.
    pub async fn begin_with(
        &self,
        ctx: &OpContext,
        options: Option<TransactionOptions>,
    ) -> QueryResult<Transaction> {
        ctx.check()?;
        self.start_transaction(options).await?;
        Ok(Transaction::new(self.clone(), false))
    }

    /// Run `f` in a transaction, committing when it succeeds and retrying
    /// transient failures.
    ///
    /// `f` receives the session-bound context and may be called more than
    /// once. Its future must own what it uses.
    pub async fn with_transaction<F, Fut, T>(&self, ctx: &OpContext, f: F) -> QueryResult<T>
    where
        F: FnMut(OpContext) -> Fut + Send,
        Fut: Future<Output = QueryResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.with_transaction_opts(ctx, None, f).await
    }

    /// [`Session::with_transaction`] with transaction options.
    pub async fn with_transaction_opts<F, Fut, T>(
        &self,
        ctx: &OpContext,
        options: Option<TransactionOptions>,
        mut f: F,
    ) -> QueryResult<T>
    where
        F: FnMut(OpContext) -> Fut + Send,
        Fut: Future<Output = QueryResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.expect_state(SessionState::Idle)?;
        let ctx = self.bind(ctx);

        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let mut body = move |ctx: OpContext| -> BoxFuture<'static, QueryResult<()>> {
            let fut = f(ctx);
            let out = out.clone();
            Box::pin(async move {
                let value = fut.await?;
                *out.lock() = Some(value);
                Ok(())
            })
        };
        let body: &mut TransactionBody<'_> = &mut body;

        self.set_state(SessionState::InTransaction);
        let result = self.inner.handle.with_transaction(&ctx, options, body).await;
        self.set_state(SessionState::Idle);
        result?;

        let value = slot.lock().take();
        value.ok_or_else(|| QueryError::internal("transaction completed without a result"))
    }

    /// End the session, aborting any active transaction. Ending a session
    /// twice is a usage error.
    pub async fn end(&self, ctx: &OpContext) -> QueryResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Ended {
                return Err(QueryError::session_ended().with_context("end session"));
            }
            *state = SessionState::Ended;
        }
        self.inner.handle.end(ctx).await;
        debug!(session = %self.id(), "session ended");
        Ok(())
    }

    /// End the session unless it already was, logging instead of failing.
    pub(crate) async fn finish(&self, ctx: &OpContext) {
        if self.is_ended() {
            return;
        }
        if let Err(err) = self.end(ctx).await {
            warn!(session = %self.id(), error = %err, "failed to end session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
