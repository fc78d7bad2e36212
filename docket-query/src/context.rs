//! Operation context: cancellation, deadlines and session binding.
//!
//! Every operation that may touch the network takes an [`OpContext`]. A
//! context carries a cancellation token, an optional deadline and, inside a
//! transaction, the session the operation must run in. Contexts are cheap
//! to clone and derive children that inherit all three.
//!
//! ```rust
//! use std::time::Duration;
//! use docket_query::OpContext;
//!
//! let ctx = OpContext::background();
//! let bounded = ctx.with_timeout(Duration::from_secs(5));
//! assert!(bounded.deadline().is_some());
//! assert!(bounded.check().is_ok());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, QueryResult};
use crate::store::SessionHandle;

/// Cancellation, deadline and session binding for one logical operation.
#[derive(Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    session: Option<Arc<dyn SessionHandle>>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context. Cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            session: self.session.clone(),
        }
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`, or earlier if the
    /// parent already expires earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    /// Derive a child context together with the token that cancels it.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let ctx = self.child();
        let token = ctx.token.clone();
        (ctx, token)
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The error this context would fail with right now, if any.
    pub fn err(&self) -> Option<QueryError> {
        if self.token.is_cancelled() {
            return Some(QueryError::cancelled());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(QueryError::deadline_exceeded()),
            _ => None,
        }
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self) -> QueryResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `fut` until it completes, the context is cancelled or the
    /// deadline passes, whichever comes first.
    pub async fn run<F, T>(&self, fut: F) -> QueryResult<T>
    where
        F: Future<Output = QueryResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(QueryError::cancelled()),
            _ = wait_for(self.deadline) => Err(QueryError::deadline_exceeded()),
            result = fut => result,
        }
    }

    /// The session this context is bound to.
    pub fn session(&self) -> Option<&Arc<dyn SessionHandle>> {
        self.session.as_ref()
    }

    /// Derive a child context bound to `session`. Stores route every
    /// operation run with it through that session.
    pub fn with_session(&self, session: Arc<dyn SessionHandle>) -> Self {
        let mut ctx = self.child();
        ctx.session = Some(session);
        ctx
    }

    /// Derive a child context without a session binding.
    pub fn without_session(&self) -> Self {
        let mut ctx = self.child();
        ctx.session = None;
        ctx
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}
