//! Transactions with explicit commit and rollback, and the retry loop
//! behind closure-scoped transactions.
//!
//! Set `DOCKET_DEBUG=true` to enable transaction debug logging.
//!
//! A [`Transaction`] is a thin state machine over a [`Session`]:
//! exactly one of [`Transaction::commit`] or [`Transaction::rollback`] may
//! run. When the transaction was begun by the client on a fresh session
//! ("automatic"), finishing it also ends that session.
//!
//! # Transaction Options
//!
//! ```rust
//! use std::time::Duration;
//! use docket_query::{ReadConcern, TransactionOptions, WriteConcern};
//!
//! let options = TransactionOptions::new()
//!     .read_concern(ReadConcern::Snapshot)
//!     .write_concern(WriteConcern::Majority)
//!     .max_commit_time(Duration::from_secs(5));
//! assert_eq!(options.read_concern, Some(ReadConcern::Snapshot));
//! ```
//!
//! # Usage (requires async runtime)
//!
//! ```rust,ignore
//! let tx = client.begin(&ctx).await?;
//! users.insert_one(tx.context(), &doc! { "_id": "uid1" }).await?;
//! tx.commit(&ctx).await?;
//! ```

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::options::{ReadConcern, WriteConcern};
use crate::session::{Session, SessionState};
use crate::store::SessionHandle;

/// How long the retry loop keeps retrying transient failures.
pub const WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// A transaction body: invoked once per attempt with the session-bound
/// context.
pub type TransactionBody<'a> =
    dyn FnMut(OpContext) -> BoxFuture<'static, QueryResult<()>> + Send + 'a;

/// Options for one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    /// Read concern for reads in the transaction.
    pub read_concern: Option<ReadConcern>,
    /// Write concern for the commit.
    pub write_concern: Option<WriteConcern>,
    /// Upper bound on how long the commit may run.
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    /// Create empty options; the store's defaults apply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read concern.
    pub fn read_concern(mut self, concern: ReadConcern) -> Self {
        self.read_concern = Some(concern);
        self
    }

    /// Set the write concern.
    pub fn write_concern(mut self, concern: WriteConcern) -> Self {
        self.write_concern = Some(concern);
        self
    }

    /// Set the commit time limit.
    pub fn max_commit_time(mut self, limit: Duration) -> Self {
        self.max_commit_time = Some(limit);
        self
    }
}

/// Run `body` inside a transaction on `session`, retrying transient
/// failures for up to [`WITH_TRANSACTION_TIMEOUT`].
///
/// - A body error labelled `TransientTransactionError` aborts and reruns
///   the whole transaction.
/// - A commit error labelled `UnknownTransactionCommitResult` retries the
///   commit alone.
/// - Anything else aborts the transaction and is returned.
pub async fn retry_transaction<S>(
    session: &S,
    ctx: &OpContext,
    options: Option<TransactionOptions>,
    body: &mut TransactionBody<'_>,
) -> QueryResult<()>
where
    S: SessionHandle + ?Sized,
{
    let started = Instant::now();
    let within_window = || started.elapsed() < WITH_TRANSACTION_TIMEOUT;
    let mut attempt = 0u32;

    'attempt: loop {
        attempt += 1;
        ctx.check()?;
        session.start_transaction(options.clone()).await?;
        debug!(session = %session.id(), attempt, "transaction started");

        if let Err(err) = body(ctx.clone()).await {
            if let Err(abort_err) = session.abort_transaction(ctx).await {
                debug!(session = %session.id(), error = %abort_err, "abort after failed body");
            }
            if err.is_transient_transaction() && !err.is_cancelled() && within_window() {
                debug!(session = %session.id(), error = %err, "retrying transient transaction error");
                continue 'attempt;
            }
            return Err(err);
        }

        loop {
            match session.commit_transaction(ctx).await {
                Ok(()) => {
                    debug!(session = %session.id(), attempt, "transaction committed");
                    return Ok(());
                }
                Err(err) if err.is_unknown_commit_result() && !err.is_cancelled() && within_window() => {
                    debug!(session = %session.id(), error = %err, "retrying commit with unknown result");
                }
                Err(err) if err.is_transient_transaction() && within_window() => {
                    debug!(session = %session.id(), error = %err, "retrying transaction after commit failure");
                    continue 'attempt;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Neither committed nor rolled back yet.
    Active,
    /// `commit` was called.
    Committed,
    /// `rollback` was called.
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "rolled back"),
        }
    }
}

/// An explicitly controlled transaction.
pub struct Transaction {
    session: Session,
    automatic: bool,
    state: Mutex<TransactionState>,
    ctx: OpContext,
}

impl Transaction {
    pub(crate) fn new(session: Session, automatic: bool) -> Self {
        let ctx = session.context().clone();
        Self {
            session,
            automatic,
            state: Mutex::new(TransactionState::Active),
            ctx,
        }
    }

    /// The context to run the transaction's operations with.
    pub fn context(&self) -> &OpContext {
        &self.ctx
    }

    /// The session the transaction runs on.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether finishing the transaction also ends its session.
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Commit the transaction.
    pub async fn commit(&self, ctx: &OpContext) -> QueryResult<()> {
        self.finish(ctx, TransactionState::Committed).await
    }

    /// Roll the transaction back.
    pub async fn rollback(&self, ctx: &OpContext) -> QueryResult<()> {
        self.finish(ctx, TransactionState::Aborted).await
    }

    async fn finish(&self, ctx: &OpContext, outcome: TransactionState) -> QueryResult<()> {
        // A dead context must not consume the transaction: nothing was sent.
        ctx.check()?;
        {
            let mut state = self.state.lock();
            if *state != TransactionState::Active {
                return Err(QueryError::transaction_state(format!(
                    "transaction already {}",
                    *state
                )));
            }
            *state = outcome;
        }

        let result = match outcome {
            TransactionState::Committed => self.session.commit_transaction(ctx).await,
            _ => self.session.abort_transaction(ctx).await,
        };

        // The session kept the transaction open (unknown commit result or a
        // context that died first), so it can still be finished.
        if result.is_err() && !self.automatic && self.session.state() == SessionState::InTransaction {
            *self.state.lock() = TransactionState::Active;
        }

        if self.automatic {
            if let Err(err) = self.session.end(ctx).await {
                warn!(session = %self.session.id(), error = %err, "failed to end transaction session");
            }
        }

        result
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.session.id())
            .field("automatic", &self.automatic)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if *self.state.get_mut() == TransactionState::Active {
            warn!(
                session = %self.session.id(),
                "transaction dropped without commit or rollback"
            );
        }
    }
}
