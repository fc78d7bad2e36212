//! MongoDB sessions.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::Document;
use docket_query::{
    OpContext, QueryError, QueryResult, ReadConcern, SessionHandle, TransactionOptions,
};
use mongodb::ClientSession;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::config::driver_write_concern;
use crate::error::MongoError;

/// A driver session behind a docket [`SessionHandle`].
///
/// Every operation run with a context bound to this session goes through the
/// same `ClientSession`, so it carries the session id and, while a
/// transaction is open, the transaction number.
pub struct MongoSession {
    id: Uuid,
    inner: Mutex<ClientSession>,
    ended: AtomicBool,
}

impl MongoSession {
    pub(crate) fn new(session: ClientSession) -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(session),
            ended: AtomicBool::new(false),
        }
    }

    /// The MongoDB session behind `handle`.
    ///
    /// Fails when the handle was started by a different store.
    pub fn from_handle(handle: &dyn SessionHandle) -> QueryResult<&Self> {
        handle
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| QueryError::usage("session was not started by a MongoDB store"))
    }

    /// The server-side session id (`lsid`).
    pub async fn lsid(&self) -> Document {
        self.inner.lock().await.id().clone()
    }

    /// Exclusive use of the driver session for one operation.
    pub(crate) async fn lock(&self) -> QueryResult<MutexGuard<'_, ClientSession>> {
        self.check_open()?;
        Ok(self.inner.lock().await)
    }

    fn check_open(&self) -> QueryResult<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(QueryError::session_ended());
        }
        Ok(())
    }
}

fn driver_read_concern(concern: ReadConcern) -> mongodb::options::ReadConcern {
    use mongodb::options::ReadConcern as Driver;

    match concern {
        ReadConcern::Local => Driver::local(),
        ReadConcern::Majority => Driver::majority(),
        ReadConcern::Snapshot => Driver::snapshot(),
        ReadConcern::Linearizable => Driver::linearizable(),
        ReadConcern::Available => Driver::available(),
    }
}

fn driver_options(options: TransactionOptions) -> mongodb::options::TransactionOptions {
    let mut driver = mongodb::options::TransactionOptions::default();
    driver.read_concern = options.read_concern.map(driver_read_concern);
    driver.write_concern = options.write_concern.as_ref().map(driver_write_concern);
    driver.max_commit_time = options.max_commit_time;
    driver
}

#[async_trait]
impl SessionHandle for MongoSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn start_transaction(&self, options: Option<TransactionOptions>) -> QueryResult<()> {
        self.check_open()?;
        let mut session = self.inner.lock().await;
        session
            .start_transaction(options.map(driver_options))
            .await
            .map_err(|e| QueryError::from(MongoError::from(e)))?;
        debug!(session = %self.id, "transaction started");
        Ok(())
    }

    async fn commit_transaction(&self, ctx: &OpContext) -> QueryResult<()> {
        self.check_open()?;
        ctx.run(async {
            let mut session = self.inner.lock().await;
            session
                .commit_transaction()
                .await
                .map_err(|e| QueryError::from(MongoError::from(e)))
        })
        .await?;
        debug!(session = %self.id, "transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self, ctx: &OpContext) -> QueryResult<()> {
        self.check_open()?;
        ctx.run(async {
            let mut session = self.inner.lock().await;
            session
                .abort_transaction()
                .await
                .map_err(|e| QueryError::from(MongoError::from(e)))
        })
        .await?;
        debug!(session = %self.id, "transaction aborted");
        Ok(())
    }

    async fn end(&self, _ctx: &OpContext) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut session = self.inner.lock().await;
        // Fails harmlessly when no transaction is open.
        if let Err(err) = session.abort_transaction().await {
            debug!(session = %self.id, error = %err, "no transaction to abort at session end");
        }
        debug!(session = %self.id, "session ended");
    }
}
