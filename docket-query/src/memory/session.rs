//! Sessions and snapshot transactions of the in-memory store.
//!
//! A transaction works on private copies of the collections it touches,
//! taken the first time it uses each one. Commit checks that no touched
//! collection changed underneath it since the copy was taken, then installs
//! the copies and publishes the buffered change events. A conflict fails
//! the commit with a transient write-conflict error.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Shared;
use super::collection::CollectionData;
use super::events::Change;
use crate::context::OpContext;
use crate::error::{QueryError, QueryResult};
use crate::store::{Namespace, SessionHandle};
use crate::transaction::TransactionOptions;

pub(crate) struct Snapshot {
    pub(crate) data: CollectionData,
    base_version: u64,
    pub(crate) dirty: bool,
}

#[derive(Default)]
pub(crate) struct Workspace {
    collections: HashMap<Namespace, Snapshot>,
    pub(crate) changes: Vec<(Namespace, Change)>,
}

impl Workspace {
    /// The transaction's copy of `ns`, taken on first use.
    pub(crate) fn snapshot(&mut self, ns: &Namespace, shared: &Shared) -> &mut Snapshot {
        self.collections.entry(ns.clone()).or_insert_with(|| {
            let catalog = shared.catalog.read();
            let data = catalog.get(ns).cloned().unwrap_or_default();
            Snapshot {
                base_version: data.version,
                data,
                dirty: false,
            }
        })
    }
}

pub(crate) struct SessionState {
    pub(crate) ended: bool,
    pub(crate) txn: Option<Workspace>,
    txn_number: u64,
}

/// A session of a [`super::MemoryStore`].
pub(crate) struct MemorySession {
    id: Uuid,
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: Mutex<SessionState>,
}

impl MemorySession {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shared,
            state: Mutex::new(SessionState {
                ended: false,
                txn: None,
                txn_number: 0,
            }),
        }
    }

    fn commit(&self) -> QueryResult<()> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(QueryError::session_ended());
        }
        let workspace = state
            .txn
            .take()
            .ok_or_else(|| QueryError::transaction_state("no transaction in progress"))?;

        let mut catalog = self.shared.catalog.write();
        for (ns, snapshot) in workspace.collections.iter().filter(|(_, s)| s.dirty) {
            let current = catalog.get(ns).map_or(0, |c| c.version);
            if current != snapshot.base_version {
                warn!(session = %self.id, txn = state.txn_number, %ns, "transaction write conflict");
                return Err(QueryError::write_conflict(format!(
                    "{} was modified by another operation during the transaction",
                    ns
                ))
                .with_namespace(ns.to_string()));
            }
        }
        for (ns, snapshot) in workspace.collections.into_iter().filter(|(_, s)| s.dirty) {
            let entry = catalog.entry(ns).or_default();
            entry.docs = snapshot.data.docs;
            entry.version += 1;
        }
        drop(catalog);

        debug!(session = %self.id, txn = state.txn_number, events = workspace.changes.len(), "transaction committed");
        self.shared.events.publish(workspace.changes);
        Ok(())
    }
}

#[async_trait]
impl SessionHandle for MemorySession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn start_transaction(&self, _options: Option<TransactionOptions>) -> QueryResult<()> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(QueryError::session_ended());
        }
        if state.txn.is_some() {
            return Err(QueryError::transaction_state("transaction already in progress"));
        }
        state.txn = Some(Workspace::default());
        state.txn_number += 1;
        debug!(session = %self.id, txn = state.txn_number, "transaction started");
        Ok(())
    }

    async fn commit_transaction(&self, ctx: &OpContext) -> QueryResult<()> {
        ctx.check()?;
        self.commit()
    }

    async fn abort_transaction(&self, _ctx: &OpContext) -> QueryResult<()> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(QueryError::session_ended());
        }
        match state.txn.take() {
            Some(_) => {
                debug!(session = %self.id, txn = state.txn_number, "transaction aborted");
                Ok(())
            }
            None => Err(QueryError::transaction_state("no transaction in progress")),
        }
    }

    async fn end(&self, _ctx: &OpContext) {
        let mut state = self.state.lock();
        state.txn = None;
        state.ended = true;
    }
}
