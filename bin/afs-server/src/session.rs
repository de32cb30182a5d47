//! Session workers
//!
//! Each client session is served by one worker task that owns the session's
//! bound transaction. Requests arrive over a bounded channel and are answered
//! through a oneshot reply, so a session's calls are processed in order.
//!
//! ```text
//!            begin                   prepare (two-phase)
//!   IDLE ------------> BOUND -----------------------------> IDLE (detached)
//!    ^                  |
//!    +--commit/rollback-+
//! ```
//!
//! A worker waits `idle_timeout` for the next request while IDLE and
//! `worker_timeout` while BOUND. When the wait expires the worker is
//! evicted: its transaction is rolled back (unless it is a two-phase
//! transaction already PREPARED, which belongs to its coordinator), queued
//! requests are answered with `SessionEvicted` and the pool slot is freed.

use crate::context::ServerContext;
use afs_common::{
    Error, ErrorClass, ObjectInfo, ObjectRef, Operation, OwnerId, Result, SessionToken, TxnId,
    TxnMode, TxnState, WorkerId,
};
use afs_txn::TransactionalConnection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Requests buffered per session before senders wait
pub const REQUEST_QUEUE_DEPTH: usize = 32;

/// How the worker is currently serving its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// No bound transaction; each mutation commits on its own
    SingleCall,
    /// Bound to a transaction committed by the session itself
    OnePhase,
    /// Bound to a transaction resolved by an external coordinator
    TwoPhase,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleCall => write!(f, "single-call"),
            Self::OnePhase => write!(f, "one-phase"),
            Self::TwoPhase => write!(f, "two-phase"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Request {
    Create {
        object: ObjectRef,
    },
    Write {
        object: ObjectRef,
        offset: u64,
        data: Vec<u8>,
    },
    Read {
        object: ObjectRef,
        offset: u64,
        len: u64,
    },
    List {
        owner: OwnerId,
    },
    Copy {
        source: ObjectRef,
        target: ObjectRef,
    },
    Move {
        source: ObjectRef,
        target: ObjectRef,
    },
    Delete {
        object: ObjectRef,
    },
    Begin {
        mode: TxnMode,
        txn: Option<TxnId>,
    },
    Prepare,
    Commit,
    Rollback,
    Logout,
}

#[derive(Debug)]
pub(crate) enum Response {
    Done,
    Txn(TxnId),
    Data(Vec<u8>),
    Listing(Vec<ObjectInfo>),
}

impl Response {
    pub(crate) fn into_txn(self) -> Result<TxnId> {
        match self {
            Self::Txn(txn) => Ok(txn),
            other => Err(Error::internal(format!("expected txn id, got {other:?}"))),
        }
    }

    pub(crate) fn into_data(self) -> Result<Vec<u8>> {
        match self {
            Self::Data(data) => Ok(data),
            other => Err(Error::internal(format!("expected data, got {other:?}"))),
        }
    }

    pub(crate) fn into_listing(self) -> Result<Vec<ObjectInfo>> {
        match self {
            Self::Listing(listing) => Ok(listing),
            other => Err(Error::internal(format!("expected listing, got {other:?}"))),
        }
    }
}

pub(crate) struct Envelope {
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<Result<Response>>,
}

/// Sending side of a running worker
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) tx: mpsc::Sender<Envelope>,
}

/// Live workers by session
pub(crate) type SessionTable = Arc<Mutex<HashMap<SessionToken, WorkerHandle>>>;

/// Run a storage call on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("blocking task failed: {e}")))?
}

pub(crate) struct SessionWorker {
    id: WorkerId,
    session: SessionToken,
    ctx: ServerContext,
    rx: mpsc::Receiver<Envelope>,
    conn: Option<Arc<TransactionalConnection>>,
    /// Two-phase transaction this session prepared and handed to its coordinator
    detached: Option<TxnId>,
    sessions: SessionTable,
    _permit: OwnedSemaphorePermit,
}

impl SessionWorker {
    /// Start a worker task for `session`
    ///
    /// The worker holds `permit` until it exits and removes itself from
    /// `sessions` on the way out.
    pub(crate) fn spawn(
        session: SessionToken,
        ctx: ServerContext,
        permit: OwnedSemaphorePermit,
        sessions: SessionTable,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let id = WorkerId::new();
        let worker = Self {
            id,
            session,
            ctx,
            rx,
            conn: None,
            detached: None,
            sessions,
            _permit: permit,
        };
        tokio::spawn(worker.run());
        WorkerHandle { id, tx }
    }

    fn mode(&self) -> WorkerMode {
        match self.conn.as_ref().map(|conn| conn.mode()) {
            None => WorkerMode::SingleCall,
            Some(TxnMode::OnePhase) => WorkerMode::OnePhase,
            Some(TxnMode::TwoPhase) => WorkerMode::TwoPhase,
        }
    }

    async fn run(mut self) {
        debug!("Session worker {} started for {:?}", self.id, self.session);
        let idle_timeout = self.ctx.config.server.idle_timeout();
        let bound_timeout = self.ctx.config.server.worker_timeout();

        loop {
            self.refresh();
            let wait = if self.conn.is_some() {
                bound_timeout
            } else {
                idle_timeout
            };

            let envelope = match tokio::time::timeout(wait, self.rx.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Evicting session worker {} after {wait:?} without a request ({} mode)",
                        self.id,
                        self.mode()
                    );
                    break;
                }
            };

            let logout = matches!(envelope.request, Request::Logout);
            let result = self.handle(envelope.request).await;
            let recycle = result
                .as_ref()
                .is_err_and(|e| e.class() == ErrorClass::System);
            if let Err(e) = &result
                && recycle
            {
                error!("Session worker {} recycling after error: {e}", self.id);
            }
            let _ = envelope.reply.send(result);
            if logout || recycle {
                break;
            }
        }

        self.shutdown().await;
    }

    /// Drop a connection whose transaction was resolved outside this worker
    fn refresh(&mut self) {
        if self
            .conn
            .as_ref()
            .is_some_and(|conn| conn.state().is_none_or(TxnState::is_terminal))
        {
            self.conn = None;
        }
        if let Some(txn) = self.detached
            && self
                .ctx
                .coordinator
                .state(txn)
                .is_none_or(TxnState::is_terminal)
        {
            self.detached = None;
        }
    }

    async fn shutdown(mut self) {
        self.rx.close();
        self.release().await;

        let mut refused = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            let _ = envelope.reply.send(Err(Error::SessionEvicted));
            refused += 1;
        }

        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&self.session)
                .is_some_and(|handle| handle.id == self.id)
            {
                sessions.remove(&self.session);
            }
        }
        debug!(
            "Session worker {} stopped ({refused} queued requests refused)",
            self.id
        );
    }

    /// Roll back the bound transaction unless its coordinator owns it
    async fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let txn = conn.txn_id();
        match conn.state() {
            None => return,
            Some(state) if state.is_terminal() => return,
            Some(TxnState::Prepared) if conn.mode() == TxnMode::TwoPhase => {
                info!("Leaving prepared {txn} to its coordinator");
                return;
            }
            Some(_) => {}
        }

        match blocking(move || conn.rollback()).await {
            Ok(()) => info!("Rolled back {txn} of session worker {}", self.id),
            Err(e) => error!("Failed to roll back {txn} of session worker {}: {e}", self.id),
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Begin { mode, txn } => self.begin(mode, txn).await,
            Request::Read {
                object,
                offset,
                len,
            } => {
                let max = self.ctx.config.server.max_read_size;
                if len > max {
                    return Err(Error::ReadTooLarge {
                        requested: len,
                        max,
                    });
                }
                let conn = self.conn.clone();
                let layout = Arc::clone(self.ctx.coordinator.layout());
                blocking(move || match conn {
                    Some(conn) => conn.read(&object, offset, len),
                    None => layout.read(&object, offset, len),
                })
                .await
                .map(Response::Data)
            }
            Request::List { owner } => {
                let conn = self.conn.clone();
                let layout = Arc::clone(self.ctx.coordinator.layout());
                blocking(move || match conn {
                    Some(conn) => conn.list(&owner),
                    None => layout.list(&owner),
                })
                .await
                .map(Response::Listing)
            }
            Request::Create { object } => self.mutate(Operation::Create { object }).await,
            Request::Write {
                object,
                offset,
                data,
            } => {
                self.mutate(Operation::Write {
                    object,
                    offset,
                    data,
                })
                .await
            }
            Request::Copy { source, target } => {
                self.mutate(Operation::Copy { source, target }).await
            }
            Request::Move { source, target } => {
                self.mutate(Operation::Move { source, target }).await
            }
            Request::Delete { object } => self.mutate(Operation::Delete { object }).await,
            Request::Prepare => self.prepare().await,
            Request::Commit => self.commit().await,
            Request::Rollback => self.rollback().await,
            Request::Logout => {
                self.release().await;
                Ok(Response::Done)
            }
        }
    }

    async fn begin(&mut self, mode: TxnMode, txn: Option<TxnId>) -> Result<Response> {
        if let Some(conn) = &self.conn {
            return Err(Error::TransactionInProgress(conn.txn_id()));
        }
        let coordinator = Arc::clone(&self.ctx.coordinator);
        let conn = blocking(move || TransactionalConnection::begin(coordinator, mode, txn)).await?;
        let txn = conn.txn_id();
        debug!("Session worker {} bound to {txn} ({mode})", self.id);
        self.conn = Some(Arc::new(conn));
        self.detached = None;
        Ok(Response::Txn(txn))
    }

    async fn mutate(&mut self, op: Operation) -> Result<Response> {
        if let Some(conn) = self.conn.clone() {
            blocking(move || conn.stage(op)).await?;
            return Ok(Response::Done);
        }

        // Single call: the operation is its own one-phase transaction.
        let coordinator = Arc::clone(&self.ctx.coordinator);
        blocking(move || {
            let conn = TransactionalConnection::begin(coordinator, TxnMode::OnePhase, None)?;
            if let Err(e) = conn.stage(op).and_then(|()| conn.commit()) {
                if let Err(rollback) = conn.rollback() {
                    debug!("Single call {} not rolled back: {rollback}", conn.txn_id());
                }
                return Err(e);
            }
            Ok(())
        })
        .await?;
        Ok(Response::Done)
    }

    async fn prepare(&mut self) -> Result<Response> {
        let conn = self.conn.clone().ok_or(Error::NoActiveTransaction)?;
        let txn = conn.txn_id();
        let mode = conn.mode();
        blocking(move || conn.prepare()).await?;

        if mode == TxnMode::TwoPhase {
            debug!("Session worker {} detached from prepared {txn}", self.id);
            self.conn = None;
            self.detached = Some(txn);
        }
        Ok(Response::Txn(txn))
    }

    async fn commit(&mut self) -> Result<Response> {
        if let Some(conn) = self.conn.clone() {
            blocking(move || conn.commit()).await?;
            self.conn = None;
            return Ok(Response::Done);
        }
        if let Some(txn) = self.detached {
            let coordinator = Arc::clone(&self.ctx.coordinator);
            blocking(move || coordinator.commit(txn)).await?;
            self.detached = None;
            return Ok(Response::Done);
        }
        Err(Error::NoActiveTransaction)
    }

    async fn rollback(&mut self) -> Result<Response> {
        if let Some(conn) = self.conn.clone() {
            blocking(move || conn.rollback()).await?;
            self.conn = None;
            return Ok(Response::Done);
        }
        if let Some(txn) = self.detached {
            let coordinator = Arc::clone(&self.ctx.coordinator);
            blocking(move || coordinator.rollback(txn)).await?;
            self.detached = None;
            return Ok(Response::Done);
        }
        Err(Error::NoActiveTransaction)
    }
}
