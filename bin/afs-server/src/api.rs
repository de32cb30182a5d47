//! API server
//!
//! Entry point for every client call. The server authorizes the caller,
//! finds (or spawns) the session's worker from a bounded pool and forwards
//! the request. Each call is bounded by the operation timeout.
//!
//! Transaction lifecycle calls carrying an explicit transaction id go
//! straight to the coordinator. Only the transaction manager, or the session
//! that began the transaction, may resolve a transaction by id.

use crate::auth::{Action, Caller, CallerKind};
use crate::context::ServerContext;
use crate::session::{
    Envelope, Request, Response, SessionTable, SessionWorker, WorkerHandle, blocking,
};
use afs_common::{
    Error, ObjectInfo, ObjectRef, OwnerId, Result, SessionToken, TxnId, TxnMode, WorkerId,
};
use afs_txn::{InDoubtTxn, TransactionCoordinator};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

/// Client-facing surface of the storage engine
pub struct ApiServer {
    ctx: ServerContext,
    sessions: SessionTable,
    pool: Arc<Semaphore>,
    /// Session that began each explicitly started transaction
    txn_sessions: Mutex<HashMap<TxnId, SessionToken>>,
}

impl ApiServer {
    pub fn new(ctx: ServerContext) -> Self {
        let pool_size = ctx.config.server.pool_size;
        info!("API server ready with {pool_size} session workers");
        Self {
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(Semaphore::new(pool_size)),
            txn_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub const fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Number of live session workers
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    // ---- Object operations ----

    pub async fn create(&self, caller: &Caller, object: ObjectRef) -> Result<()> {
        self.admit(caller, Action::Write, &[&object.owner]).await?;
        self.dispatch(&caller.session, Request::Create { object })
            .await
            .map(drop)
    }

    pub async fn write(
        &self,
        caller: &Caller,
        object: ObjectRef,
        offset: u64,
        data: Bytes,
    ) -> Result<()> {
        self.admit(caller, Action::Write, &[&object.owner]).await?;
        let request = Request::Write {
            object,
            offset,
            data: Vec::from(data),
        };
        self.dispatch(&caller.session, request).await.map(drop)
    }

    /// Read at most `len` bytes at `offset`
    pub async fn read(
        &self,
        caller: &Caller,
        object: ObjectRef,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        self.admit(caller, Action::Read, &[&object.owner]).await?;
        let request = Request::Read {
            object,
            offset,
            len,
        };
        let data = self.dispatch(&caller.session, request).await?.into_data()?;
        Ok(Bytes::from(data))
    }

    pub async fn list(&self, caller: &Caller, owner: OwnerId) -> Result<Vec<ObjectInfo>> {
        self.admit(caller, Action::Read, &[&owner]).await?;
        self.dispatch(&caller.session, Request::List { owner })
            .await?
            .into_listing()
    }

    pub async fn copy(&self, caller: &Caller, source: ObjectRef, target: ObjectRef) -> Result<()> {
        self.admit(caller, Action::Read, &[&source.owner]).await?;
        self.admit(caller, Action::Write, &[&target.owner]).await?;
        self.dispatch(&caller.session, Request::Copy { source, target })
            .await
            .map(drop)
    }

    pub async fn move_object(
        &self,
        caller: &Caller,
        source: ObjectRef,
        target: ObjectRef,
    ) -> Result<()> {
        self.admit(caller, Action::Write, &[&source.owner, &target.owner])
            .await?;
        self.dispatch(&caller.session, Request::Move { source, target })
            .await
            .map(drop)
    }

    pub async fn delete(&self, caller: &Caller, object: ObjectRef) -> Result<()> {
        self.admit(caller, Action::Write, &[&object.owner]).await?;
        self.dispatch(&caller.session, Request::Delete { object })
            .await
            .map(drop)
    }

    // ---- Transaction lifecycle ----

    /// Bind a new transaction to the caller's session
    ///
    /// Only the transaction manager may choose the transaction id.
    pub async fn begin(
        &self,
        caller: &Caller,
        mode: TxnMode,
        txn: Option<TxnId>,
    ) -> Result<TxnId> {
        let kind = self.admit(caller, Action::Write, &[]).await?;
        if txn.is_some() && kind != CallerKind::TransactionManager {
            return Err(Error::AccessDenied(
                "only the transaction manager may choose transaction ids".into(),
            ));
        }

        let txn = self
            .dispatch(&caller.session, Request::Begin { mode, txn })
            .await?
            .into_txn()?;

        self.prune_txn_sessions();
        self.txn_sessions.lock().insert(txn, caller.session.clone());
        Ok(txn)
    }

    pub async fn prepare(&self, caller: &Caller, txn: Option<TxnId>) -> Result<()> {
        let kind = self.admit(caller, Action::Write, &[]).await?;
        match txn {
            Some(txn) => {
                self.check_resolver(caller, kind, txn)?;
                self.resolve(move |c| c.prepare(txn)).await
            }
            None => self
                .dispatch(&caller.session, Request::Prepare)
                .await
                .map(drop),
        }
    }

    pub async fn commit(&self, caller: &Caller, txn: Option<TxnId>) -> Result<()> {
        let kind = self.admit(caller, Action::Write, &[]).await?;
        let result = match txn {
            Some(txn) => {
                self.check_resolver(caller, kind, txn)?;
                self.resolve(move |c| c.commit(txn)).await
            }
            None => self
                .dispatch(&caller.session, Request::Commit)
                .await
                .map(drop),
        };
        self.prune_txn_sessions();
        result
    }

    pub async fn rollback(&self, caller: &Caller, txn: Option<TxnId>) -> Result<()> {
        let kind = self.admit(caller, Action::Write, &[]).await?;
        let result = match txn {
            Some(txn) => {
                self.check_resolver(caller, kind, txn)?;
                self.resolve(move |c| c.rollback(txn)).await
            }
            None => self
                .dispatch(&caller.session, Request::Rollback)
                .await
                .map(drop),
        };
        self.prune_txn_sessions();
        result
    }

    /// PREPARED transactions awaiting a decision
    pub async fn in_doubt(&self, caller: &Caller) -> Result<Vec<InDoubtTxn>> {
        let kind = self.admit(caller, Action::Read, &[]).await?;
        if kind != CallerKind::TransactionManager {
            return Err(Error::AccessDenied(
                "only the transaction manager may list in-doubt transactions".into(),
            ));
        }
        Ok(self.ctx.coordinator.in_doubt())
    }

    /// End the session, rolling back its bound transaction
    pub async fn logout(&self, caller: &Caller) -> Result<()> {
        CallerKind::resolve(caller, &self.ctx.config.auth)?;
        let handle = self.sessions.lock().get(&caller.session).cloned();
        let Some(handle) = handle else {
            return Ok(());
        };
        match self.exchange(&handle, Request::Logout).await {
            Ok(_) | Err(Error::SessionEvicted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ---- Plumbing ----

    /// Authenticate the caller and authorize `action` on every owner
    async fn admit(
        &self,
        caller: &Caller,
        action: Action,
        owners: &[&OwnerId],
    ) -> Result<CallerKind> {
        let kind = CallerKind::resolve(caller, &self.ctx.config.auth)?;
        self.bounded(async {
            let authorizer = &self.ctx.authorizer;
            if !authorizer.authenticate(&caller.session).await? {
                return Err(Error::AccessDenied("session is not authenticated".into()));
            }
            for owner in owners {
                if !authorizer.authorize(&caller.session, action, owner).await? {
                    return Err(Error::AccessDenied(format!("{action:?} on {owner}")));
                }
            }
            Ok(())
        })
        .await?;
        Ok(kind)
    }

    fn check_resolver(&self, caller: &Caller, kind: CallerKind, txn: TxnId) -> Result<()> {
        if kind == CallerKind::TransactionManager {
            return Ok(());
        }
        match self.txn_sessions.lock().get(&txn) {
            Some(owner) if *owner == caller.session => Ok(()),
            _ => Err(Error::AccessDenied(format!(
                "{txn} does not belong to this session"
            ))),
        }
    }

    /// Forget the owning session of every transaction that reached a final state
    fn prune_txn_sessions(&self) {
        let coordinator = &self.ctx.coordinator;
        self.txn_sessions.lock().retain(|known, _| {
            coordinator
                .state(*known)
                .is_some_and(|state| !state.is_terminal())
        });
    }

    /// Run a coordinator call by transaction id
    async fn resolve<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TransactionCoordinator) -> Result<()> + Send + 'static,
    {
        let coordinator = Arc::clone(&self.ctx.coordinator);
        self.bounded(blocking(move || f(&coordinator))).await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.ctx.config.server.operation_timeout(), fut)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Forward a request to the session's worker
    ///
    /// A worker that exited before accepting the request is replaced once.
    async fn dispatch(&self, session: &SessionToken, mut request: Request) -> Result<Response> {
        for _ in 0..2 {
            let handle = self.worker(session).await?;
            match self.send(&handle, request).await? {
                Ok(reply) => return self.await_reply(reply).await,
                Err(returned) => {
                    debug!("Session worker {} gone, respawning", handle.id);
                    self.forget(session, handle.id);
                    request = returned;
                }
            }
        }
        Err(Error::SessionEvicted)
    }

    /// Send to an existing worker without respawning it
    async fn exchange(&self, handle: &WorkerHandle, request: Request) -> Result<Response> {
        match self.send(handle, request).await? {
            Ok(reply) => self.await_reply(reply).await,
            Err(_) => Err(Error::SessionEvicted),
        }
    }

    /// Queue a request; a closed worker hands the request back
    async fn send(
        &self,
        handle: &WorkerHandle,
        request: Request,
    ) -> Result<std::result::Result<oneshot::Receiver<Result<Response>>, Request>> {
        let (reply, response) = oneshot::channel();
        let deadline = Instant::now() + self.ctx.config.server.operation_timeout();
        let envelope = Envelope { request, reply };
        match tokio::time::timeout_at(deadline, handle.tx.send(envelope)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Ok(())) => Ok(Ok(response)),
            Ok(Err(mpsc::error::SendError(envelope))) => Ok(Err(envelope.request)),
        }
    }

    async fn await_reply(&self, reply: oneshot::Receiver<Result<Response>>) -> Result<Response> {
        match tokio::time::timeout(self.ctx.config.server.operation_timeout(), reply).await {
            Err(_) => Err(Error::Timeout),
            // Worker dropped the reply without answering.
            Ok(Err(_)) => Err(Error::SessionEvicted),
            Ok(Ok(result)) => result,
        }
    }

    /// The session's live worker, spawning one from the pool if needed
    async fn worker(&self, session: &SessionToken) -> Result<WorkerHandle> {
        if let Some(handle) = self.live_worker(session) {
            return Ok(handle);
        }

        let permit = tokio::time::timeout(
            self.ctx.config.server.operation_timeout(),
            Arc::clone(&self.pool).acquire_owned(),
        )
        .await
        .map_err(|_| Error::PoolExhausted)?
        .map_err(|_| Error::internal("session worker pool closed"))?;

        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(session)
            && !handle.tx.is_closed()
        {
            return Ok(handle.clone());
        }
        let handle = SessionWorker::spawn(
            session.clone(),
            self.ctx.clone(),
            permit,
            Arc::clone(&self.sessions),
        );
        sessions.insert(session.clone(), handle.clone());
        Ok(handle)
    }

    fn live_worker(&self, session: &SessionToken) -> Option<WorkerHandle> {
        self.sessions
            .lock()
            .get(session)
            .filter(|handle| !handle.tx.is_closed())
            .cloned()
    }

    fn forget(&self, session: &SessionToken, id: WorkerId) {
        let mut sessions = self.sessions.lock();
        if sessions.get(session).is_some_and(|handle| handle.id == id) {
            sessions.remove(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authorizer;
    use afs_common::{AfsConfig, ObjectPath, TxnState};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    const TM_KEY: &str = "transaction-manager";

    fn server(dir: &TempDir, tweak: impl FnOnce(&mut AfsConfig)) -> ApiServer {
        let mut config = AfsConfig::default();
        config.storage.root = dir.path().join("store");
        config.wal.root = dir.path().join("wal");
        config.server.operation_timeout_ms = 5_000;
        tweak(&mut config);
        let (ctx, _) = ServerContext::open(config).unwrap();
        ApiServer::new(ctx)
    }

    fn obj(owner: &str, path: &str) -> ObjectRef {
        ObjectRef::new(
            OwnerId::new(owner).unwrap(),
            ObjectPath::new(path).unwrap(),
        )
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    fn stored(api: &ApiServer, object: &ObjectRef) -> Option<Vec<u8>> {
        api.context()
            .coordinator
            .layout()
            .read_all(object)
            .unwrap()
    }

    /// Refuses every action on the owner named "secret"
    struct DenySecret;

    #[async_trait]
    impl Authorizer for DenySecret {
        fn name(&self) -> &str {
            "deny-secret"
        }

        async fn authenticate(&self, _session: &SessionToken) -> Result<bool> {
            Ok(true)
        }

        async fn authorize(
            &self,
            _session: &SessionToken,
            _action: Action,
            owner: &OwnerId,
        ) -> Result<bool> {
            Ok(owner.as_str() != "secret")
        }
    }

    #[tokio::test]
    async fn test_single_call_commits_immediately() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let caller = Caller::new("s1");
        let x = obj("alice", "docs/x");

        api.write(&caller, x.clone(), 0, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(stored(&api, &x).unwrap(), b"hello");
        let data = api.read(&caller, x.clone(), 0, 5).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(api.context().coordinator.stalled_commits(), Vec::<TxnId>::new());
    }

    #[tokio::test]
    async fn test_session_transaction_is_isolated_until_commit() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let writer = Caller::new("writer");
        let reader = Caller::new("reader");

        api.begin(&writer, TxnMode::OnePhase, None).await.unwrap();
        api.write(&writer, obj("alice", "x"), 0, Bytes::from_static(b"1"))
            .await
            .unwrap();
        api.write(&writer, obj("alice", "y"), 0, Bytes::from_static(b"2"))
            .await
            .unwrap();

        assert_eq!(api.list(&writer, owner("alice")).await.unwrap().len(), 2);
        assert!(api.list(&reader, owner("alice")).await.unwrap().is_empty());

        api.commit(&writer, None).await.unwrap();

        let listing = api.list(&reader, owner("alice")).await.unwrap();
        let paths: Vec<&str> = listing.iter().map(|info| info.path.as_str()).collect();
        assert_eq!(paths, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_user_errors_keep_the_transaction() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let caller = Caller::new("s1");
        let x = obj("alice", "x");

        api.begin(&caller, TxnMode::OnePhase, None).await.unwrap();
        api.create(&caller, x.clone()).await.unwrap();
        assert!(matches!(
            api.create(&caller, x.clone()).await,
            Err(Error::ObjectAlreadyExists(_))
        ));
        assert!(matches!(
            api.begin(&caller, TxnMode::OnePhase, None).await,
            Err(Error::TransactionInProgress(_))
        ));

        api.commit(&caller, None).await.unwrap();
        assert_eq!(stored(&api, &x).unwrap(), b"");
        assert!(matches!(
            api.commit(&caller, None).await,
            Err(Error::NoActiveTransaction)
        ));
    }

    #[tokio::test]
    async fn test_evicted_worker_rolls_back() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |c| c.server.worker_timeout_ms = 300);
        let caller = Caller::new("s1");
        let x = obj("alice", "x");

        let txn = api.begin(&caller, TxnMode::OnePhase, None).await.unwrap();
        api.write(&caller, x.clone(), 0, Bytes::from_static(b"lost"))
            .await
            .unwrap();

        let coordinator = &api.context().coordinator;
        for _ in 0..100 {
            if coordinator.state(txn) == Some(TxnState::Aborted) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(coordinator.state(txn), Some(TxnState::Aborted));
        assert!(stored(&api, &x).is_none());

        // A fresh worker serves the session; the old transaction is gone.
        assert!(matches!(
            api.commit(&caller, None).await,
            Err(Error::NoActiveTransaction)
        ));
    }

    #[tokio::test]
    async fn test_logout_rolls_back() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let caller = Caller::new("s1");

        let txn = api.begin(&caller, TxnMode::OnePhase, None).await.unwrap();
        api.create(&caller, obj("alice", "x")).await.unwrap();
        api.logout(&caller).await.unwrap();

        assert_eq!(
            api.context().coordinator.state(txn),
            Some(TxnState::Aborted)
        );
        // Logging out an unknown session is a no-op.
        api.logout(&Caller::new("nobody")).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_phase_resolved_by_transaction_manager() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let tm = Caller::with_key("tm-session", TM_KEY);
        let other_tm = Caller::with_key("tm-other", TM_KEY);
        let user = Caller::new("user");
        let x = obj("alice", "x");
        let id = TxnId::new(500);

        assert!(matches!(
            api.begin(&user, TxnMode::TwoPhase, Some(id)).await,
            Err(Error::AccessDenied(_))
        ));

        assert_eq!(
            api.begin(&tm, TxnMode::TwoPhase, Some(id)).await.unwrap(),
            id
        );
        api.write(&tm, x.clone(), 0, Bytes::from_static(b"2pc"))
            .await
            .unwrap();
        api.prepare(&tm, None).await.unwrap();

        let in_doubt = api.in_doubt(&other_tm).await.unwrap();
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].txn, id);
        assert!(matches!(
            api.in_doubt(&user).await,
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            api.commit(&user, Some(id)).await,
            Err(Error::AccessDenied(_))
        ));
        assert!(stored(&api, &x).is_none());

        api.commit(&other_tm, Some(id)).await.unwrap();
        assert_eq!(stored(&api, &x).unwrap(), b"2pc");
        assert_eq!(
            api.context().coordinator.state(id),
            Some(TxnState::Committed)
        );
        // The preparing session no longer holds the transaction.
        assert!(matches!(
            api.commit(&tm, None).await,
            Err(Error::NoActiveTransaction)
        ));
    }

    #[tokio::test]
    async fn test_resolved_transactions_are_forgotten() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let tm = Caller::with_key("tm-session", TM_KEY);
        let other_tm = Caller::with_key("tm-other", TM_KEY);
        let user = Caller::new("user");

        let id = TxnId::new(600);
        api.begin(&tm, TxnMode::TwoPhase, Some(id)).await.unwrap();
        api.create(&tm, obj("alice", "x")).await.unwrap();
        api.prepare(&tm, None).await.unwrap();
        let local = api.begin(&user, TxnMode::TwoPhase, None).await.unwrap();
        api.create(&user, obj("bob", "y")).await.unwrap();
        api.prepare(&user, None).await.unwrap();
        assert_eq!(api.txn_sessions.lock().len(), 2);

        api.commit(&other_tm, Some(id)).await.unwrap();
        assert!(!api.txn_sessions.lock().contains_key(&id));
        api.rollback(&user, Some(local)).await.unwrap();
        assert!(api.txn_sessions.lock().is_empty());

        // Once forgotten, only the transaction manager may ask again.
        assert!(matches!(
            api.rollback(&user, Some(local)).await,
            Err(Error::AccessDenied(_))
        ));
        api.rollback(&tm, Some(local)).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_worker_is_evicted() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |c| c.server.idle_timeout_ms = 100);
        let caller = Caller::new("s1");

        api.list(&caller, owner("alice")).await.unwrap();
        assert_eq!(api.session_count(), 1);

        for _ in 0..100 {
            if api.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(api.session_count(), 0);

        // The session is served again by a fresh worker.
        api.write(&caller, obj("alice", "x"), 0, Bytes::from_static(b"back"))
            .await
            .unwrap();
        assert_eq!(stored(&api, &obj("alice", "x")).unwrap(), b"back");
    }

    #[tokio::test]
    async fn test_path_conflict_keeps_the_transaction() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let caller = Caller::new("s1");
        api.write(&caller, obj("alice", "f"), 0, Bytes::from_static(b"file"))
            .await
            .unwrap();

        let txn = api.begin(&caller, TxnMode::OnePhase, None).await.unwrap();
        api.create(&caller, obj("alice", "kept")).await.unwrap();
        let err = api.create(&caller, obj("alice", "f/g")).await.unwrap_err();
        assert!(matches!(err, Error::PathConflict { .. }), "{err:?}");
        assert_eq!(
            api.context().coordinator.state(txn),
            Some(TxnState::Active)
        );

        api.commit(&caller, None).await.unwrap();
        assert_eq!(stored(&api, &obj("alice", "kept")).unwrap(), b"");
        assert!(stored(&api, &obj("alice", "f/g")).is_none());
    }

    #[tokio::test]
    async fn test_two_phase_commit_requires_prepare() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |_| {});
        let caller = Caller::new("s1");

        let txn = api.begin(&caller, TxnMode::TwoPhase, None).await.unwrap();
        api.create(&caller, obj("alice", "x")).await.unwrap();
        assert!(matches!(
            api.commit(&caller, None).await,
            Err(Error::IllegalState { .. })
        ));

        // The owning session may resolve its own transaction by id.
        api.prepare(&caller, None).await.unwrap();
        api.rollback(&caller, Some(txn)).await.unwrap();
        assert_eq!(
            api.context().coordinator.state(txn),
            Some(TxnState::Aborted)
        );
    }

    #[tokio::test]
    async fn test_authorization_is_enforced() {
        let dir = TempDir::new().unwrap();
        let mut config = AfsConfig::default();
        config.storage.root = dir.path().join("store");
        config.wal.root = dir.path().join("wal");
        let (ctx, _) = ServerContext::open(config).unwrap();
        let api = ApiServer::new(ctx.with_authorizer(Arc::new(DenySecret)));
        let caller = Caller::new("s1");

        assert!(matches!(
            api.create(&caller, obj("secret", "x")).await,
            Err(Error::AccessDenied(_))
        ));
        assert!(matches!(
            api.copy(&caller, obj("alice", "x"), obj("secret", "y")).await,
            Err(Error::AccessDenied(_))
        ));
        assert!(stored(&api, &obj("secret", "x")).is_none());
        api.create(&caller, obj("alice", "x")).await.unwrap();

        assert!(matches!(
            api.create(&Caller::with_key("s2", "bogus"), obj("alice", "y"))
                .await,
            Err(Error::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_read_size_is_limited() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |c| c.server.max_read_size = 4);
        let caller = Caller::new("s1");
        let x = obj("alice", "x");
        api.write(&caller, x.clone(), 0, Bytes::from_static(b"abcdef"))
            .await
            .unwrap();

        assert!(matches!(
            api.read(&caller, x.clone(), 0, 5).await,
            Err(Error::ReadTooLarge {
                requested: 5,
                max: 4
            })
        ));
        let data = api.read(&caller, x, 2, 4).await.unwrap();
        assert_eq!(&data[..], b"cdef");
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let dir = TempDir::new().unwrap();
        let api = server(&dir, |c| {
            c.server.pool_size = 1;
            c.server.operation_timeout_ms = 200;
        });
        let first = Caller::new("first");
        let second = Caller::new("second");

        api.list(&first, owner("alice")).await.unwrap();
        assert_eq!(api.session_count(), 1);
        assert!(matches!(
            api.list(&second, owner("alice")).await,
            Err(Error::PoolExhausted)
        ));

        api.logout(&first).await.unwrap();
        api.list(&second, owner("alice")).await.unwrap();
    }
}
