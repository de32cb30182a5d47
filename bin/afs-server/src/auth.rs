//! Authorization gate
//!
//! Every API call is checked before it reaches a session worker:
//! - The caller's session key decides its kind (interactive or the
//!   external transaction manager)
//! - The session must authenticate
//! - Each owner the call touches must be authorized for the action
//!
//! Decisions from the backing authorizer are cached per session and expire
//! after a period without use.

use afs_common::config::AuthConfig;
use afs_common::{Error, OwnerId, Result, SessionToken};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache entries beyond which idle entries are swept on insert
const MAX_CACHE_ENTRIES: usize = 10_000;

/// What a call wants to do to an owner's objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Write,
}

/// Who is calling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    /// A client working through its own session
    Interactive,
    /// The external coordinator resolving transactions by id
    TransactionManager,
}

impl CallerKind {
    /// Decide the caller kind from its session key
    ///
    /// A missing key means an interactive caller. Unknown keys are refused.
    pub fn resolve(caller: &Caller, config: &AuthConfig) -> Result<Self> {
        match caller.key.as_deref() {
            None => Ok(Self::Interactive),
            Some(key) if key == config.transaction_manager_session_key => {
                Ok(Self::TransactionManager)
            }
            Some(key) if key == config.interactive_session_key => Ok(Self::Interactive),
            Some(_) => Err(Error::AccessDenied("unrecognized session key".into())),
        }
    }
}

/// Identity presented with every API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub session: SessionToken,
    pub key: Option<String>,
}

impl Caller {
    /// Interactive caller without a session key
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: SessionToken::new(session),
            key: None,
        }
    }

    /// Caller presenting a session key
    pub fn with_key(session: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            session: SessionToken::new(session),
            key: Some(key.into()),
        }
    }
}

/// Backing authentication and authorization service
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// Whether the session is known and valid
    async fn authenticate(&self, session: &SessionToken) -> Result<bool>;

    /// Whether the session may perform `action` on `owner`'s objects
    async fn authorize(&self, session: &SessionToken, action: Action, owner: &OwnerId)
    -> Result<bool>;
}

/// Authorizer that admits everyone
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    fn name(&self) -> &str {
        "allow-all"
    }

    async fn authenticate(&self, _session: &SessionToken) -> Result<bool> {
        Ok(true)
    }

    async fn authorize(
        &self,
        _session: &SessionToken,
        _action: Action,
        _owner: &OwnerId,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Decisions keyed by request, dropped once unused for `idle`
struct IdleCache<K> {
    entries: Mutex<HashMap<K, (bool, Instant)>>,
    idle: Duration,
}

impl<K: Eq + Hash> IdleCache<K> {
    fn new(idle: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle,
        }
    }

    fn get(&self, key: &K) -> Option<bool> {
        let mut entries = self.entries.lock();
        let cached = entries
            .get(key)
            .map(|(allowed, used)| (*allowed, used.elapsed() < self.idle));
        match cached {
            Some((allowed, true)) => {
                if let Some(entry) = entries.get_mut(key) {
                    entry.1 = Instant::now();
                }
                Some(allowed)
            }
            Some((_, false)) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: K, allowed: bool) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_CACHE_ENTRIES {
            let idle = self.idle;
            entries.retain(|_, (_, used)| used.elapsed() < idle);
        }
        entries.insert(key, (allowed, Instant::now()));
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Authorizer that caches another authorizer's answers
pub struct CachingAuthorizer {
    inner: Arc<dyn Authorizer>,
    sessions: IdleCache<SessionToken>,
    decisions: IdleCache<(SessionToken, Action, OwnerId)>,
}

impl CachingAuthorizer {
    pub fn new(inner: Arc<dyn Authorizer>, config: &AuthConfig) -> Self {
        Self {
            inner,
            sessions: IdleCache::new(config.authentication_cache_idle()),
            decisions: IdleCache::new(config.authorization_cache_idle()),
        }
    }

    /// Number of cached (authentication, authorization) answers
    pub fn cached(&self) -> (usize, usize) {
        (self.sessions.len(), self.decisions.len())
    }
}

#[async_trait]
impl Authorizer for CachingAuthorizer {
    fn name(&self) -> &str {
        "caching"
    }

    async fn authenticate(&self, session: &SessionToken) -> Result<bool> {
        if let Some(valid) = self.sessions.get(session) {
            return Ok(valid);
        }
        let valid = self.inner.authenticate(session).await?;
        debug!(
            "Authentication of {session:?} by {}: {valid}",
            self.inner.name()
        );
        self.sessions.insert(session.clone(), valid);
        Ok(valid)
    }

    async fn authorize(
        &self,
        session: &SessionToken,
        action: Action,
        owner: &OwnerId,
    ) -> Result<bool> {
        let key = (session.clone(), action, owner.clone());
        if let Some(allowed) = self.decisions.get(&key) {
            return Ok(allowed);
        }
        let allowed = self.inner.authorize(session, action, owner).await?;
        debug!(
            "Authorization of {session:?} for {action:?} on {owner} by {}: {allowed}",
            self.inner.name()
        );
        self.decisions.insert(key, allowed);
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and refuses the owner named "secret"
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authorizer for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn authenticate(&self, _session: &SessionToken) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn authorize(
            &self,
            _session: &SessionToken,
            _action: Action,
            owner: &OwnerId,
        ) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(owner.as_str() != "secret")
        }
    }

    fn auth_config(idle_ms: u64) -> AuthConfig {
        AuthConfig {
            authentication_cache_idle_ms: idle_ms,
            authorization_cache_idle_ms: idle_ms,
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_caller_kind_from_key() {
        let config = AuthConfig::default();
        assert_eq!(
            CallerKind::resolve(&Caller::new("s"), &config).unwrap(),
            CallerKind::Interactive
        );
        assert_eq!(
            CallerKind::resolve(
                &Caller::with_key("s", config.interactive_session_key.clone()),
                &config
            )
            .unwrap(),
            CallerKind::Interactive
        );
        assert_eq!(
            CallerKind::resolve(
                &Caller::with_key("s", config.transaction_manager_session_key.clone()),
                &config
            )
            .unwrap(),
            CallerKind::TransactionManager
        );
        assert!(matches!(
            CallerKind::resolve(&Caller::with_key("s", "bogus"), &config),
            Err(Error::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_decisions_are_cached() {
        let inner = Arc::new(Counting::default());
        let auth = CachingAuthorizer::new(inner.clone(), &auth_config(60_000));
        let session = SessionToken::new("s1");
        let owner = OwnerId::new("alice").unwrap();
        let secret = OwnerId::new("secret").unwrap();

        assert!(auth.authenticate(&session).await.unwrap());
        assert!(auth.authenticate(&session).await.unwrap());
        assert!(auth.authorize(&session, Action::Write, &owner).await.unwrap());
        assert!(auth.authorize(&session, Action::Write, &owner).await.unwrap());
        assert!(!auth.authorize(&session, Action::Read, &secret).await.unwrap());
        assert!(!auth.authorize(&session, Action::Read, &secret).await.unwrap());

        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(auth.cached(), (1, 2));
    }

    #[tokio::test]
    async fn test_idle_entries_expire() {
        let inner = Arc::new(Counting::default());
        let auth = CachingAuthorizer::new(inner.clone(), &auth_config(20));
        let session = SessionToken::new("s1");
        let owner = OwnerId::new("alice").unwrap();

        auth.authorize(&session, Action::Read, &owner).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        auth.authorize(&session, Action::Read, &owner).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
