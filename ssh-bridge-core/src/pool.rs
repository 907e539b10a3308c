//! The process-wide connection pool: idle SSH sessions keyed by cache key
//! (or extended cache key, for shared sessions), and the credential cache
//! that lets a second caller skip re-prompting for a password or key.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use rand::RngCore;
use ssh_bridge_ssh::{ChallengeQueue, ConnectParams, Observer, SshAdapterError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::adapter::{SshConnector, SshSession};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub username: String,
    pub hostname: String,
    pub port: u16,
}

impl CacheKey {
    pub fn new(username: impl Into<String>, hostname: impl Into<String>, port: u16) -> CacheKey {
        CacheKey { username: username.into(), hostname: hostname.into(), port }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    base: CacheKey,
    share_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedCredential {
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
}

pub enum RelinquishMode {
    Drop,
    Keep,
    Share,
}

struct IdleEntry {
    session: Box<dyn SshSession>,
    timer: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

/// Generates the unguessable 128-bit share token, rendered as lowercase hex.
fn generate_share_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Pool {
    connector: Arc<dyn SshConnector>,
    idle: Mutex<HashMap<PoolKey, IdleEntry>>,
    creds: Mutex<HashMap<CacheKey, CachedCredential>>,
    reusable_ttl: Duration,
    share_ttl: Duration,
    self_weak: OnceLock<Weak<Pool>>,
}

impl Pool {
    pub fn new(connector: Arc<dyn SshConnector>, reusable_ttl: Duration, share_ttl: Duration) -> Arc<Pool> {
        let pool = Arc::new(Pool {
            connector,
            idle: Mutex::new(HashMap::new()),
            creds: Mutex::new(HashMap::new()),
            reusable_ttl,
            share_ttl,
            self_weak: OnceLock::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));
        pool
    }

    fn weak_self(&self) -> Weak<Pool> {
        self.self_weak.get().cloned().expect("Pool::new always sets self_weak")
    }

    /// `reuse(params, observer) -> SshSession | null` (§4.4). Atomically
    /// removes and returns the matching idle session, cancelling its
    /// retention timer and swapping in `observer`.
    pub async fn reuse(
        &self,
        key: CacheKey,
        share_key: Option<String>,
        observer: Observer,
    ) -> Option<Box<dyn SshSession>> {
        let pool_key = PoolKey { base: key, share_key };
        let entry = { self.idle.lock().await.remove(&pool_key) };
        match entry {
            Some(entry) => {
                entry.timer.abort();
                entry.watcher.abort();
                let mut session = entry.session;
                session.rebind_observer(observer.clone());
                observer.connected(session.fingerprint(), session.banner());
                Some(session)
            }
            None => {
                observer.unconnected("no cached connection to reuse");
                None
            }
        }
    }

    /// `connect(params, observer) -> SshSession | null` (§4.4): substitutes
    /// cached credentials when none were supplied directly, retries once
    /// with a dropped key when authentication fails and another credential
    /// remains, and caches a sanitized credential on a fresh, challenge-free
    /// success.
    pub async fn connect(
        &self,
        key: CacheKey,
        mut params: ConnectParams,
        observer: Observer,
        challenges: ChallengeQueue,
    ) -> Option<Box<dyn SshSession>> {
        let mut used_cached_credential = false;
        let mut cached_snapshot = None;

        if params.private_key.is_none() && params.password.is_none() {
            let cached = { self.creds.lock().await.get(&key).cloned() };
            match cached {
                Some(cred) => {
                    params.private_key = cred.private_key.clone();
                    params.passphrase = cred.passphrase.clone();
                    params.password = cred.password.clone();
                    used_cached_credential = true;
                    cached_snapshot = Some(cred);
                }
                None => {
                    observer.unconnected("no credentials provided");
                    return None;
                }
            }
        }

        loop {
            match self.connector.establish(params.clone(), observer.clone(), challenges.clone()).await {
                Ok(session) => {
                    if !used_cached_credential && !session.challenge_seen() {
                        let sanitized = CachedCredential {
                            private_key: params.private_key.clone(),
                            passphrase: params.passphrase.clone(),
                            password: params.password.clone(),
                        };
                        self.creds.lock().await.insert(key.clone(), sanitized);
                    }
                    observer.connected(session.fingerprint(), session.banner());
                    return Some(session);
                }
                Err(err) => {
                    let is_auth_failure = matches!(err, SshAdapterError::ClientAuthentication);
                    if is_auth_failure && params.private_key.take().is_some() && params.password.is_some() {
                        params.passphrase = None;
                        continue;
                    }
                    if is_auth_failure {
                        if let Some(snapshot) = &cached_snapshot {
                            self.evict_credential_if_same(&key, snapshot).await;
                        }
                    }
                    observer.unconnected(err.reason());
                    return None;
                }
            }
        }
    }

    async fn evict_credential_if_same(&self, key: &CacheKey, expected: &CachedCredential) {
        let mut creds = self.creds.lock().await;
        if creds.get(key) == Some(expected) {
            creds.remove(key);
        }
    }

    /// `relinquish(session, mode)` (§4.4): `drop` (or `keep` on a
    /// non-reusable session) closes the transport; `keep`/`share` install
    /// the session in `idle` under a retention timer, returning the share
    /// key for `share`.
    pub async fn relinquish(&self, key: CacheKey, session: Box<dyn SshSession>, mode: RelinquishMode) -> Option<String> {
        match mode {
            RelinquishMode::Drop => {
                session.close().await;
                None
            }
            RelinquishMode::Keep => {
                if !session.is_reusable() {
                    session.close().await;
                    return None;
                }
                self.install_idle(PoolKey { base: key, share_key: None }, session, self.reusable_ttl).await;
                None
            }
            RelinquishMode::Share => {
                if !session.is_reusable() {
                    session.close().await;
                    return None;
                }
                let mut session = session;
                let share_key = session.share_key_or_assign(generate_share_key());
                self.install_idle(
                    PoolKey { base: key, share_key: Some(share_key.clone()) },
                    session,
                    self.share_ttl,
                )
                .await;
                Some(share_key)
            }
        }
    }

    async fn install_idle(&self, pool_key: PoolKey, mut session: Box<dyn SshSession>, ttl: Duration) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.rebind_observer(Observer::new(tx));

        let old = { self.idle.lock().await.remove(&pool_key) };
        if let Some(old) = old {
            old.timer.abort();
            old.watcher.abort();
            old.session.close().await;
        }

        let watch_key = pool_key.clone();
        let watch_weak = self.weak_self();
        let watcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, ssh_bridge_ssh::Event::Disconnected { .. }) {
                    if let Some(pool) = watch_weak.upgrade() {
                        pool.evict_now(&watch_key).await;
                    }
                    break;
                }
            }
        });

        let timer_key = pool_key.clone();
        let timer_weak = self.weak_self();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(pool) = timer_weak.upgrade() {
                pool.evict_now(&timer_key).await;
            }
        });

        self.idle.lock().await.insert(pool_key, IdleEntry { session, timer, watcher });
    }

    async fn evict_now(&self, key: &PoolKey) {
        let removed = { self.idle.lock().await.remove(key) };
        if let Some(entry) = removed {
            entry.timer.abort();
            entry.watcher.abort();
            entry.session.close().await;
        }
    }

    /// Drains every idle session, relinquishing each with `drop` (§4.4
    /// shutdown invariant).
    pub async fn clear(&self) {
        let entries: Vec<IdleEntry> = { self.idle.lock().await.drain().map(|(_, v)| v).collect() };
        for entry in entries {
            entry.timer.abort();
            entry.watcher.abort();
            entry.session.close().await;
        }
    }

    #[cfg(test)]
    async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }

    #[cfg(test)]
    async fn cred_len(&self) -> usize {
        self.creds.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ssh_bridge_ssh::SshAdapterError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSession {
        fingerprint: String,
        reusable: Arc<AtomicBool>,
        challenge_seen: bool,
        share_key: Option<String>,
        banner: Option<String>,
    }

    #[async_trait]
    impl SshSession for FakeSession {
        fn fingerprint(&self) -> String {
            self.fingerprint.clone()
        }
        fn is_reusable(&self) -> bool {
            self.reusable.load(Ordering::SeqCst)
        }
        fn share_key_or_assign(&mut self, candidate: String) -> String {
            match &self.share_key {
                Some(key) => key.clone(),
                None => {
                    self.share_key = Some(candidate.clone());
                    candidate
                }
            }
        }
        fn rebind_observer(&mut self, _observer: Observer) {}
        async fn exec(&mut self, _command: &str, _pty: bool, _observer: Observer) {}
        fn write_stdin(&mut self, _bytes: Vec<u8>) {}
        fn end_stdin(&mut self) {}
        fn resize(&mut self, _rows: i32, _cols: i32) {}
        async fn respond_to_challenge(&self, _responses: Vec<String>) -> bool {
            false
        }
        async fn close(self: Box<Self>) {}
        fn challenge_seen(&self) -> bool {
            self.challenge_seen
        }
        fn banner(&self) -> Option<String> {
            self.banner.clone()
        }
    }

    struct FakeConnector {
        calls: AtomicUsize,
        script: Mutex<Vec<Result<(), SshAdapterError>>>,
    }

    impl FakeConnector {
        fn scripted(script: Vec<Result<(), SshAdapterError>>) -> FakeConnector {
            FakeConnector { calls: AtomicUsize::new(0), script: Mutex::new(script) }
        }
    }

    #[async_trait]
    impl SshConnector for FakeConnector {
        async fn establish(
            &self,
            params: ConnectParams,
            _observer: Observer,
            _challenges: ChallengeQueue,
        ) -> Result<Box<dyn SshSession>, SshAdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.lock().await.remove(0);
            outcome.map(|()| {
                Box::new(FakeSession {
                    fingerprint: format!("fp-for-{}", params.username),
                    reusable: Arc::new(AtomicBool::new(true)),
                    challenge_seen: false,
                    share_key: None,
                    banner: None,
                }) as Box<dyn SshSession>
            })
        }
    }

    fn test_observer() -> (Observer, mpsc::UnboundedReceiver<ssh_bridge_ssh::Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Observer::new(tx), rx)
    }

    fn test_params() -> ConnectParams {
        ConnectParams {
            username: "u".to_string(),
            hostname: "h".to_string(),
            port: 22,
            fingerprint: None,
            private_key: None,
            passphrase: None,
            password: Some("pw".to_string()),
            try_keyboard: false,
        }
    }

    #[tokio::test]
    async fn connect_caches_credential_on_fresh_success() {
        let connector = Arc::new(FakeConnector::scripted(vec![Ok(())]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, _rx) = test_observer();

        let session = pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await;
        assert!(session.is_some());
        assert_eq!(pool.cred_len().await, 1);
    }

    #[tokio::test]
    async fn connect_without_credentials_and_no_cache_reports_no_credentials() {
        let connector = Arc::new(FakeConnector::scripted(vec![]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, mut rx) = test_observer();

        let mut params = test_params();
        params.password = None;

        let session = pool.connect(key, params, observer, ChallengeQueue::new()).await;
        assert!(session.is_none());
        match rx.recv().await.unwrap() {
            ssh_bridge_ssh::Event::Unconnected { reason } => assert_eq!(reason, "no credentials provided"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_evicts_cached_credential_on_authentication_failure() {
        let connector = Arc::new(FakeConnector::scripted(vec![
            Ok(()),
            Err(SshAdapterError::ClientAuthentication),
        ]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);

        let (observer, _rx) = test_observer();
        pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await;
        assert_eq!(pool.cred_len().await, 1);

        let (observer, mut rx) = test_observer();
        let mut params = test_params();
        params.password = None; // force cache substitution
        let session = pool.connect(key, params, observer, ChallengeQueue::new()).await;
        assert!(session.is_none());
        assert_eq!(pool.cred_len().await, 0);
        match rx.recv().await.unwrap() {
            ssh_bridge_ssh::Event::Unconnected { reason } => assert_eq!(reason, "authentication denied"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relinquish_keep_then_reuse_round_trips() {
        let connector = Arc::new(FakeConnector::scripted(vec![Ok(())]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, _rx) = test_observer();

        let session = pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await.unwrap();
        pool.relinquish(key.clone(), session, RelinquishMode::Keep).await;
        assert_eq!(pool.idle_len().await, 1);

        let (observer, mut rx) = test_observer();
        let reused = pool.reuse(key, None, observer).await;
        assert!(reused.is_some());
        assert_eq!(pool.idle_len().await, 0);
        match rx.recv().await.unwrap() {
            ssh_bridge_ssh::Event::Connected(payload) => assert_eq!(payload.fingerprint, "fp-for-u"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn relinquish_keep_on_non_reusable_session_does_not_idle() {
        let connector = Arc::new(FakeConnector::scripted(vec![Ok(())]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, _rx) = test_observer();

        let mut session = pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await.unwrap();
        session.resize(0, 0); // no-op, just exercising the handle before marking non-reusable
        let reusable_flag = Arc::new(AtomicBool::new(false));
        let non_reusable = Box::new(FakeSession {
            fingerprint: "fp".to_string(),
            reusable: reusable_flag,
            challenge_seen: false,
            share_key: None,
            banner: None,
        });

        pool.relinquish(key, non_reusable, RelinquishMode::Keep).await;
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn reuse_on_empty_pool_reports_miss() {
        let connector = Arc::new(FakeConnector::scripted(vec![]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let (observer, mut rx) = test_observer();

        let result = pool.reuse(CacheKey::new("u", "h", 22), None, observer).await;
        assert!(result.is_none());
        match rx.recv().await.unwrap() {
            ssh_bridge_ssh::Event::Unconnected { reason } => assert_eq!(reason, "no cached connection to reuse"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entry_is_evicted_after_its_ttl() {
        let connector = Arc::new(FakeConnector::scripted(vec![Ok(())]));
        let pool = Pool::new(connector, Duration::from_millis(50), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, _rx) = test_observer();

        let session = pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await.unwrap();
        pool.relinquish(key.clone(), session, RelinquishMode::Keep).await;
        assert_eq!(pool.idle_len().await, 1);

        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn share_returns_same_key_on_repeated_share() {
        let connector = Arc::new(FakeConnector::scripted(vec![Ok(())]));
        let pool = Pool::new(connector, Duration::from_secs(60), Duration::from_secs(5));
        let key = CacheKey::new("u", "h", 22);
        let (observer, _rx) = test_observer();

        let session = pool.connect(key.clone(), test_params(), observer, ChallengeQueue::new()).await.unwrap();
        let first = pool.relinquish(key.clone(), session, RelinquishMode::Share).await.unwrap();

        let (observer, _rx) = test_observer();
        let session = pool.reuse(key.clone(), Some(first.clone()), observer).await.unwrap();
        let second = pool.relinquish(key, session, RelinquishMode::Share).await.unwrap();
        assert_eq!(first, second);
    }
}
