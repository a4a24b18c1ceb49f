//! Connection cache: one remote session per (server, user) pair.
//!
//! The shared cluster configuration is created on the first `acquire` and
//! lives until [`ConnectionCache::shutdown_all`] (or drop). Sessions are
//! never evicted; `release` only marks the end of a scan's borrow.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use cass_store::{Cluster, Driver, Session};
use tracing::{debug, info, warn};

use crate::catalog::{ForeignServer, ServerId, UserId, UserMapping};
use crate::error::{FdwError, FdwResult};
use crate::metrics::ScanMetrics;
use crate::options::connect_config;

/// Cache key: one session per server/user pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub server_id: ServerId,
    pub user_id: UserId,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.user_id)
    }
}

#[derive(Default)]
struct ConnectionEntry {
    session: Option<Arc<dyn Session>>,
    xact_depth: u32,
    have_prep_stmt: bool,
    have_error: bool,
}

/// Observable state of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEntryState {
    pub connected: bool,
    pub xact_depth: u32,
    pub have_prep_stmt: bool,
    pub have_error: bool,
}

/// A session borrowed from the cache for the duration of one scan.
#[derive(Clone)]
pub struct SessionHandle {
    key: ConnectionKey,
    session: Arc<dyn Session>,
}

impl SessionHandle {
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Returns `true` if both handles refer to the same remote session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Process-scoped cache of remote sessions.
///
/// Creation is serialized per key: concurrent acquires of the same unseen
/// key wait for a single connect, while other keys proceed independently.
pub struct ConnectionCache {
    driver: Arc<dyn Driver>,
    cluster: OnceLock<Arc<dyn Cluster>>,
    entries: Mutex<HashMap<ConnectionKey, Arc<Mutex<ConnectionEntry>>>>,
    shutdown_hook_registered: AtomicBool,
    shut_down: AtomicBool,
    metrics: Option<Arc<ScanMetrics>>,
}

impl ConnectionCache {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            cluster: OnceLock::new(),
            entries: Mutex::new(HashMap::new()),
            shutdown_hook_registered: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the cached session for `(server, user)`, connecting on a miss.
    ///
    /// A failed connect leaves the entry without a session so the next
    /// acquire retries.
    pub fn acquire(
        &self,
        server: &ForeignServer,
        user: &UserMapping,
        will_prep_stmt: bool,
    ) -> FdwResult<SessionHandle> {
        if self.is_shut_down() {
            return Err(shut_down_error(server));
        }

        let key = ConnectionKey {
            server_id: server.id,
            user_id: user.user_id,
        };
        let slot = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(entries.entry(key).or_default())
        };
        let mut entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // shutdown_all raises the flag before draining, so a slot it has
        // already swept fails here.
        if self.is_shut_down() {
            return Err(shut_down_error(server));
        }

        if let Some(session) = &entry.session {
            let session = Arc::clone(session);
            entry.have_prep_stmt |= will_prep_stmt;
            self.record_lookup(true);
            debug!(%key, "reusing cached cassandra session");
            return Ok(SessionHandle { key, session });
        }
        self.record_lookup(false);

        entry.xact_depth = 0;
        entry.have_prep_stmt = false;
        entry.have_error = false;

        let config = connect_config(&server.options, &user.options);
        match self.cluster().connect(&config) {
            Ok(session) => {
                info!(
                    %key,
                    server = %server.name,
                    contact_points = %config.contact_points,
                    "new cassandra connection"
                );
                entry.session = Some(Arc::clone(&session));
                entry.have_prep_stmt = will_prep_stmt;
                Ok(SessionHandle { key, session })
            }
            Err(err) => {
                entry.have_error = true;
                if let Some(metrics) = &self.metrics {
                    metrics.record_connect_failure();
                }
                warn!(%key, server = %server.name, error = %err, "cassandra connect failed");
                Err(FdwError::Connection {
                    server: server.name.clone(),
                    detail: err.to_string(),
                })
            }
        }
    }

    /// Ends a scan's borrow. Sessions stay open until shutdown.
    pub fn release(&self, handle: SessionHandle) {
        debug!(key = %handle.key, "released cassandra session");
    }

    /// State of the entry for `key`, if one was ever created.
    pub fn entry_state(&self, key: ConnectionKey) -> Option<ConnectionEntryState> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = entries.get(&key)?;
        let entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(ConnectionEntryState {
            connected: entry.session.is_some(),
            xact_depth: entry.xact_depth,
            have_prep_stmt: entry.have_prep_stmt,
            have_error: entry.have_error,
        })
    }

    /// Number of entries holding a live session.
    pub fn session_count(&self) -> usize {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .values()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .session
                    .is_some()
            })
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Closes every cached session and the shared cluster. Idempotent.
    pub fn shutdown_all(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.drain().map(|(_, slot)| slot).collect::<Vec<_>>()
        };
        let mut closed = 0usize;
        for slot in slots {
            let mut entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(session) = entry.session.take() {
                session.close();
                closed += 1;
            }
        }
        if let Some(cluster) = self.cluster.get() {
            cluster.close();
        }
        info!(sessions = closed, "cassandra connection cache shut down");
    }

    fn cluster(&self) -> &Arc<dyn Cluster> {
        self.cluster.get_or_init(|| {
            // The shutdown hook is tied to the cluster's lifetime, so it is
            // registered exactly once.
            if !self.shutdown_hook_registered.swap(true, Ordering::SeqCst) {
                debug!("registered connection cache shutdown hook");
            }
            self.driver.new_cluster()
        })
    }

    fn record_lookup(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(hit);
        }
    }
}

fn shut_down_error(server: &ForeignServer) -> FdwError {
    FdwError::Connection {
        server: server.name.clone(),
        detail: "connection cache has been shut down".to_string(),
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        if self.shutdown_hook_registered.load(Ordering::SeqCst) {
            self.shutdown_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use cass_store::MemoryNode;

    use super::*;
    use crate::options::{ServerOptions, UserMappingOptions};

    fn server(id: u32, url: &str) -> ForeignServer {
        ForeignServer {
            id: ServerId(id),
            name: format!("cass{id}"),
            options: ServerOptions::new(url),
        }
    }

    fn mapping(server: &ForeignServer, user: u32) -> UserMapping {
        UserMapping {
            user_id: UserId(user),
            server_id: server.id,
            options: UserMappingOptions::default(),
        }
    }

    #[test]
    fn same_key_reuses_session() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = ConnectionCache::new(Arc::new(node.clone()));
        let server = server(1, "10.0.0.1");
        let user = mapping(&server, 1);

        let first = cache.acquire(&server, &user, false).expect("first acquire");
        let second = cache.acquire(&server, &user, true).expect("second acquire");
        assert!(first.same_session(&second));
        assert_eq!(node.stats().connects, 1);

        let state = cache.entry_state(first.key()).expect("entry");
        assert!(state.connected);
        assert!(state.have_prep_stmt);
    }

    #[test]
    fn distinct_keys_get_distinct_sessions_on_one_cluster() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = ConnectionCache::new(Arc::new(node.clone()));
        let server_a = server(1, "10.0.0.1");
        let server_b = server(2, "10.0.0.1");

        let a1 = cache
            .acquire(&server_a, &mapping(&server_a, 1), false)
            .expect("a1");
        let a2 = cache
            .acquire(&server_a, &mapping(&server_a, 2), false)
            .expect("a2");
        let b1 = cache
            .acquire(&server_b, &mapping(&server_b, 1), false)
            .expect("b1");
        assert!(!a1.same_session(&a2));
        assert!(!a1.same_session(&b1));
        assert!(!a2.same_session(&b1));
        assert_eq!(cache.session_count(), 3);
        assert_eq!(node.stats().clusters_created, 1);
    }

    #[test]
    fn failed_connect_leaves_entry_retryable() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = ConnectionCache::new(Arc::new(node.clone()));
        let bad = server(1, "10.9.9.9");
        let user = mapping(&bad, 1);

        let err = cache
            .acquire(&bad, &user, false)
            .expect_err("unreachable contact point");
        match err {
            FdwError::Connection { server, detail } => {
                assert_eq!(server, "cass1");
                assert!(detail.contains("No hosts available"), "detail: {detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let key = ConnectionKey {
            server_id: ServerId(1),
            user_id: UserId(1),
        };
        let state = cache.entry_state(key).expect("entry kept");
        assert!(!state.connected);
        assert!(state.have_error);

        // Same key, now reachable.
        let fixed = ForeignServer {
            options: ServerOptions::new("10.0.0.1"),
            ..bad
        };
        cache.acquire(&fixed, &user, false).expect("retry succeeds");
        assert!(cache.entry_state(key).expect("entry").connected);
    }

    #[test]
    fn default_credentials_are_presented() {
        let node = MemoryNode::new("10.0.0.1").with_user("cassandra", "cassandra");
        let cache = ConnectionCache::new(Arc::new(node));
        let server = server(1, "10.0.0.1");
        cache
            .acquire(&server, &mapping(&server, 1), false)
            .expect("default credentials accepted");
    }

    #[test]
    fn concurrent_first_acquires_open_one_session() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = Arc::new(ConnectionCache::new(Arc::new(node.clone())));
        let server = server(1, "10.0.0.1");
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let server = server.clone();
                thread::spawn(move || {
                    let user = mapping(&server, 1);
                    barrier.wait();
                    cache.acquire(&server, &user, false).expect("acquire")
                })
            })
            .collect::<Vec<_>>();
        let sessions = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect::<Vec<_>>();

        assert_eq!(node.stats().connects, 1);
        assert!(sessions.iter().all(|handle| handle.same_session(&sessions[0])));
    }

    #[test]
    fn shutdown_closes_sessions_and_cluster_once() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = ConnectionCache::new(Arc::new(node.clone()));
        let server = server(1, "10.0.0.1");
        let handle = cache
            .acquire(&server, &mapping(&server, 1), false)
            .expect("acquire");
        cache.release(handle);
        assert!(!cache.is_shut_down());
        cache.shutdown_all();
        cache.shutdown_all();
        assert!(cache.is_shut_down());
        drop(cache);

        let stats = node.stats();
        assert_eq!(stats.sessions_closed, 1);
        assert_eq!(stats.clusters_closed, 1);
    }

    #[test]
    fn shutdown_racing_acquires_leaves_no_open_session() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = Arc::new(ConnectionCache::new(Arc::new(node.clone())));
        let server = server(1, "10.0.0.1");
        let barrier = Arc::new(Barrier::new(9));

        let acquirers = (0..8)
            .map(|user| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let server = server.clone();
                thread::spawn(move || {
                    let user = mapping(&server, user);
                    barrier.wait();
                    cache.acquire(&server, &user, false).is_ok()
                })
            })
            .collect::<Vec<_>>();
        barrier.wait();
        cache.shutdown_all();
        for acquirer in acquirers {
            acquirer.join().expect("join");
        }

        assert_eq!(cache.session_count(), 0);
        let stats = node.stats();
        assert_eq!(stats.sessions_closed, stats.connects);
        assert!(stats.clusters_closed <= 1);
    }

    #[test]
    fn acquire_after_shutdown_fails() {
        let node = MemoryNode::new("10.0.0.1");
        let cache = ConnectionCache::new(Arc::new(node));
        cache.shutdown_all();
        let server = server(1, "10.0.0.1");
        assert!(matches!(
            cache.acquire(&server, &mapping(&server, 1), false),
            Err(FdwError::Connection { .. })
        ));
    }
}
