//! Prepared statements and the per-connection statement cache.
//!
//! This module provides:
//! - `StatementState`: a server-side prepared statement shared by reference count
//! - `PreparedStatement`: the explicit, non-cached handle returned by `prepare`
//! - `StatementCache`: LRU cache keyed by query text and row options, with
//!   per-entry lifetime timers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{FieldDescription, Format};
use crate::types::Oid;

/// Column descriptions shared between a statement and its results.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// How result rows are requested and decoded. Part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RowOptions {
    pub format: Format,
}

impl RowOptions {
    pub fn text() -> Self {
        Self {
            format: Format::Text,
        }
    }
}

// ============================================================================
// Statement state
// ============================================================================

/// A statement parsed by the server.
#[derive(Debug)]
pub struct StatementState {
    /// Server-side name; empty for the unnamed statement.
    pub name: String,
    pub query: String,
    pub options: RowOptions,
    pub param_types: Vec<Oid>,
    pub columns: SharedColumns,
    created_at: Instant,
    closed: AtomicBool,
}

impl StatementState {
    pub(crate) fn new(
        name: String,
        query: &str,
        options: RowOptions,
        param_types: Vec<Oid>,
        columns: Vec<FieldDescription>,
    ) -> Self {
        Self {
            name,
            query: query.to_string(),
            options,
            param_types,
            columns: Arc::new(columns),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Closed statements must not be executed again.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }
}

/// An explicitly prepared statement, bypassing the cache.
///
/// The handle is tied to the lease of the connection it was prepared on; once
/// a pooled connection is released, the handle is rejected.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) state: Arc<StatementState>,
    pub(crate) lease: u64,
}

impl PreparedStatement {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn query(&self) -> &str {
        &self.state.query
    }

    pub fn param_types(&self) -> &[Oid] {
        &self.state.param_types
    }

    pub fn columns(&self) -> &SharedColumns {
        &self.state.columns
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

// ============================================================================
// Statement Cache (LRU + lifetime timers)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    options: RowOptions,
}

/// Called with every statement evicted by overflow, expiry or `clear`.
pub type EvictionCallback = Arc<dyn Fn(Arc<StatementState>) + Send + Sync>;

struct Entry {
    statement: Arc<StatementState>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    serial: u64,
}

impl Entry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    max_size: usize,
    max_lifetime: Duration,
    next_serial: u64,
}

impl Inner {
    fn enabled(&self) -> bool {
        self.max_size > 0 && !self.max_lifetime.is_zero()
    }

    fn trim(&mut self, evicted: &mut Vec<Arc<StatementState>>) {
        while self.entries.len() > self.max_size {
            match self.entries.pop_lru() {
                Some((_, mut entry)) => {
                    entry.cancel_timer();
                    evicted.push(entry.statement);
                }
                None => break,
            }
        }
    }
}

/// LRU cache of prepared statements for one connection.
///
/// Cloning yields another handle onto the same cache, which is how the pool
/// invalidates the caches of connections it does not currently hold.
#[derive(Clone)]
pub struct StatementCache {
    inner: Arc<Mutex<Inner>>,
    on_remove: EvictionCallback,
}

impl StatementCache {
    pub fn new(max_size: usize, max_lifetime: Duration, on_remove: EvictionCallback) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::unbounded(),
                max_size,
                max_lifetime,
                next_serial: 0,
            })),
            on_remove,
        }
    }

    /// Look up a statement, promoting it to most recently used.
    ///
    /// Statements marked closed are purged and reported as a miss.
    pub fn get(&self, query: &str, options: RowOptions) -> Option<Arc<StatementState>> {
        let key = CacheKey {
            query: query.to_string(),
            options,
        };
        let mut expired = None;
        let found = {
            let mut inner = self.inner.lock();
            if !inner.enabled() {
                return None;
            }
            let (closed, stale) = match inner.entries.peek(&key) {
                None => return None,
                Some(entry) => (
                    entry.statement.is_closed(),
                    entry.deadline.is_some_and(|d| d <= Instant::now()),
                ),
            };
            if closed || stale {
                if let Some(mut entry) = inner.entries.pop(&key) {
                    entry.cancel_timer();
                    if !closed {
                        expired = Some(entry.statement);
                    }
                }
                None
            } else {
                inner.entries.get(&key).map(|e| Arc::clone(&e.statement))
            }
        };
        if let Some(statement) = expired {
            (self.on_remove)(statement);
        }
        found
    }

    /// Insert at the most recently used position, evicting from the other end
    /// on overflow. A no-op while the cache is disabled.
    pub fn put(&self, query: &str, options: RowOptions, statement: Arc<StatementState>) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.enabled() {
                return;
            }
            let key = CacheKey {
                query: query.to_string(),
                options,
            };
            let serial = inner.next_serial;
            inner.next_serial += 1;
            let lifetime = inner.max_lifetime;
            let entry = Entry {
                statement: Arc::clone(&statement),
                deadline: Instant::now().checked_add(lifetime),
                timer: self.arm_timer(key.clone(), serial, lifetime),
                serial,
            };
            if let Some(mut replaced) = inner.entries.put(key, entry) {
                replaced.cancel_timer();
                if !Arc::ptr_eq(&replaced.statement, &statement) {
                    evicted.push(replaced.statement);
                }
            }
            inner.trim(&mut evicted);
        }
        self.notify(evicted);
    }

    pub fn contains(&self, query: &str, options: RowOptions) -> bool {
        self.inner.lock().entries.contains(&CacheKey {
            query: query.to_string(),
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn max_lifetime(&self) -> Duration {
        self.inner.lock().max_lifetime
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled()
    }

    /// Change the bound; shrinking evicts immediately.
    pub fn set_max_size(&self, max_size: usize) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.max_size = max_size;
            inner.trim(&mut evicted);
        }
        self.notify(evicted);
    }

    /// Change the lifetime and restart every entry's timer with it.
    pub fn set_max_lifetime(&self, max_lifetime: Duration) {
        let mut inner = self.inner.lock();
        inner.max_lifetime = max_lifetime;
        let now = Instant::now();
        let rearm: Vec<(CacheKey, u64)> = inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.serial))
            .collect();
        for (key, serial) in rearm {
            let timer = self.arm_timer(key.clone(), serial, max_lifetime);
            if let Some(entry) = inner.entries.peek_mut(&key) {
                entry.cancel_timer();
                entry.deadline = now.checked_add(max_lifetime);
                entry.timer = timer;
            }
        }
    }

    /// Remove every entry, handing each statement to the eviction callback.
    pub fn clear(&self) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some((_, mut entry)) = inner.entries.pop_lru() {
                entry.cancel_timer();
                evicted.push(entry.statement);
            }
        }
        self.notify(evicted);
    }

    /// Every cached statement, most recently used first.
    pub fn statements(&self) -> Vec<Arc<StatementState>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, e)| Arc::clone(&e.statement))
            .collect()
    }

    fn notify(&self, evicted: Vec<Arc<StatementState>>) {
        for statement in evicted {
            (self.on_remove)(statement);
        }
    }

    /// Schedule removal of the entry `(key, serial)` after `lifetime`.
    ///
    /// Outside a tokio runtime no timer is armed and expiry is detected on
    /// the next `get`.
    fn arm_timer(&self, key: CacheKey, serial: u64, lifetime: Duration) -> Option<JoinHandle<()>> {
        if lifetime.is_zero() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let on_remove = Arc::clone(&self.on_remove);
        Some(runtime.spawn(async move {
            tokio::time::sleep(lifetime).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = {
                let mut inner = inner.lock();
                match inner.entries.peek(&key) {
                    Some(entry) if entry.serial == serial => {
                        inner.entries.pop(&key).map(|e| e.statement)
                    }
                    _ => None,
                }
            };
            if let Some(statement) = expired {
                debug!(statement = %statement.name, "cached statement reached its maximum lifetime");
                on_remove(statement);
            }
        }))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.cancel_timer();
        }
    }
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StatementCache")
            .field("len", &inner.entries.len())
            .field("max_size", &inner.max_size)
            .field("max_lifetime", &inner.max_lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_cache(max_size: usize, lifetime: Duration) -> (StatementCache, Arc<Mutex<Vec<String>>>) {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let cache = StatementCache::new(
            max_size,
            lifetime,
            Arc::new(move |stmt: Arc<StatementState>| sink.lock().push(stmt.name.clone())),
        );
        (cache, removed)
    }

    fn stmt(name: &str, query: &str) -> Arc<StatementState> {
        Arc::new(StatementState::new(
            name.to_string(),
            query,
            RowOptions::default(),
            Vec::new(),
            Vec::new(),
        ))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_put_then_get_returns_same_handle() {
        let (cache, _) = recording_cache(10, HOUR);
        let s = stmt("s1", "SELECT 1");
        cache.put("SELECT 1", RowOptions::default(), Arc::clone(&s));
        let hit = cache.get("SELECT 1", RowOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&hit, &s));
    }

    #[test]
    fn test_options_are_part_of_the_key() {
        let (cache, _) = recording_cache(10, HOUR);
        cache.put("SELECT 1", RowOptions::default(), stmt("s1", "SELECT 1"));
        assert!(cache.get("SELECT 1", RowOptions::text()).is_none());
        assert!(cache.get("SELECT 1", RowOptions::default()).is_some());
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let (cache, removed) = recording_cache(2, HOUR);
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));
        cache.put("q2", RowOptions::default(), stmt("s2", "q2"));
        // touch q1 so q2 becomes the eviction candidate
        assert!(cache.get("q1", RowOptions::default()).is_some());
        cache.put("q3", RowOptions::default(), stmt("s3", "q3"));

        assert_eq!(*removed.lock(), vec!["s2".to_string()]);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("q1", RowOptions::default()));
        assert!(!cache.contains("q2", RowOptions::default()));
    }

    #[test]
    fn test_closed_statement_is_purged_on_get() {
        let (cache, removed) = recording_cache(10, HOUR);
        let s = stmt("s1", "q1");
        cache.put("q1", RowOptions::default(), Arc::clone(&s));
        s.mark_closed();

        assert!(cache.get("q1", RowOptions::default()).is_none());
        assert!(cache.is_empty());
        assert!(removed.lock().is_empty());
    }

    #[test]
    fn test_zero_size_disables_cache() {
        let (cache, removed) = recording_cache(10, HOUR);
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));
        cache.set_max_size(0);
        assert_eq!(*removed.lock(), vec!["s1".to_string()]);

        cache.put("q2", RowOptions::default(), stmt("s2", "q2"));
        assert!(cache.get("q2", RowOptions::default()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_lifetime_disables_cache() {
        let (cache, _) = recording_cache(10, HOUR);
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));
        cache.set_max_lifetime(Duration::ZERO);
        assert!(!cache.is_enabled());
        assert!(cache.get("q1", RowOptions::default()).is_none());
    }

    #[test]
    fn test_shrinking_trims_immediately() {
        let (cache, removed) = recording_cache(5, HOUR);
        for i in 0..5 {
            let q = format!("q{}", i);
            cache.put(&q, RowOptions::default(), stmt(&format!("s{}", i), &q));
        }
        cache.set_max_size(2);
        assert_eq!(cache.len(), 2);
        assert_eq!(
            *removed.lock(),
            vec!["s0".to_string(), "s1".to_string(), "s2".to_string()]
        );
    }

    #[test]
    fn test_clear_reports_every_statement() {
        let (cache, removed) = recording_cache(5, HOUR);
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));
        cache.put("q2", RowOptions::default(), stmt("s2", "q2"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(removed.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_timer_evicts_entry() {
        let (cache, removed) = recording_cache(5, Duration::from_secs(10));
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cache.contains("q1", RowOptions::default()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!cache.contains("q1", RowOptions::default()));
        assert_eq!(*removed.lock(), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changing_lifetime_rearms_timers() {
        let (cache, removed) = recording_cache(5, Duration::from_secs(10));
        cache.put("q1", RowOptions::default(), stmt("s1", "q1"));

        tokio::time::sleep(Duration::from_secs(8)).await;
        cache.set_max_lifetime(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(cache.get("q1", RowOptions::default()).is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!cache.contains("q1", RowOptions::default()));
        assert_eq!(removed.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_entry_keeps_new_timer() {
        let (cache, removed) = recording_cache(5, Duration::from_secs(10));
        cache.put("q1", RowOptions::default(), stmt("old", "q1"));
        tokio::time::sleep(Duration::from_secs(6)).await;
        cache.put("q1", RowOptions::default(), stmt("new", "q1"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let hit = cache.get("q1", RowOptions::default()).unwrap();
        assert_eq!(hit.name, "new");
        assert_eq!(*removed.lock(), vec!["old".to_string()]);
    }
}
