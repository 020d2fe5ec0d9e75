//! Correlation registry: the rendezvous point between request handlers
//! waiting for a reply and the poller delivering replies.
//!
//! Each correlation id maps to its own entry with its own lock and wake-up
//! signal, so settling one id never contends with a waiter on another. The
//! map shard lock is only held for insert, lookup and removal, and always
//! before the entry lock.

use crate::error::BridgeError;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// A waiter registered, no reply yet.
    Pending,
    /// Reply available for the waiter.
    Resolved,
    /// Terminal error available for the waiter.
    Failed,
    /// Reply arrived before anyone registered for it.
    Orphan,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Resolved => "resolved",
            EntryStatus::Failed => "failed",
            EntryStatus::Orphan => "orphan",
        };
        f.write_str(status)
    }
}

/// What happened to a reply handed to [`CorrelationRegistry::resolve`] or
/// [`CorrelationRegistry::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// A pending waiter now owns the result.
    Claimed,
    /// Nobody was waiting; the result is parked until claimed or reaped.
    Orphaned,
    /// The id was already settled; the duplicate was dropped.
    Rejected,
}

enum Slot<T> {
    Pending,
    Resolved(T),
    Failed(String),
    Orphan(Result<T, String>),
}

impl<T> Slot<T> {
    fn status(&self) -> EntryStatus {
        match self {
            Slot::Pending => EntryStatus::Pending,
            Slot::Resolved(_) => EntryStatus::Resolved,
            Slot::Failed(_) => EntryStatus::Failed,
            Slot::Orphan(_) => EntryStatus::Orphan,
        }
    }

    /// Turns an orphan into the settled state its new owner reads. Leaves any
    /// other state untouched and returns false.
    fn claim_orphan(&mut self) -> bool {
        match mem::replace(self, Slot::Pending) {
            Slot::Orphan(Ok(payload)) => *self = Slot::Resolved(payload),
            Slot::Orphan(Err(error)) => *self = Slot::Failed(error),
            other => {
                *self = other;
                return false;
            }
        }
        true
    }
}

struct CorrelationEntry<T> {
    created_at: Instant,
    slot:       Mutex<Slot<T>>,
    signal:     Notify,
}

impl<T: Clone> CorrelationEntry<T> {
    fn new(slot: Slot<T>) -> Arc<Self> {
        Arc::new(Self {
            created_at: Instant::now(),
            slot:       Mutex::new(slot),
            signal:     Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // Slot updates are single assignments, a poisoned lock holds a
        // consistent value.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settled(&self) -> Option<Result<T, BridgeError>> {
        match &*self.lock() {
            Slot::Resolved(payload) => Some(Ok(payload.clone())),
            Slot::Failed(error) => Some(Err(BridgeError::Failed(error.clone()))),
            Slot::Pending | Slot::Orphan(_) => None,
        }
    }
}

/// Proof of registration for one correlation id, returned by
/// [`CorrelationRegistry::register`] and consumed by
/// [`CorrelationRegistry::await_result`].
pub struct CorrelationHandle<T> {
    correlation_id: String,
    entry:          Arc<CorrelationEntry<T>>,
}

impl<T: Clone> CorrelationHandle<T> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Whether a result is already available, i.e. awaiting will not block.
    pub fn is_ready(&self) -> bool {
        self.entry.settled().is_some()
    }
}

impl<T> fmt::Debug for CorrelationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationHandle")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

pub struct CorrelationRegistry<T> {
    entries: DashMap<String, Arc<CorrelationEntry<T>>>,
}

impl<T: Clone> Default for CorrelationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CorrelationRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<T: Clone> CorrelationRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Registers a waiter for `correlation_id`.
    ///
    /// Fails with [`BridgeError::Conflict`] when the id is already tracked by
    /// another waiter. An orphaned reply for the id is claimed on the spot and
    /// the returned handle is already satisfied.
    pub fn register(&self, correlation_id: &str) -> Result<CorrelationHandle<T>, BridgeError> {
        match self.entries.entry(correlation_id.to_owned()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                let mut slot = entry.lock();
                if !slot.claim_orphan() {
                    tracing::debug!(
                        correlation_id,
                        status = %slot.status(),
                        "Registration rejected, id already tracked"
                    );
                    return Err(BridgeError::Conflict(correlation_id.to_owned()));
                }
                drop(slot);
                tracing::debug!(correlation_id, "Registered and claimed orphaned reply");
                Ok(CorrelationHandle {
                    correlation_id: correlation_id.to_owned(),
                    entry:          Arc::clone(entry),
                })
            }
            Entry::Vacant(vacant) => {
                let entry = CorrelationEntry::new(Slot::Pending);
                vacant.insert(Arc::clone(&entry));
                tracing::debug!(correlation_id, "Registered waiter");
                Ok(CorrelationHandle {
                    correlation_id: correlation_id.to_owned(),
                    entry,
                })
            }
        }
    }

    /// Waits until the handle's entry is settled or `timeout` elapses.
    ///
    /// Only the entry's own signal is awaited. On timeout the entry is removed
    /// before returning, so a reply arriving later becomes a fresh orphan
    /// instead of completing this wait.
    pub async fn await_result(
        &self,
        handle: &CorrelationHandle<T>,
        timeout: Duration,
    ) -> Result<T, BridgeError> {
        let deadline = Instant::now() + timeout;

        loop {
            // `notify_one` stores a permit when nobody is waiting yet, so a
            // settle racing with this check is never missed.
            let notified = handle.entry.signal.notified();
            if let Some(result) = handle.entry.settled() {
                return result;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.release(handle);
                // Settled between the deadline and the removal.
                if let Some(result) = handle.entry.settled() {
                    return result;
                }
                tracing::debug!(
                    correlation_id = handle.correlation_id(),
                    ?timeout,
                    "Timed out waiting for reply"
                );
                return Err(BridgeError::Timeout(timeout));
            }
        }
    }

    /// Delivers a reply. Wakes the pending waiter, parks the payload as an
    /// orphan when nobody is registered, and rejects duplicates.
    pub fn resolve(&self, correlation_id: &str, payload: T) -> ResolveOutcome {
        self.settle(correlation_id, Ok(payload), true)
            .unwrap_or(ResolveOutcome::Orphaned)
    }

    /// Like [`CorrelationRegistry::resolve`] but stores a terminal error.
    pub fn fail(&self, correlation_id: &str, error: impl Into<String>) -> ResolveOutcome {
        self.settle(correlation_id, Err(error.into()), true)
            .unwrap_or(ResolveOutcome::Orphaned)
    }

    /// Delivers a reply only if the id is tracked. Returns `None`, dropping
    /// the payload, when there is no entry for it.
    pub fn resolve_tracked(&self, correlation_id: &str, payload: T) -> Option<ResolveOutcome> {
        self.settle(correlation_id, Ok(payload), false)
    }

    /// Like [`CorrelationRegistry::resolve_tracked`] but stores a terminal
    /// error.
    pub fn fail_tracked(
        &self,
        correlation_id: &str,
        error: impl Into<String>,
    ) -> Option<ResolveOutcome> {
        self.settle(correlation_id, Err(error.into()), false)
    }

    fn settle(
        &self,
        correlation_id: &str,
        outcome: Result<T, String>,
        create_orphan: bool,
    ) -> Option<ResolveOutcome> {
        match self.entries.entry(correlation_id.to_owned()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                let mut slot = entry.lock();
                if !matches!(*slot, Slot::Pending) {
                    tracing::warn!(
                        correlation_id,
                        status = %slot.status(),
                        "Conflicting reply rejected, id already settled"
                    );
                    return Some(ResolveOutcome::Rejected);
                }
                *slot = match outcome {
                    Ok(payload) => Slot::Resolved(payload),
                    Err(error) => Slot::Failed(error),
                };
                drop(slot);
                entry.signal.notify_one();
                Some(ResolveOutcome::Claimed)
            }
            Entry::Vacant(vacant) if create_orphan => {
                vacant.insert(CorrelationEntry::new(Slot::Orphan(outcome)));
                tracing::debug!(correlation_id, "Reply parked as orphan");
                Some(ResolveOutcome::Orphaned)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Removes whatever is tracked under `correlation_id`. Idempotent.
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Removes the entry `handle` was issued for, and only that one: if the id
    /// has since been re-registered, the newer entry stays.
    pub fn release(&self, handle: &CorrelationHandle<T>) -> bool {
        self.entries
            .remove_if(&handle.correlation_id, |_, entry| {
                Arc::ptr_eq(entry, &handle.entry)
            })
            .is_some()
    }

    pub fn status(&self, correlation_id: &str) -> Option<EntryStatus> {
        self.entries
            .get(correlation_id)
            .map(|entry| entry.lock().status())
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts every settled or orphaned entry created at least `grace` before
    /// `now`. Returns how many were evicted.
    ///
    /// Pending entries are never evicted: a waiter still owns them and
    /// removes them itself when it returns.
    pub fn reap_older_than(&self, grace: Duration, now: Instant) -> usize {
        let mut evicted = 0;
        self.entries.retain(|correlation_id, entry| {
            let keep = now.saturating_duration_since(entry.created_at) < grace
                || matches!(*entry.lock(), Slot::Pending);
            if !keep {
                evicted += 1;
                tracing::debug!(
                    correlation_id = %correlation_id,
                    status = %entry.lock().status(),
                    "Reaping expired entry"
                );
            }
            keep
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_resolve_wakes_pending_waiter() {
        let registry = Arc::new(CorrelationRegistry::<Value>::new());
        let handle = registry.register("abc").unwrap();
        assert_eq!(registry.status("abc"), Some(EntryStatus::Pending));
        assert!(!handle.is_ready());

        let resolver = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                registry.resolve("abc", json!({"sku": "X"}))
            })
        };

        let result = registry.await_result(&handle, TIMEOUT).await.unwrap();
        assert_eq!(result, json!({"sku": "X"}));
        assert_eq!(resolver.await.unwrap(), ResolveOutcome::Claimed);
        assert_eq!(registry.status("abc"), Some(EntryStatus::Resolved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_is_claimed_at_registration_without_blocking() {
        let registry = CorrelationRegistry::<Value>::new();
        assert_eq!(
            registry.resolve("early", json!(["p1"])),
            ResolveOutcome::Orphaned
        );
        assert_eq!(registry.status("early"), Some(EntryStatus::Orphan));

        let handle = registry.register("early").unwrap();
        assert!(handle.is_ready());
        assert_eq!(registry.status("early"), Some(EntryStatus::Resolved));

        let started = Instant::now();
        let result = registry
            .await_result(&handle, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result, json!(["p1"]));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_orphaned_failure_is_claimed_as_failure() {
        let registry = CorrelationRegistry::<Value>::new();
        assert_eq!(
            registry.fail("early", "catalog unavailable"),
            ResolveOutcome::Orphaned
        );

        let handle = registry.register("early").unwrap();
        assert_eq!(registry.status("early"), Some(EntryStatus::Failed));
        assert_eq!(
            registry.await_result(&handle, TIMEOUT).await,
            Err(BridgeError::Failed("catalog unavailable".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_has_single_winner() {
        for round in 0..50 {
            let registry = Arc::new(CorrelationRegistry::<Value>::new());
            let barrier = Arc::new(Barrier::new(2));
            let id = format!("dup-{round}");

            let attempts = (0..2).map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let id = id.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.register(&id).map(|_| ())
                })
            });
            let results = join_all(attempts).await;

            let winners = results.iter().filter(|r| matches!(r, Ok(Ok(())))).count();
            let conflicts = results
                .iter()
                .filter(|r| matches!(r, Ok(Err(BridgeError::Conflict(_)))))
                .count();
            assert_eq!((winners, conflicts), (1, 1), "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiters_only_receive_their_own_reply() {
        const N: usize = 64;
        let registry = Arc::new(CorrelationRegistry::<Value>::new());

        let handles = (0..N)
            .map(|i| registry.register(&format!("id-{i}")).unwrap())
            .collect::<Vec<_>>();
        let waiters = handles
            .into_iter()
            .map(|handle| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let result = registry.await_result(&handle, TIMEOUT).await;
                    (handle.correlation_id().to_owned(), result)
                })
            })
            .collect::<Vec<_>>();

        // 7 is coprime with 64, so this visits every id once, out of order.
        for step in 0..N {
            let i = (step * 7) % N;
            assert_eq!(
                registry.resolve(&format!("id-{i}"), json!({ "for": i })),
                ResolveOutcome::Claimed
            );
        }

        for waiter in join_all(waiters).await {
            let (correlation_id, result) = waiter.unwrap();
            let i: usize = correlation_id.trim_start_matches("id-").parse().unwrap();
            assert_eq!(result.unwrap(), json!({ "for": i }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolving_one_id_leaves_other_waiter_blocked() {
        let registry = Arc::new(CorrelationRegistry::<Value>::new());
        let a = registry.register("a").unwrap();
        let b = registry.register("b").unwrap();

        registry.resolve("a", json!(1));
        assert!(a.is_ready());
        assert!(!b.is_ready());
        assert_eq!(
            registry.await_result(&b, Duration::from_millis(10)).await,
            Err(BridgeError::Timeout(Duration::from_millis(10)))
        );
        assert_eq!(registry.await_result(&a, TIMEOUT).await, Ok(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_reply_becomes_orphan() {
        let registry = CorrelationRegistry::<Value>::new();
        let handle = registry.register("slow").unwrap();

        let result = registry.await_result(&handle, Duration::from_secs(2)).await;
        assert_eq!(result, Err(BridgeError::Timeout(Duration::from_secs(2))));
        assert!(!registry.contains("slow"));

        assert_eq!(
            registry.resolve("slow", json!("late")),
            ResolveOutcome::Orphaned
        );
        assert_eq!(registry.status("slow"), Some(EntryStatus::Orphan));
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_rejected() {
        let registry = CorrelationRegistry::<Value>::new();
        let handle = registry.register("dup").unwrap();

        assert_eq!(registry.resolve("dup", json!("P1")), ResolveOutcome::Claimed);
        assert_eq!(registry.resolve("dup", json!("P2")), ResolveOutcome::Rejected);
        assert_eq!(registry.fail("dup", "late error"), ResolveOutcome::Rejected);

        assert_eq!(registry.await_result(&handle, TIMEOUT).await, Ok(json!("P1")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_orphan_keeps_first_payload() {
        let registry = CorrelationRegistry::<Value>::new();
        assert_eq!(registry.resolve("o", json!("P1")), ResolveOutcome::Orphaned);
        assert_eq!(registry.resolve("o", json!("P2")), ResolveOutcome::Rejected);

        let handle = registry.register("o").unwrap();
        assert_eq!(registry.await_result(&handle, TIMEOUT).await, Ok(json!("P1")));
    }

    #[test]
    fn test_tracked_resolution_never_creates_orphans() {
        let registry = CorrelationRegistry::<Value>::new();
        assert_eq!(registry.resolve_tracked("nobody", json!(1)), None);
        assert_eq!(registry.fail_tracked("nobody", "boom"), None);
        assert!(registry.is_empty());

        let _handle = registry.register("someone").unwrap();
        assert_eq!(
            registry.resolve_tracked("someone", json!(1)),
            Some(ResolveOutcome::Claimed)
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = CorrelationRegistry::<Value>::new();
        assert!(!registry.remove("unknown"));
        let _handle = registry.register("known").unwrap();
        assert!(registry.remove("known"));
        assert!(!registry.remove("known"));
    }

    #[test]
    fn test_stale_handle_does_not_release_newer_registration() {
        let registry = CorrelationRegistry::<Value>::new();
        let stale = registry.register("reused").unwrap();
        registry.remove("reused");
        let _fresh = registry.register("reused").unwrap();

        assert!(!registry.release(&stale));
        assert_eq!(registry.status("reused"), Some(EntryStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_evicts_only_expired_entries() {
        let registry = CorrelationRegistry::<Value>::new();
        for i in 0..10 {
            registry.resolve(&format!("orphan-{i}"), json!(i));
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        registry.resolve("young", json!("y"));

        let grace = Duration::from_secs(30);
        assert_eq!(registry.reap_older_than(grace, Instant::now()), 10);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("young"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.reap_older_than(grace, Instant::now()), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_keeps_pending_waiters() {
        let registry = CorrelationRegistry::<Value>::new();
        let handle = registry.register("waiting").unwrap();
        registry.resolve("orphan", json!("o"));
        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(
            registry.reap_older_than(Duration::from_secs(300), Instant::now()),
            1
        );
        assert_eq!(registry.status("waiting"), Some(EntryStatus::Pending));
        assert!(matches!(
            registry.register("waiting"),
            Err(BridgeError::Conflict(_))
        ));

        assert_eq!(registry.resolve("waiting", json!("w")), ResolveOutcome::Claimed);
        assert_eq!(registry.await_result(&handle, TIMEOUT).await, Ok(json!("w")));
    }
}
