//! Callback queue: the registry of handlers and their dispatch worker.
//!
//! A [`CallbackQueue`] owns an insertion-ordered list of callback entries,
//! unique by identifier, plus the serial dispatch queue that runs their
//! handlers.  The list is guarded by a short-hold mutex that is never held
//! across an `.await`, so lookups are safe from any delivery context.
//!
//! Teardown is synchronised by [`RefCount`], a counting completion signal:
//! every successful add takes a reference, every removal drops one, and
//! [`CallbackQueue::destroy`] waits for the count to reach zero before the
//! queue goes away.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::dispatch::{Callback, DispatchQueue, DispatchUnit, FallbackBudget, Payload, WorkSlot};
use crate::error::{ConnectorError, Result};
use crate::message::CbId;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a registered callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackInfo {
    pub id: CbId,
    /// Display name, truncated to the configured bound.
    pub name: String,
    /// Broadcast group used when sending on behalf of this callback.
    pub group: u32,
    /// Last sequence number handed out by [`CallbackQueue::next_seq`].
    pub seq: u32,
    pub registered_at: DateTime<Utc>,
}

/// Counters of accepted dispatches by path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Dispatches that used the entry's embedded slot.
    pub embedded: u64,
    /// Dispatches diverted to a standalone unit because the slot was busy.
    pub fallback: u64,
}

/// One registered handler.
struct CallbackEntry {
    id: CbId,
    name: String,
    handler: Arc<dyn Callback>,
    slot: Arc<WorkSlot>,
    group: u32,
    seq: AtomicU32,
    registered_at: DateTime<Utc>,
}

impl CallbackEntry {
    fn info(&self) -> CallbackInfo {
        CallbackInfo {
            id: self.id,
            name: self.name.clone(),
            group: self.group,
            seq: self.seq.load(Ordering::Acquire),
            registered_at: self.registered_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Reference count
// ---------------------------------------------------------------------------

/// Counting completion signal.
///
/// Waiters are woken when the count changes rather than polling it.
pub struct RefCount {
    count: watch::Sender<usize>,
}

impl RefCount {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn get(&self) {
        self.count.send_modify(|c| *c += 1);
    }

    pub fn put(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub fn value(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait for the count to reach zero, logging progress every `interval`.
    pub async fn wait_zero(&self, name: &str, interval: Duration) {
        let mut rx = self.count.subscribe();
        loop {
            match tokio::time::timeout(interval, rx.wait_for(|c| *c == 0)).await {
                Ok(_) => return,
                Err(_) => {
                    tracing::warn!(
                        queue = %name,
                        refcnt = self.value(),
                        "waiting for queue to become free"
                    );
                }
            }
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Callback queue
// ---------------------------------------------------------------------------

/// Insertion-ordered callback registry with a serial dispatch worker.
pub struct CallbackQueue {
    name: String,
    entries: Mutex<Vec<Arc<CallbackEntry>>>,
    refcnt: RefCount,
    dispatch: DispatchQueue,
    fallback: Arc<FallbackBudget>,
    name_len: usize,
    closed: AtomicBool,
    embedded_dispatches: AtomicU64,
    fallback_dispatches: AtomicU64,
}

impl CallbackQueue {
    /// Create an empty queue and spawn its dispatch worker.
    ///
    /// Fails with [`ConnectorError::QueueCreation`] outside a tokio runtime.
    pub fn create(name: &str, name_len: usize, fallback_limit: usize) -> Result<Self> {
        let dispatch = DispatchQueue::create(name)?;
        tracing::info!(queue = %name, "callback queue created");

        Ok(Self {
            name: name.to_string(),
            entries: Mutex::new(Vec::new()),
            refcnt: RefCount::new(),
            dispatch,
            fallback: FallbackBudget::new(fallback_limit),
            name_len,
            closed: AtomicBool::new(false),
            embedded_dispatches: AtomicU64::new(0),
            fallback_dispatches: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<Arc<CallbackEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `handler` under `id`.
    ///
    /// Fails with [`ConnectorError::DuplicateIdentifier`] if `id` is taken;
    /// the existing entry is left untouched.
    pub fn add(&self, name: &str, id: CbId, handler: Arc<dyn Callback>) -> Result<()> {
        let entry = Arc::new(CallbackEntry {
            id,
            name: bounded_name(name, self.name_len),
            handler,
            slot: Arc::new(WorkSlot::new()),
            group: id.idx,
            seq: AtomicU32::new(0),
            registered_at: Utc::now(),
        });

        {
            let mut entries = self.lock_entries();
            // Checked under the entry lock so `destroy` cannot miss the push.
            if self.closed.load(Ordering::Acquire) {
                return Err(ConnectorError::ShutDown);
            }
            if entries.iter().any(|e| e.id == id) {
                return Err(ConnectorError::DuplicateIdentifier { id });
            }
            entries.push(Arc::clone(&entry));
            self.refcnt.get();
        }

        tracing::info!(
            queue = %self.name,
            idx = id.idx,
            val = id.val,
            name = %entry.name,
            "callback added"
        );
        Ok(())
    }

    /// Unregister the callback for `id`.
    ///
    /// The entry is unlinked first so no new dispatch can start against it,
    /// then any pending dispatch is cancelled and the worker is drained.
    /// Returns `false` (and does nothing) if `id` is not registered.
    pub async fn remove(&self, id: CbId) -> bool {
        let removed = {
            let mut entries = self.lock_entries();
            entries
                .iter()
                .position(|e| e.id == id)
                .map(|pos| entries.remove(pos))
        };

        let Some(entry) = removed else {
            tracing::debug!(
                queue = %self.name,
                idx = id.idx,
                val = id.val,
                "remove of unknown callback"
            );
            return false;
        };

        self.drain_entry(&entry).await;
        self.refcnt.put();

        tracing::info!(
            queue = %self.name,
            idx = id.idx,
            val = id.val,
            refcnt = self.refcnt.value(),
            "callback removed"
        );
        true
    }

    async fn drain_entry(&self, entry: &CallbackEntry) {
        if let Some(payload) = entry.slot.cancel() {
            tracing::trace!(
                queue = %self.name,
                idx = entry.id.idx,
                val = entry.id.val,
                "cancelled pending dispatch"
            );
            payload.release();
        }
        self.dispatch.flush().await;
    }

    /// Tear the queue down.
    ///
    /// Drains the worker, unlinks and drains every remaining entry, stops the
    /// worker, then waits for the reference count to reach zero, logging
    /// every `interval` while it waits.
    pub async fn destroy(&self, interval: Duration) {
        self.closed.store(true, Ordering::Release);
        self.dispatch.flush().await;

        let remaining = std::mem::take(&mut *self.lock_entries());
        for entry in &remaining {
            self.drain_entry(entry).await;
            self.refcnt.put();
        }

        self.dispatch.close().await;
        self.refcnt.wait_zero(&self.name, interval).await;

        tracing::info!(
            queue = %self.name,
            dropped = remaining.len(),
            "callback queue destroyed"
        );
    }

    /// Queue `payload` for the handler registered under its identifier.
    ///
    /// Uses the entry's embedded slot when idle and a standalone unit when
    /// the slot is still busy.  Refused payloads are released before return,
    /// outside the entry lock.
    pub fn dispatch(&self, payload: Payload) -> Result<()> {
        let (result, refused) = self.dispatch_locked(payload);
        drop(refused);
        result
    }

    fn dispatch_locked(&self, payload: Payload) -> (Result<()>, Option<Payload>) {
        let id = payload.msg().id;
        let entries = self.lock_entries();

        let Some(entry) = entries.iter().find(|e| e.id == id) else {
            return (Err(ConnectorError::NoDestination { id }), Some(payload));
        };

        let payload = match entry.slot.arm(payload) {
            Ok(()) => {
                let unit = DispatchUnit::Embedded {
                    handler: Arc::clone(&entry.handler),
                    slot: Arc::clone(&entry.slot),
                };
                return match self.dispatch.submit(unit) {
                    Ok(()) => {
                        self.embedded_dispatches.fetch_add(1, Ordering::Relaxed);
                        (Ok(()), None)
                    }
                    Err(_) => (Err(self.submit_failure()), entry.slot.cancel()),
                };
            }
            Err(payload) => payload,
        };

        // The embedded slot is still busy with an earlier message.
        let Some(ticket) = self.fallback.acquire() else {
            tracing::warn!(
                queue = %self.name,
                idx = id.idx,
                val = id.val,
                in_flight = self.fallback.in_flight(),
                "fallback dispatch unit unavailable"
            );
            return (
                Err(ConnectorError::OutOfMemory {
                    what: "dispatch unit",
                }),
                Some(payload),
            );
        };

        let unit = DispatchUnit::Standalone {
            handler: Arc::clone(&entry.handler),
            payload,
            ticket,
        };
        match self.dispatch.submit(unit) {
            Ok(()) => {
                self.fallback_dispatches.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    queue = %self.name,
                    idx = id.idx,
                    val = id.val,
                    "slot busy, dispatched standalone unit"
                );
                (Ok(()), None)
            }
            Err(unit) => (Err(self.submit_failure()), unit.into_payload()),
        }
    }

    fn submit_failure(&self) -> ConnectorError {
        ConnectorError::DispatchSubmitFailure {
            queue: self.dispatch.name().to_string(),
        }
    }

    /// Wait until everything queued so far has run.
    pub async fn flush(&self) {
        self.dispatch.flush().await;
    }

    /// Broadcast group assigned to the callback for `id`.
    pub fn group_of(&self, id: CbId) -> Option<u32> {
        self.lock_entries()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.group)
    }

    /// Advance and return the sequence number of the callback for `id`.
    pub fn next_seq(&self, id: CbId) -> Option<u32> {
        self.lock_entries()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
    }

    /// Whether a callback is registered under `id`.
    pub fn contains(&self, id: CbId) -> bool {
        self.lock_entries().iter().any(|e| e.id == id)
    }

    /// Snapshot of every registered callback, in registration order.
    pub fn snapshot(&self) -> Vec<CallbackInfo> {
        self.lock_entries().iter().map(|e| e.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Current reference count.
    pub fn refcnt(&self) -> usize {
        self.refcnt.value()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            embedded: self.embedded_dispatches.load(Ordering::Relaxed),
            fallback: self.fallback_dispatches.load(Ordering::Relaxed),
        }
    }
}

/// Truncate `name` to fit a buffer of `cap` bytes including a terminator.
fn bounded_name(name: &str, cap: usize) -> String {
    name.chars().take(cap.saturating_sub(1)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::callback_fn;
    use crate::message::CnMsg;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> Arc<dyn Callback> {
        callback_fn(|_| {})
    }

    fn queue() -> CallbackQueue {
        CallbackQueue::create("test", 32, 16).expect("create queue")
    }

    fn counted(id: CbId, released: &Arc<AtomicUsize>) -> Payload {
        let released = Arc::clone(released);
        Payload::new(
            CnMsg::new(id, Vec::new()),
            Some(Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })),
        )
    }

    #[tokio::test]
    async fn add_duplicate_then_readd() {
        let q = queue();
        let id = CbId::new(1, 100);

        q.add("h1", id, noop()).expect("first add");
        let err = q.add("h1-again", id, noop()).unwrap_err();
        assert!(matches!(err, ConnectorError::DuplicateIdentifier { .. }));

        // The first entry is untouched.
        let snapshot = q.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "h1");
        assert_eq!(q.refcnt(), 1);

        assert!(q.remove(id).await);
        q.add("h1", id, noop()).expect("re-add after remove");
        assert_eq!(q.refcnt(), 1);

        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let q = queue();
        q.add("a", CbId::new(1, 1), noop()).unwrap();

        assert!(!q.remove(CbId::new(9, 9)).await);
        assert_eq!(q.len(), 1);
        assert_eq!(q.refcnt(), 1);

        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn entries_keep_registration_order_and_group() {
        let q = queue();
        q.add("c", CbId::new(3, 0), noop()).unwrap();
        q.add("a", CbId::new(1, 0), noop()).unwrap();
        q.add("b", CbId::new(2, 0), noop()).unwrap();
        assert!(q.remove(CbId::new(1, 0)).await);

        let names: Vec<_> = q.snapshot().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert_eq!(q.group_of(CbId::new(2, 0)), Some(2));
        assert_eq!(q.group_of(CbId::new(1, 0)), None);
        assert!(q.contains(CbId::new(3, 0)));
        assert!(!q.contains(CbId::new(1, 0)));

        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn names_are_bounded() {
        let q = CallbackQueue::create("names", 8, 1).unwrap();
        q.add("a-rather-long-name", CbId::new(1, 1), noop()).unwrap();
        assert_eq!(q.snapshot()[0].name, "a-rathe");
        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn sequence_numbers_advance() {
        let q = queue();
        let id = CbId::new(4, 4);
        q.add("seq", id, noop()).unwrap();
        assert_eq!(q.snapshot()[0].seq, 0);
        assert_eq!(q.next_seq(id), Some(1));
        assert_eq!(q.next_seq(id), Some(2));
        assert_eq!(q.next_seq(CbId::new(0, 0)), None);
        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn dispatch_without_destination_releases_payload() {
        let q = queue();
        let released = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&released);
        let payload = Payload::new(
            CnMsg::new(CbId::new(5, 5), Vec::new()),
            Some(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let err = q.dispatch(payload).unwrap_err();
        assert!(matches!(err, ConnectorError::NoDestination { .. }));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn destroy_drains_everything() {
        let q = queue();
        let hits = Arc::new(AtomicUsize::new(0));
        for n in 0..4 {
            let h = Arc::clone(&hits);
            q.add(
                "h",
                CbId::new(n, n),
                callback_fn(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
            q.dispatch(Payload::new(CnMsg::new(CbId::new(n, n), Vec::new()), None))
                .unwrap();
        }

        q.destroy(Duration::from_millis(10)).await;
        assert_eq!(q.refcnt(), 0);
        assert!(q.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        // Nothing can be registered afterwards.
        assert!(matches!(
            q.add("late", CbId::new(9, 9), noop()),
            Err(ConnectorError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn refcount_wait_wakes_on_zero() {
        let refcnt = Arc::new(RefCount::new());
        refcnt.get();
        refcnt.get();

        let waiter = {
            let refcnt = Arc::clone(&refcnt);
            tokio::spawn(async move { refcnt.wait_zero("test", Duration::from_millis(5)).await })
        };

        refcnt.put();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        refcnt.put();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter wakes")
            .expect("waiter task");
        assert_eq!(refcnt.value(), 0);
    }

    #[tokio::test]
    async fn refused_embedded_dispatch_releases_and_idles_slot() {
        let q = queue();
        let id = CbId::new(6, 6);
        q.add("h", id, noop()).unwrap();
        q.dispatch.close().await;

        let released = Arc::new(AtomicUsize::new(0));
        let err = q.dispatch(counted(id, &released)).unwrap_err();
        assert!(matches!(err, ConnectorError::DispatchSubmitFailure { .. }));
        assert_eq!(err.errno(), -22);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(q.lock_entries()[0].slot.is_idle());
        assert_eq!(q.stats(), DispatchStats::default());

        q.destroy(Duration::from_millis(10)).await;
        assert_eq!(q.refcnt(), 0);
    }

    #[tokio::test]
    async fn refused_standalone_dispatch_releases_payload() {
        let q = queue();
        let id = CbId::new(7, 7);
        q.add("h", id, noop()).unwrap();

        // Occupy the embedded slot so the next dispatch takes the fallback.
        let held = Arc::new(AtomicUsize::new(0));
        let entry = Arc::clone(&q.lock_entries()[0]);
        entry.slot.arm(counted(id, &held)).expect("idle slot");
        q.dispatch.close().await;

        let released = Arc::new(AtomicUsize::new(0));
        let err = q.dispatch(counted(id, &released)).unwrap_err();
        assert!(matches!(err, ConnectorError::DispatchSubmitFailure { .. }));
        assert_eq!(err.errno(), -22);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(q.fallback.in_flight(), 0);
        assert_eq!(held.load(Ordering::SeqCst), 0);

        drop(entry.slot.cancel());
        assert_eq!(held.load(Ordering::SeqCst), 1);
        assert!(entry.slot.is_idle());

        q.destroy(Duration::from_millis(10)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_racing_destroy_leaves_nothing_behind() {
        for round in 0..200u32 {
            let q = Arc::new(queue());
            let adder = {
                let q = Arc::clone(&q);
                tokio::task::spawn_blocking(move || {
                    let mut added = 0u32;
                    loop {
                        match q.add("racer", CbId::new(round, added), noop()) {
                            Ok(()) => added += 1,
                            Err(ConnectorError::ShutDown) => return added,
                            Err(e) => panic!("unexpected add failure: {e}"),
                        }
                    }
                })
            };

            while q.is_empty() {
                tokio::task::yield_now().await;
            }
            tokio::time::timeout(Duration::from_secs(5), q.destroy(Duration::from_millis(10)))
                .await
                .expect("destroy finishes");

            let added = adder.await.expect("adder task");
            assert!(added > 0);
            assert!(q.is_empty(), "round {round}: entry survived destroy");
            assert_eq!(q.refcnt(), 0, "round {round}");
        }
    }
}
