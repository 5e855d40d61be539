//! Serial dispatch queue and dispatch units.
//!
//! Handlers never run on the submitter's thread.  A submission pushes a
//! [`DispatchUnit`] onto a lock-free [`SegQueue`] and returns immediately; a
//! single background tokio task pops units in FIFO order and runs them one
//! at a time.
//!
//! Running a unit means: invoke the handler with the payload message, run
//! the payload's release hook, then free the unit.  There are two kinds of
//! unit:
//!
//! - **Embedded**: the [`WorkSlot`] owned by a callback entry.  It is reused
//!   in place and returns to idle once the release hook has run.
//! - **Standalone**: allocated when the entry's slot is still busy with an
//!   earlier message.  It runs independently and frees itself afterwards.
//!   The number outstanding at once is bounded by a [`FallbackBudget`].
//!
//! # Slot lifecycle
//!
//! ```text
//! Idle  --arm-->  Pending  --start-->  Running  --finish-->  Idle
//!                    \--cancel-->  Idle
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::error::{ConnectorError, Result};
use crate::message::CnMsg;

// ---------------------------------------------------------------------------
// Handlers and payloads
// ---------------------------------------------------------------------------

/// A message handler bound to one identifier.
///
/// Handlers run on the queue's serial worker, so a slow handler delays every
/// other handler on the same connector.  A handler must not remove callbacks
/// or shut the connector down: both wait for the worker to drain.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, msg: &CnMsg);
}

/// Adapter that turns a plain closure into a [`Callback`].
pub struct FnCallback<F>(F);

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(&CnMsg) + Send + Sync,
{
    async fn call(&self, msg: &CnMsg) {
        (self.0)(msg)
    }
}

/// Wrap a closure as a shareable handler.
pub fn callback_fn<F>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&CnMsg) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Hook run once the payload is no longer needed.
pub type Release = Box<dyn FnOnce() + Send>;

/// A message together with its release hook.
///
/// The hook runs exactly once: explicitly through [`Payload::release`] after
/// the handler returns, or on drop if the payload is refused or cancelled.
pub struct Payload {
    msg: CnMsg,
    release: Option<Release>,
}

impl Payload {
    pub fn new(msg: CnMsg, release: Option<Release>) -> Self {
        Self { msg, release }
    }

    pub fn msg(&self) -> &CnMsg {
        &self.msg
    }

    /// Run the release hook now.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("msg", &self.msg)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Embedded work slot
// ---------------------------------------------------------------------------

enum SlotState {
    Idle,
    Pending(Payload),
    Running,
}

/// The single reusable dispatch slot embedded in a callback entry.
pub(crate) struct WorkSlot {
    state: Mutex<SlotState>,
}

impl WorkSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `payload` if the slot is idle; hand it back otherwise.
    pub(crate) fn arm(&self, payload: Payload) -> std::result::Result<(), Payload> {
        let mut state = self.lock();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Pending(payload);
                Ok(())
            }
            _ => Err(payload),
        }
    }

    /// Take the pending payload for execution.  `None` if it was cancelled.
    fn start(&self) -> Option<Payload> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Running) {
            SlotState::Pending(payload) => Some(payload),
            other => {
                *state = other;
                None
            }
        }
    }

    fn finish(&self) {
        *self.lock() = SlotState::Idle;
    }

    /// Withdraw a payload that has not started running.
    pub(crate) fn cancel(&self) -> Option<Payload> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Pending(payload) => Some(payload),
            other => {
                *state = other;
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        matches!(*self.lock(), SlotState::Idle)
    }
}

// ---------------------------------------------------------------------------
// Fallback budget
// ---------------------------------------------------------------------------

/// Bounds the number of standalone units outstanding at once.
pub(crate) struct FallbackBudget {
    in_flight: AtomicUsize,
    limit: usize,
}

impl FallbackBudget {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            limit,
        })
    }

    /// Reserve one standalone unit; `None` when the budget is exhausted.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<FallbackTicket> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| FallbackTicket(Arc::clone(self)))
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Returns its reservation to the budget on drop.
pub(crate) struct FallbackTicket(Arc<FallbackBudget>);

impl Drop for FallbackTicket {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Dispatch units
// ---------------------------------------------------------------------------

/// One schedulable handler invocation.
pub(crate) enum DispatchUnit {
    Embedded {
        handler: Arc<dyn Callback>,
        slot: Arc<WorkSlot>,
    },
    Standalone {
        handler: Arc<dyn Callback>,
        payload: Payload,
        ticket: FallbackTicket,
    },
}

impl DispatchUnit {
    /// The payload carried by a standalone unit, for release after refusal.
    pub(crate) fn into_payload(self) -> Option<Payload> {
        match self {
            Self::Embedded { .. } => None,
            Self::Standalone { payload, .. } => Some(payload),
        }
    }
}

// ---------------------------------------------------------------------------
// Serial dispatch queue
// ---------------------------------------------------------------------------

/// Single-worker FIFO executor for dispatch units.
pub(crate) struct DispatchQueue {
    inner: Arc<DispatchInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct DispatchInner {
    name: String,

    units: SegQueue<DispatchUnit>,

    /// Wakes the worker when new work arrives.
    notify: Notify,

    /// When `true` the queue refuses new units and the worker exits once
    /// empty.
    shutdown: AtomicBool,

    /// Units accepted so far.
    submitted: AtomicU64,

    /// Units finished (run, skipped, or abandoned) so far.
    completed: watch::Sender<u64>,
}

impl DispatchQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    pub(crate) fn create(name: &str) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| ConnectorError::QueueCreation {
            queue: name.to_string(),
            reason: e.to_string(),
        })?;

        let (completed, _) = watch::channel(0);
        let inner = Arc::new(DispatchInner {
            name: name.to_string(),
            units: SegQueue::new(),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = handle.spawn(async move {
            tracing::debug!(queue = %worker_inner.name, "dispatch worker started");
            Self::worker_loop(&worker_inner).await;
            tracing::debug!(queue = %worker_inner.name, "dispatch worker stopped");
        });

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a unit for execution.  Never blocks.
    ///
    /// A refused unit is handed back so the caller decides how to release
    /// it.
    pub(crate) fn submit(&self, unit: DispatchUnit) -> std::result::Result<(), DispatchUnit> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(unit);
        }
        self.inner.submitted.fetch_add(1, Ordering::AcqRel);
        self.inner.units.push(unit);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Wait until every unit submitted before this call has finished.
    ///
    /// Must not be awaited from a handler: the worker would wait on itself.
    pub(crate) async fn flush(&self) {
        let target = self.inner.submitted.load(Ordering::Acquire);
        let mut rx = self.inner.completed.subscribe();
        // The sender lives in `inner`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done >= target).await;
    }

    /// Stop accepting work, let the worker drain, and wait for it to exit.
    pub(crate) async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::warn!(
                    queue = %self.inner.name,
                    error = %err,
                    "dispatch worker ended abnormally"
                );
            }
        }

        // Units that raced past the shutdown check.
        while let Some(unit) = self.inner.units.pop() {
            tracing::debug!(queue = %self.inner.name, "abandoning unit queued after shutdown");
            drop(unit);
            self.inner.completed.send_modify(|done| *done += 1);
        }
    }

    async fn worker_loop(inner: &DispatchInner) {
        loop {
            match inner.units.pop() {
                Some(unit) => {
                    Self::run(unit, &inner.name).await;
                    inner.completed.send_modify(|done| *done += 1);
                }
                None => {
                    if inner.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    // Park until notified of new work or shutdown.
                    inner.notify.notified().await;
                }
            }
        }
    }

    async fn run(unit: DispatchUnit, queue: &str) {
        match unit {
            DispatchUnit::Embedded { handler, slot } => {
                let Some(payload) = slot.start() else {
                    tracing::trace!(queue = %queue, "skipping cancelled dispatch");
                    return;
                };
                Self::invoke(&handler, &payload.msg, queue).await;
                payload.release();
                slot.finish();
            }
            DispatchUnit::Standalone {
                handler,
                payload,
                ticket,
            } => {
                Self::invoke(&handler, &payload.msg, queue).await;
                payload.release();
                drop(ticket);
            }
        }
    }

    // Takes the message alone: the release hook is `Send` but not `Sync`.
    async fn invoke(handler: &Arc<dyn Callback>, msg: &CnMsg, queue: &str) {
        tracing::trace!(
            queue = %queue,
            idx = msg.id.idx,
            val = msg.id.val,
            seq = msg.seq,
            "dispatching"
        );

        if AssertUnwindSafe(handler.call(msg)).catch_unwind().await.is_err() {
            tracing::error!(
                queue = %queue,
                idx = msg.id.idx,
                val = msg.id.val,
                "callback panicked"
            );
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Lets the worker exit if the queue was never closed.
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CbId;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_payload(n: u32, released: &Arc<AtomicU32>) -> Payload {
        let released = Arc::clone(released);
        Payload::new(
            CnMsg::new(CbId::new(1, n), Vec::new()),
            Some(Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })),
        )
    }

    fn recording_handler(order: &Arc<Mutex<Vec<u32>>>) -> Arc<dyn Callback> {
        let order = Arc::clone(order);
        callback_fn(move |msg| order.lock().unwrap().push(msg.id.val))
    }

    #[test]
    fn create_requires_runtime() {
        let err = DispatchQueue::create("orphan").err().expect("no runtime");
        assert!(matches!(err, ConnectorError::QueueCreation { .. }));
    }

    #[test]
    fn payload_released_once_on_drop() {
        let released = Arc::new(AtomicU32::new(0));
        drop(counting_payload(1, &released));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        counting_payload(2, &released).release();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn slot_transitions() {
        let released = Arc::new(AtomicU32::new(0));
        let slot = WorkSlot::new();
        assert!(slot.is_idle());

        slot.arm(counting_payload(1, &released)).expect("idle slot arms");
        assert!(!slot.is_idle());

        // A second arm is refused and hands the payload back.
        let refused = slot.arm(counting_payload(2, &released)).unwrap_err();
        assert_eq!(refused.msg().id.val, 2);
        drop(refused);

        let cancelled = slot.cancel().expect("pending payload");
        assert_eq!(cancelled.msg().id.val, 1);
        assert!(slot.is_idle());
        assert!(slot.start().is_none());
        assert!(slot.is_idle());
    }

    #[test]
    fn fallback_budget_limits() {
        let budget = FallbackBudget::new(1);
        let first = budget.acquire().expect("first ticket");
        assert!(budget.acquire().is_none());
        assert_eq!(budget.in_flight(), 1);
        drop(first);
        assert_eq!(budget.in_flight(), 0);
        assert!(budget.acquire().is_some());
    }

    #[tokio::test]
    async fn units_run_in_fifo_order() {
        let queue = DispatchQueue::create("fifo").expect("create");
        let order = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicU32::new(0));
        let budget = FallbackBudget::new(16);

        for n in 0..5 {
            let unit = DispatchUnit::Standalone {
                handler: recording_handler(&order),
                payload: counting_payload(n, &released),
                ticket: budget.acquire().unwrap(),
            };
            assert!(queue.submit(unit).is_ok());
        }

        queue.flush().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(released.load(Ordering::SeqCst), 5);
        assert_eq!(budget.in_flight(), 0);

        queue.close().await;
    }

    #[tokio::test]
    async fn closed_queue_refuses_units() {
        let queue = DispatchQueue::create("closed").expect("create");
        queue.close().await;

        let released = Arc::new(AtomicU32::new(0));
        let unit = DispatchUnit::Standalone {
            handler: callback_fn(|_| {}),
            payload: counting_payload(1, &released),
            ticket: FallbackBudget::new(1).acquire().unwrap(),
        };
        let refused = queue.submit(unit).err().expect("refused");
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(refused.into_payload());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_embedded_unit_is_skipped() {
        let queue = DispatchQueue::create("cancel").expect("create");
        let order = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicU32::new(0));
        let slot = Arc::new(WorkSlot::new());

        slot.arm(counting_payload(9, &released)).unwrap();
        // Cancel before the worker gets a chance to run.
        let cancelled = slot.cancel().expect("still pending");
        assert!(
            queue
                .submit(DispatchUnit::Embedded {
                    handler: recording_handler(&order),
                    slot: Arc::clone(&slot),
                })
                .is_ok()
        );
        cancelled.release();

        queue.flush().await;
        assert!(order.lock().unwrap().is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(slot.is_idle());

        queue.close().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_worker() {
        let queue = DispatchQueue::create("panic").expect("create");
        let released = Arc::new(AtomicU32::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let budget = FallbackBudget::new(4);

        let boom = DispatchUnit::Standalone {
            handler: callback_fn(|_| panic!("handler failure")),
            payload: counting_payload(1, &released),
            ticket: budget.acquire().unwrap(),
        };
        let ok = DispatchUnit::Standalone {
            handler: recording_handler(&order),
            payload: counting_payload(2, &released),
            ticket: budget.acquire().unwrap(),
        };
        assert!(queue.submit(boom).is_ok());
        assert!(queue.submit(ok).is_ok());

        tokio::time::timeout(Duration::from_secs(5), queue.flush())
            .await
            .expect("flush completes");
        assert_eq!(*order.lock().unwrap(), vec![2]);
        assert_eq!(released.load(Ordering::SeqCst), 2);

        queue.close().await;
    }
}
