//! Notification registry.
//!
//! User-space listeners ask to hear about callbacks coming and going by
//! sending a [`CtlMsg`] to the connector's control identifier.  Each
//! request becomes a [`Subscription`]: a list of `idx` ranges, a list of
//! `val` ranges, and the broadcast group to notify.
//!
//! When a callback is added or removed, every subscription whose `idx`
//! ranges cover the identifier's index **and** whose `val` ranges cover its
//! value receives one event message: the identifier with the event code in
//! `ack` and an empty payload.
//!
//! The registry lock is a [`tokio::sync::Mutex`]: it is only taken from task
//! context and may be held while events are broadcast.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::message::{CbId, CnMsg, CtlMsg, NotifyReq};

/// What happened to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyEvent {
    Added,
    Removed,
}

impl NotifyEvent {
    /// Code carried in the `ack` field of the event message.
    pub const fn code(self) -> u32 {
        match self {
            Self::Added => 0,
            Self::Removed => 1,
        }
    }
}

/// A stored subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    ctl: CtlMsg,
    /// The control message as received.
    raw: Vec<u8>,
}

impl Subscription {
    pub fn group(&self) -> u32 {
        self.ctl.group
    }

    pub fn idx_ranges(&self) -> &[NotifyReq] {
        &self.ctl.idx
    }

    pub fn val_ranges(&self) -> &[NotifyReq] {
        &self.ctl.val
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Whether both the index and the value of `id` are covered.
    pub fn matches(&self, id: CbId) -> bool {
        let idx_found = self.ctl.idx.iter().any(|r| r.contains(id.idx));
        let val_found = self.ctl.val.iter().any(|r| r.contains(id.val));
        idx_found && val_found
    }
}

/// Ordered set of subscriptions.
pub struct NotifyRegistry {
    records: Mutex<Vec<Subscription>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Tell every interested subscriber about `event` on `id`.
    ///
    /// `emit` sends one event message to one group.  Send failures are
    /// logged and do not stop the scan.  Returns the number of messages
    /// emitted.
    pub async fn notify<F>(&self, id: CbId, event: NotifyEvent, mut emit: F) -> usize
    where
        F: FnMut(&CnMsg, u32) -> Result<()>,
    {
        let records = self.records.lock().await;
        let mut sent = 0;

        for record in records.iter().filter(|r| r.matches(id)) {
            let msg = CnMsg::new(id, Vec::new()).with_ack(event.code());
            match emit(&msg, record.group()) {
                Ok(()) => sent += 1,
                Err(err) => {
                    tracing::debug!(
                        idx = id.idx,
                        val = id.val,
                        group = record.group(),
                        error = %err,
                        "notification not sent"
                    );
                }
            }
        }

        tracing::trace!(idx = id.idx, val = id.val, ?event, sent, "notifications emitted");
        sent
    }

    /// Apply a validated control message: subscribe for a nonzero group,
    /// unsubscribe for group zero.
    pub async fn apply(&self, ctl: CtlMsg) {
        if ctl.group == 0 {
            self.unsubscribe(&ctl).await;
        } else {
            self.subscribe(ctl).await;
        }
    }

    /// Append a subscription.
    pub async fn subscribe(&self, ctl: CtlMsg) {
        let raw = ctl.encode();
        let group = ctl.group;
        let mut records = self.records.lock().await;
        records.push(Subscription { ctl, raw });

        tracing::info!(group, subscriptions = records.len(), "subscription added");
    }

    /// Remove every subscription requesting exactly the ranges in `ctl`.
    /// Returns how many were removed.
    pub async fn unsubscribe(&self, ctl: &CtlMsg) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| !r.ctl.same_ranges(ctl));
        let removed = before - records.len();

        if removed > 0 {
            tracing::info!(removed, subscriptions = records.len(), "subscriptions removed");
        } else {
            tracing::debug!("unsubscribe matched no subscription");
        }
        removed
    }

    /// Snapshot of all subscriptions, in arrival order.
    pub async fn snapshot(&self) -> Vec<Subscription> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl Default for NotifyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
