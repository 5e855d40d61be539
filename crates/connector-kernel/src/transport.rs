//! Transport boundary.
//!
//! The connector does not own a socket.  Inbound frames arrive as
//! [`InboundFrame`]s carrying the sender's [`Credentials`]; outbound frames
//! leave through a [`Transport`] that broadcasts to a group.
//!
//! [`LoopbackTransport`] is an in-process implementation built on
//! [`tokio::sync::broadcast`].  Frames are wrapped in [`Arc`] so that
//! fanning out to several group receivers does not copy the bytes.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use connector_kernel::transport::{AllocPolicy, LoopbackTransport, Transport};
//! # use connector_kernel::message::{CbId, CnMsg};
//! # async fn example() {
//! let transport = LoopbackTransport::new(64);
//! let mut rx = transport.subscribe(7);
//!
//! let frame = CnMsg::new(CbId::new(7, 1), b"hi".to_vec()).encode_frame(1024).unwrap();
//! transport.broadcast(7, frame, AllocPolicy::MaySleep).unwrap();
//!
//! let msg = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::dispatch::Release;
use crate::error::Result;
use crate::message::CnMsg;

// ---------------------------------------------------------------------------
// Inbound side
// ---------------------------------------------------------------------------

/// Identity of the peer that sent an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub pid: u32,
    pub uid: u32,
    /// Whether the sender holds administrative privilege.
    pub admin: bool,
}

impl Credentials {
    /// A privileged peer.
    pub const fn root(pid: u32) -> Self {
        Self {
            pid,
            uid: 0,
            admin: true,
        }
    }

    /// An unprivileged peer.
    pub const fn user(pid: u32, uid: u32) -> Self {
        Self {
            pid,
            uid,
            admin: false,
        }
    }
}

/// A raw frame delivered by the transport.
///
/// The optional release hook runs when the frame is dropped, which lets a
/// transport recycle its buffer once the connector is done with it.
pub struct InboundFrame {
    pub data: Vec<u8>,
    pub creds: Credentials,
    /// Destination group the peer addressed.
    pub group: u32,
    on_release: Option<Release>,
}

impl InboundFrame {
    pub fn new(data: Vec<u8>, creds: Credentials) -> Self {
        Self {
            data,
            creds,
            group: 0,
            on_release: None,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Attach a hook to run when the frame is released.
    #[must_use]
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }
}

impl Drop for InboundFrame {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundFrame")
            .field("len", &self.data.len())
            .field("creds", &self.creds)
            .field("group", &self.group)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outbound side
// ---------------------------------------------------------------------------

/// Allocation context of an outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocPolicy {
    /// The caller may sleep; the transport may block to allocate.
    MaySleep,
    /// The caller must not sleep.
    Atomic,
}

/// Outbound half of the transport.
pub trait Transport: Send + Sync {
    /// Broadcast `frame` to every listener of `group`.
    ///
    /// Returns the number of listeners reached.  Delivery is best-effort.
    fn broadcast(&self, group: u32, frame: Vec<u8>, policy: AllocPolicy) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// Loopback transport
// ---------------------------------------------------------------------------

/// A frame broadcast on the loopback transport.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub group: u32,
    pub frame: Vec<u8>,
    pub policy: AllocPolicy,
}

/// In-process transport backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

struct LoopbackInner {
    sender: broadcast::Sender<Arc<BroadcastFrame>>,
}

impl LoopbackTransport {
    /// Create a transport with the given channel capacity.
    ///
    /// A receiver that falls more than `capacity` frames behind skips the
    /// frames it missed.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(LoopbackInner { sender }),
        }
    }

    /// Listen to one broadcast group.
    ///
    /// Frames broadcast *before* this call are not replayed.
    pub fn subscribe(&self, group: u32) -> GroupReceiver {
        tracing::trace!(group, "loopback listener joined");
        GroupReceiver {
            rx: self.inner.sender.subscribe(),
            group,
        }
    }

    /// Listen to every group.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Arc<BroadcastFrame>> {
        self.inner.sender.subscribe()
    }

    /// Current number of listeners across all groups.
    pub fn listener_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Transport for LoopbackTransport {
    fn broadcast(&self, group: u32, frame: Vec<u8>, policy: AllocPolicy) -> Result<usize> {
        let frame = Arc::new(BroadcastFrame {
            group,
            frame,
            policy,
        });
        match self.inner.sender.send(frame) {
            Ok(n) => {
                tracing::trace!(group, listeners = n, "frame broadcast");
                Ok(n)
            }
            Err(_) => {
                // No listeners at all; not an error for a broadcast.
                tracing::trace!(group, "frame broadcast with no listeners");
                Ok(0)
            }
        }
    }
}

/// Receiver of decoded messages for one broadcast group.
pub struct GroupReceiver {
    rx: broadcast::Receiver<Arc<BroadcastFrame>>,
    group: u32,
}

impl GroupReceiver {
    pub fn group(&self) -> u32 {
        self.group
    }

    fn accept(&self, frame: &BroadcastFrame) -> Option<CnMsg> {
        if frame.group != self.group {
            return None;
        }
        match CnMsg::decode_frame(&frame.frame, usize::MAX) {
            Ok(msg) => Some(msg),
            Err(err) => {
                tracing::debug!(group = self.group, error = %err, "undecodable broadcast frame");
                None
            }
        }
    }

    /// Wait for the next message on this group.  `None` once the transport
    /// is gone.
    pub async fn recv(&mut self) -> Option<CnMsg> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if let Some(msg) = self.accept(&frame) {
                        return Some(msg);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(group = self.group, missed, "loopback listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-delivered message on this group, if any.
    pub fn try_recv(&mut self) -> Option<CnMsg> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if let Some(msg) = self.accept(&frame) {
                        return Some(msg);
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CbId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn frame(id: CbId, data: &[u8]) -> Vec<u8> {
        CnMsg::new(id, data.to_vec()).encode_frame(1024).unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_group_listener() {
        let transport = LoopbackTransport::new(16);
        let mut rx = transport.subscribe(7);

        let reached = transport
            .broadcast(7, frame(CbId::new(7, 1), b"hello"), AllocPolicy::MaySleep)
            .expect("broadcast");
        assert_eq!(reached, 1);

        let msg = rx.recv().await.expect("message");
        assert_eq!(msg.id, CbId::new(7, 1));
        assert_eq!(msg.data, b"hello");
    }

    #[tokio::test]
    async fn other_groups_are_filtered() {
        let transport = LoopbackTransport::new(16);
        let mut seven = transport.subscribe(7);
        let mut eight = transport.subscribe(8);

        transport
            .broadcast(8, frame(CbId::new(8, 0), b""), AllocPolicy::Atomic)
            .unwrap();

        assert!(seven.try_recv().is_none());
        assert_eq!(eight.try_recv().map(|m| m.id), Some(CbId::new(8, 0)));
    }

    #[tokio::test]
    async fn subscribe_all_sees_every_group() {
        let transport = LoopbackTransport::new(16);
        let mut all = transport.subscribe_all();

        transport
            .broadcast(3, frame(CbId::new(3, 0), b"a"), AllocPolicy::MaySleep)
            .unwrap();
        transport
            .broadcast(4, frame(CbId::new(4, 0), b"b"), AllocPolicy::Atomic)
            .unwrap();

        let first = all.recv().await.expect("first frame");
        let second = all.recv().await.expect("second frame");
        assert_eq!((first.group, first.policy), (3, AllocPolicy::MaySleep));
        assert_eq!((second.group, second.policy), (4, AllocPolicy::Atomic));
        assert_eq!(CnMsg::decode_frame(&second.frame, 1024).unwrap().data, b"b");
    }

    #[tokio::test]
    async fn broadcast_without_listeners_is_ok() {
        let transport = LoopbackTransport::new(16);
        let result = transport.broadcast(1, frame(CbId::new(1, 1), b""), AllocPolicy::MaySleep);
        assert_eq!(result.unwrap(), 0);
    }

    #[test]
    fn listener_count() {
        let transport = LoopbackTransport::new(16);
        assert_eq!(transport.listener_count(), 0);
        let rx1 = transport.subscribe(1);
        let _rx2 = transport.subscribe(2);
        assert_eq!(transport.listener_count(), 2);
        drop(rx1);
        assert_eq!(transport.listener_count(), 1);
    }

    #[test]
    fn inbound_frame_release_hook_runs_once() {
        let released = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&released);
        let frame = InboundFrame::new(vec![1, 2, 3], Credentials::root(1)).on_release(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
