//! The message router.
//!
//! A [`Connector`] binds one [`Transport`] to one [`CallbackQueue`] and one
//! [`NotifyRegistry`].  It is an explicit context object: construct it with
//! [`Connector::init`] when the subsystem starts, pass clones to whoever
//! needs it, and call [`Connector::shutdown`] when the subsystem stops.
//! Independent instances do not share any state.
//!
//! # Paths
//!
//! - **Inbound**: [`Connector::receive`] validates a raw frame, checks the
//!   sender's privilege, and hands the message to [`Connector::call`],
//!   which queues the matching handler.  [`Connector::input`] does the same
//!   for a batch and absorbs every error.
//! - **Outbound**: [`Connector::send`] resolves a broadcast group (explicit,
//!   or the one assigned to the message's callback) and broadcasts a frame.
//! - **Registration**: [`Connector::add_callback`] and
//!   [`Connector::del_callback`] update the queue, then notify subscribers.
//!
//! The built-in control handler, registered at the configured identifier,
//! maintains the notification registry from [`CtlMsg`] payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::config::ConnectorConfig;
use crate::dispatch::{Callback, Payload, Release};
use crate::error::{ConnectorError, Result};
use crate::message::{CbId, CnMsg, CtlMsg, NLMSG_HDRLEN, NlMsgHdr};
use crate::notify::{NotifyEvent, NotifyRegistry, Subscription};
use crate::queue::{CallbackInfo, CallbackQueue, DispatchStats};
use crate::transport::{AllocPolicy, InboundFrame, Transport};

/// Name under which the control handler is registered.
const CONTROL_NAME: &str = "connector";

/// Connector instance.  Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

/// Non-owning handle to a [`Connector`], for handlers that reply through it.
#[derive(Clone)]
pub struct WeakConnector {
    inner: Weak<ConnectorInner>,
}

impl WeakConnector {
    pub fn upgrade(&self) -> Option<Connector> {
        self.inner.upgrade().map(|inner| Connector { inner })
    }
}

struct ConnectorInner {
    config: ConnectorConfig,
    queue: CallbackQueue,
    notify: NotifyRegistry,
    transport: Arc<dyn Transport>,
    shut_down: AtomicBool,
}

impl Connector {
    /// Bring up a connector over `transport`.
    ///
    /// Creates the callback queue and registers the control handler at
    /// `config.id`.  Must be called inside a tokio runtime.
    pub async fn init(config: ConnectorConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let queue =
            CallbackQueue::create(&config.queue_name, config.name_len, config.fallback_limit)?;

        let connector = Self {
            inner: Arc::new(ConnectorInner {
                config,
                queue,
                notify: NotifyRegistry::new(),
                transport,
                shut_down: AtomicBool::new(false),
            }),
        };

        let control = Arc::new(ControlHandler {
            connector: connector.downgrade(),
        });
        let id = connector.inner.config.id;
        if let Err(err) = connector.add_callback(id, CONTROL_NAME, control).await {
            tracing::error!(
                idx = id.idx,
                val = id.val,
                error = %err,
                "failed to register control handler"
            );
            connector
                .inner
                .queue
                .destroy(connector.inner.config.teardown_log_interval())
                .await;
            return Err(err);
        }

        tracing::info!(
            idx = id.idx,
            val = id.val,
            queue = %connector.inner.queue.name(),
            "connector initialized"
        );
        Ok(connector)
    }

    pub fn downgrade(&self) -> WeakConnector {
        WeakConnector {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ConnectorError::ShutDown);
        }
        Ok(())
    }

    // -- Registration -------------------------------------------------------

    /// Register `handler` for `id` and notify subscribers.
    ///
    /// Fails with [`ConnectorError::DuplicateIdentifier`] if `id` is taken.
    pub async fn add_callback(
        &self,
        id: CbId,
        name: &str,
        handler: Arc<dyn Callback>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.inner.queue.add(name, id, handler)?;
        self.notify(id, NotifyEvent::Added).await;
        Ok(())
    }

    /// Unregister the handler for `id` and notify subscribers.
    ///
    /// Waits for any running dispatch of the handler to finish.  Does
    /// nothing if `id` is not registered.  Must not be called from a handler.
    pub async fn del_callback(&self, id: CbId) {
        if self.inner.queue.remove(id).await {
            self.notify(id, NotifyEvent::Removed).await;
        }
    }

    async fn notify(&self, id: CbId, event: NotifyEvent) {
        self.inner
            .notify
            .notify(id, event, |msg, group| self.send(msg, group, AllocPolicy::MaySleep))
            .await;
    }

    // -- Outbound -----------------------------------------------------------

    /// Broadcast `msg`.
    ///
    /// With `group == 0` the group assigned to the callback registered for
    /// `msg.id` is used, failing with [`ConnectorError::NoDestination`] if
    /// there is none.  Transport-side delivery failures are not reported.
    pub fn send(&self, msg: &CnMsg, group: u32, policy: AllocPolicy) -> Result<()> {
        let group = match group {
            0 => self
                .inner
                .queue
                .group_of(msg.id)
                .ok_or(ConnectorError::NoDestination { id: msg.id })?,
            explicit => explicit,
        };

        let frame = msg.encode_frame(self.inner.config.max_msg_size)?;

        match self.inner.transport.broadcast(group, frame, policy) {
            Ok(listeners) => {
                tracing::trace!(
                    idx = msg.id.idx,
                    val = msg.id.val,
                    group,
                    listeners,
                    "message sent"
                );
            }
            Err(err) => {
                tracing::debug!(
                    idx = msg.id.idx,
                    val = msg.id.val,
                    group,
                    error = %err,
                    "broadcast failed"
                );
            }
        }
        Ok(())
    }

    // -- Inbound ------------------------------------------------------------

    /// Route one raw frame to its handler.
    ///
    /// The frame is held until the handler has run, then released.  On
    /// error it is released before return.
    pub fn receive(&self, frame: InboundFrame) -> Result<()> {
        let hdr = NlMsgHdr::parse_frame(&frame.data, self.inner.config.max_msg_size)?;

        if !frame.creds.admin {
            return Err(ConnectorError::PermissionDenied {
                pid: frame.creds.pid,
            });
        }

        let msg = CnMsg::decode(&frame.data[NLMSG_HDRLEN..hdr.len as usize])?;
        tracing::trace!(
            idx = msg.id.idx,
            val = msg.id.val,
            seq = msg.seq,
            pid = frame.creds.pid,
            group = frame.group,
            "frame received"
        );

        let release: Release = Box::new(move || drop(frame));
        self.call(msg, Some(release))
    }

    /// Route a batch of frames, discarding any that fail.
    pub fn input(&self, frames: impl IntoIterator<Item = InboundFrame>) {
        for frame in frames {
            if let Err(err) = self.receive(frame) {
                tracing::debug!(error = %err, errno = err.errno(), "inbound frame discarded");
            }
        }
    }

    /// Queue `msg` for the handler registered under `msg.id`.
    ///
    /// `release` runs exactly once: after the handler, or before return if
    /// the message is refused.
    pub fn call(&self, msg: CnMsg, release: Option<Release>) -> Result<()> {
        let payload = Payload::new(msg, release);
        self.ensure_running()?;
        self.inner.queue.dispatch(payload)
    }

    // -- Introspection ------------------------------------------------------

    /// Wait until every dispatch queued so far has run.
    pub async fn flush(&self) {
        self.inner.queue.flush().await;
    }

    /// Registered callbacks, in registration order.
    pub fn callbacks(&self) -> Vec<CallbackInfo> {
        self.inner.queue.snapshot()
    }

    /// Current subscriptions, in arrival order.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.notify.snapshot().await
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.inner.queue.stats()
    }

    /// Next sequence number for messages originating from the callback
    /// registered under `id`.
    pub fn next_seq(&self, id: CbId) -> Option<u32> {
        self.inner.queue.next_seq(id)
    }

    /// Outstanding references on the callback queue.
    pub fn refcnt(&self) -> usize {
        self.inner.queue.refcnt()
    }

    // -- Teardown -----------------------------------------------------------

    /// Stop the connector.
    ///
    /// Unregisters the control handler, then destroys the callback queue,
    /// waiting for every dispatch and reference to drain.  Later calls are
    /// no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.del_callback(self.inner.config.id).await;
        self.inner
            .queue
            .destroy(self.inner.config.teardown_log_interval())
            .await;

        tracing::info!(queue = %self.inner.queue.name(), "connector shut down");
    }
}

// ---------------------------------------------------------------------------
// Control handler
// ---------------------------------------------------------------------------

/// Built-in handler for subscription requests.
struct ControlHandler {
    connector: WeakConnector,
}

#[async_trait]
impl Callback for ControlHandler {
    async fn call(&self, msg: &CnMsg) {
        let Some(connector) = self.connector.upgrade() else {
            return;
        };

        match CtlMsg::parse(&msg.data) {
            Ok(ctl) => connector.inner.notify.apply(ctl).await,
            Err(err) => {
                tracing::debug!(seq = msg.seq, error = %err, "control message dropped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
