//! Kernel connector.
//!
//! A message bus between privileged user-space peers and in-process
//! handlers.  Handlers register under a two-part identifier, inbound frames
//! are routed to the matching handler on a serial dispatch worker, and
//! subscribers hear about handlers coming and going.
//!
//! - **[`connector`]** -- The [`Connector`] context object: inbound
//!   validation, outbound broadcast, registration and the built-in control
//!   handler.
//! - **[`queue`]** -- Insertion-ordered callback registry with reference
//!   counted teardown.
//! - **[`dispatch`]** -- Serial dispatch worker built on
//!   [`crossbeam::queue::SegQueue`], with an embedded slot per handler and a
//!   bounded standalone fallback.
//! - **[`notify`]** -- Subscription registry for add/remove events.
//! - **[`message`]** -- Wire layout of frames, envelopes and control
//!   messages.
//! - **[`transport`]** -- The transport boundary and an in-process loopback
//!   backed by [`tokio::sync::broadcast`].
//! - **[`config`]** -- Tunables, loadable from TOML.
//! - **[`error`]** -- Unified error type via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod notify;
pub mod queue;
pub mod transport;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::{CN_IDX_CONNECTOR, CN_VAL_CONNECTOR, ConnectorConfig};
pub use connector::{Connector, WeakConnector};
pub use dispatch::{Callback, FnCallback, Payload, Release, callback_fn};
pub use error::{ConnectorError, Result};
pub use message::{CbId, CnMsg, CtlMsg, NlMsgHdr, NotifyReq};
pub use notify::{NotifyEvent, NotifyRegistry, Subscription};
pub use queue::{CallbackInfo, CallbackQueue, DispatchStats, RefCount};
pub use transport::{
    AllocPolicy, BroadcastFrame, Credentials, GroupReceiver, InboundFrame, LoopbackTransport,
    Transport,
};
