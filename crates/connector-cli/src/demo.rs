//! The `demo` subcommand: a request/reply round trip over the loopback
//! transport, with add/remove notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use connector_kernel::{
    AllocPolicy, Callback, CbId, CnMsg, Connector, ConnectorConfig, Credentials, CtlMsg,
    GroupReceiver, InboundFrame, LoopbackTransport, NotifyEvent, NotifyReq, WeakConnector,
};
use tracing::{info, warn};

/// How long to wait for any single broadcast.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequence number of the demo request.
const REQUEST_SEQ: u32 = 1;

// ---------------------------------------------------------------------------
// Echo handler
// ---------------------------------------------------------------------------

/// Replies to every request with its payload prefixed by `echo: `.
struct EchoHandler {
    connector: WeakConnector,
}

#[async_trait]
impl Callback for EchoHandler {
    async fn call(&self, msg: &CnMsg) {
        let Some(connector) = self.connector.upgrade() else {
            return;
        };

        let mut data = b"echo: ".to_vec();
        data.extend_from_slice(&msg.data);
        let reply = msg.reply(data);

        if let Err(e) = connector.send(&reply, 0, AllocPolicy::Atomic) {
            warn!(idx = msg.id.idx, val = msg.id.val, error = %e, "echo reply failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand
// ---------------------------------------------------------------------------

pub async fn cmd_demo(config: ConnectorConfig, id: CbId, group: u32) -> Result<()> {
    anyhow::ensure!(group != 0, "notification group must be nonzero");
    anyhow::ensure!(id != config.id, "identifier {id} is reserved for the control handler");

    let transport = LoopbackTransport::new(64);
    let connector = Connector::init(config, Arc::new(transport.clone()))
        .await
        .context("failed to initialize connector")?;

    let result = run(&connector, &transport, id, group).await;
    connector.shutdown().await;

    let stats = connector.dispatch_stats();
    println!();
    println!(
        "  dispatches: {} embedded, {} fallback",
        stats.embedded, stats.fallback
    );
    result
}

async fn run(
    connector: &Connector,
    transport: &LoopbackTransport,
    id: CbId,
    group: u32,
) -> Result<()> {
    let peer = Credentials::root(std::process::id());

    // 1. Subscribe `group` to events on exactly this identifier.
    let mut events = transport.subscribe(group);
    let request = CtlMsg::new(
        group,
        vec![NotifyReq::new(id.idx, 1)],
        vec![NotifyReq::new(id.val, 1)],
    );
    let frame = CnMsg::new(connector.config().id, request.encode())
        .encode_frame(connector.config().max_msg_size)
        .context("failed to encode subscription request")?;
    connector
        .receive(InboundFrame::new(frame, peer))
        .context("subscription request rejected")?;
    connector.flush().await;
    info!(group, "notification listener subscribed");

    // 2. Register the echo handler.
    let mut replies = transport.subscribe(id.idx);
    let handler = Arc::new(EchoHandler {
        connector: connector.downgrade(),
    });
    connector
        .add_callback(id, "echo", handler)
        .await
        .context("failed to register echo handler")?;
    print_event(&mut events, NotifyEvent::Added).await?;

    // 3. Send a request as a privileged peer and wait for the reply.
    let frame = CnMsg::new(id, b"hello".to_vec())
        .with_seq(REQUEST_SEQ)
        .encode_frame(connector.config().max_msg_size)
        .context("failed to encode request")?;
    connector
        .receive(InboundFrame::new(frame, peer))
        .context("request rejected")?;

    let reply = recv_matching(&mut replies, |m| {
        m.id == id && m.ack == REQUEST_SEQ.wrapping_add(1)
    })
    .await
    .context("no reply from echo handler")?;
    println!(
        "  reply    {} seq={} ack={} data={:?}",
        reply.id,
        reply.seq,
        reply.ack,
        String::from_utf8_lossy(&reply.data)
    );

    // 4. Remove the handler.
    connector.del_callback(id).await;
    print_event(&mut events, NotifyEvent::Removed).await?;

    Ok(())
}

async fn print_event(events: &mut GroupReceiver, event: NotifyEvent) -> Result<()> {
    let msg = recv_matching(events, |m| m.data.is_empty() && m.ack == event.code())
        .await
        .with_context(|| format!("no {event:?} notification on group {}", events.group()))?;
    println!("  notify   {} {:?} (group {})", msg.id, event, events.group());
    Ok(())
}

/// Wait for the next message satisfying `pred`, skipping others.
async fn recv_matching(
    rx: &mut GroupReceiver,
    pred: impl Fn(&CnMsg) -> bool,
) -> Result<CnMsg> {
    let wait = async {
        while let Some(msg) = rx.recv().await {
            if pred(&msg) {
                return Some(msg);
            }
        }
        None
    };

    match tokio::time::timeout(RECV_TIMEOUT, wait).await {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => anyhow::bail!("transport closed"),
        Err(_) => anyhow::bail!("timed out after {RECV_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_round_trip_succeeds() {
        let config = ConnectorConfig::new().with_teardown_log_interval_ms(10);
        cmd_demo(config, CbId::new(123, 456), 7)
            .await
            .expect("demo runs");
    }

    #[tokio::test]
    async fn demo_shares_group_with_handler() {
        // Replies and notifications on one group are told apart by ack.
        let config = ConnectorConfig::new().with_teardown_log_interval_ms(10);
        cmd_demo(config, CbId::new(9, 1), 9)
            .await
            .expect("demo runs");
    }

    #[tokio::test]
    async fn control_identifier_is_refused() {
        let config = ConnectorConfig::new();
        let id = config.id;
        assert!(cmd_demo(config, id, 7).await.is_err());
    }
}
