//! Keepalive pings.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use super::{ClientError, ClientInner};
use crate::binary::Node;
use crate::events::Event;
use crate::types::Jid;

pub(crate) const PING_XMLNS: &str = "urn:xmpp:ping";

pub(crate) fn ping_node() -> Node {
    Node::new("iq")
        .attr("to", Jid::server())
        .attr("type", "get")
        .attr("xmlns", PING_XMLNS)
        .children_nodes(vec![Node::new("ping")])
}

/// Ping until the session ends; the connection task aborts this task
pub(crate) async fn run(inner: Arc<ClientInner>) {
    let config = inner.config.keepalive;
    let mut error_count = 0u32;
    let mut last_success = SystemTime::now();

    loop {
        tokio::time::sleep(config.interval).await;

        match inner.send_iq(ping_node(), config.timeout).await {
            Ok(_) => {
                if error_count > 0 {
                    debug!(target: "tether::client", "keepalive restored after {} failures", error_count);
                    error_count = 0;
                    let _ = inner.queue_event(Event::KeepAliveRestored);
                }
                last_success = SystemTime::now();
            }
            Err(ClientError::NotConnected) => return,
            Err(e) => {
                error_count += 1;
                warn!(target: "tether::client", "keepalive failed ({}): {}", error_count, e);
                let _ = inner.queue_event(Event::KeepAliveTimeout {
                    error_count,
                    last_success: Some(last_success),
                });

                let failing_for = last_success.elapsed().unwrap_or_default();
                if failing_for > config.max_failure {
                    let _ = inner.force_reconnect();
                    return;
                }
            }
        }
    }
}
