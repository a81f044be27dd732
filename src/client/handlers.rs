//! Node handlers run by the connection task.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::connection::{Flow, Session, SessionEnd};
use super::{keepalive, ClientInner};
use crate::binary::Node;
use crate::events::{timestamp_from_secs, Event, MessageContent, MessageEvent, MessageInfo};
use crate::pairing::{
    handle_pair_success, make_qr_code, pair_error_reply, pair_sign_reply, PairError, PairSuccess,
};
use crate::session::{EncType, SessionCipher, SessionError};
use crate::transport::NoiseSocket;
use crate::types::Jid;

/// Stream error code asking for a fresh connection
const RESTART_REQUIRED: &str = "515";
const UNAUTHORIZED: &str = "401";
const CLIENT_OUTDATED: &str = "405";

pub(crate) async fn handle_node(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    session: &mut Session,
    node: Node,
) -> Flow {
    let result = match node.tag.as_str() {
        "iq" => handle_iq(inner, socket, &node).await,
        "success" => Ok(handle_success(inner, session, &node)),
        "failure" => Ok(handle_failure(inner, &node)),
        "stream:error" => Ok(handle_stream_error(inner, &node)),
        "message" => handle_message(inner, socket, &node).await,
        "ib" => {
            debug!(target: "tether::client", "ignoring ib: {}", node);
            Ok(Flow::Continue)
        }
        "ack" | "receipt" => Ok(Flow::Continue),
        other => {
            debug!(target: "tether::client", "unhandled <{}> node", other);
            Ok(Flow::Continue)
        }
    };

    result.unwrap_or_else(|e| {
        debug!(target: "tether::client", "send failed: {}", e);
        Flow::End(SessionEnd::Lost)
    })
}

fn reply_to(iq: &Node) -> Node {
    let mut reply = Node::new("iq")
        .attr("to", Jid::server())
        .attr("type", "result");
    if let Some(id) = iq.get_attr("id") {
        reply = reply.attr("id", id);
    }
    reply
}

async fn handle_iq(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    iq: &Node,
) -> crate::transport::TransportResult<Flow> {
    match iq.get_attr("type") {
        Some("result") | Some("error") => {
            if !inner.resolve_iq(iq) {
                debug!(target: "tether::client", "response to unknown iq {:?}", iq.get_attr("id"));
            }
        }
        Some("get") if iq.get_attr("xmlns") == Some(keepalive::PING_XMLNS) => {
            socket.send_node(&reply_to(iq)).await?;
        }
        Some("set") if iq.child_by_tag("pair-device").is_some() => {
            handle_pair_device(inner, socket, iq).await?;
        }
        Some("set") if iq.child_by_tag("pair-success").is_some() => {
            handle_pair_success_iq(inner, socket, iq).await?;
        }
        _ => debug!(target: "tether::client", "unhandled iq: {}", iq),
    }
    Ok(Flow::Continue)
}

async fn handle_pair_device(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    iq: &Node,
) -> crate::transport::TransportResult<()> {
    socket.send_node(&reply_to(iq)).await?;

    let codes: Vec<String> = {
        let device = inner.device();
        iq.child_by_tag("pair-device")
            .into_iter()
            .flat_map(|pair| pair.children_by_tag("ref"))
            .filter_map(Node::bytes)
            .map(|reference| make_qr_code(&String::from_utf8_lossy(reference), &device))
            .collect()
    };
    info!(target: "tether::client", "received {} pairing refs", codes.len());
    inner.dispatcher.dispatch(&Event::Qr { codes });
    Ok(())
}

async fn handle_pair_success_iq(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    iq: &Node,
) -> crate::transport::TransportResult<()> {
    let request_id = iq.get_attr("id").unwrap_or_default();

    let (success, outcome) = match PairSuccess::parse(iq) {
        Ok(success) => {
            let mut device = inner.device().clone();
            let outcome = handle_pair_success(&mut device, &inner.store, &success);
            if outcome.is_ok() {
                *inner.device() = device;
            }
            (Some(success), outcome)
        }
        Err(e) => (None, Err(e)),
    };

    match outcome {
        Ok(paired) => {
            socket.send_node(&pair_sign_reply(request_id, &paired)).await?;
            if let Some(success) = success {
                inner.dispatcher.dispatch(&Event::PairSuccess {
                    id: success.id,
                    business_name: success.business_name,
                    platform: success.platform,
                });
            }
        }
        Err(error) => {
            warn!(target: "tether::client", "pairing failed: {}", error);
            socket.send_node(&pair_error_reply(request_id, &error)).await?;
            inner.dispatcher.dispatch(&pair_error_event(success, &error));
        }
    }
    Ok(())
}

fn pair_error_event(success: Option<PairSuccess>, error: &PairError) -> Event {
    let (id, business_name, platform) = match success {
        Some(success) => (success.id, success.business_name, success.platform),
        None => Default::default(),
    };
    Event::PairError {
        id,
        business_name,
        platform,
        error: error.to_string(),
    }
}

fn handle_success(inner: &Arc<ClientInner>, session: &mut Session, node: &Node) -> Flow {
    if let Some(name) = node.get_attr("push_name") {
        let mut device = inner.device();
        if device.push_name != name {
            device.push_name = name.to_string();
            if let Err(e) = inner.store.save_device(&device) {
                warn!(target: "tether::client", "failed to save push name: {}", e);
            }
        }
    }

    inner.set_logged_in();
    info!(target: "tether::client", "logged in as {:?}", inner.device().id);
    if session.keepalive.is_none() {
        session.keepalive = Some(tokio::spawn(keepalive::run(inner.clone())));
    }
    inner.dispatcher.dispatch(&Event::Connected);
    Flow::Continue
}

fn handle_failure(inner: &ClientInner, node: &Node) -> Flow {
    let reason = node.get_attr("reason").unwrap_or_default().to_string();
    warn!(target: "tether::client", "connection refused: {}", node);
    match reason.as_str() {
        UNAUTHORIZED => Flow::End(SessionEnd::LoggedOut {
            on_connect: true,
            reason,
        }),
        CLIENT_OUTDATED => Flow::End(SessionEnd::Outdated),
        _ => {
            inner.dispatcher.dispatch(&Event::StreamError { code: reason });
            Flow::End(SessionEnd::Lost)
        }
    }
}

fn handle_stream_error(inner: &ClientInner, node: &Node) -> Flow {
    let code = node.get_attr("code").unwrap_or_default().to_string();
    match code.as_str() {
        RESTART_REQUIRED => Flow::End(SessionEnd::Restart),
        UNAUTHORIZED => Flow::End(SessionEnd::LoggedOut {
            on_connect: false,
            reason: code,
        }),
        _ if node.child_by_tag("conflict").is_some() => Flow::End(SessionEnd::Replaced),
        _ => {
            warn!(target: "tether::client", "stream error: {}", node);
            inner.dispatcher.dispatch(&Event::StreamError { code });
            Flow::End(SessionEnd::Lost)
        }
    }
}

fn message_info(node: &Node) -> Option<MessageInfo> {
    let sender = node.attr_jid("from")?;
    Some(MessageInfo {
        id: node.get_attr("id")?.to_string(),
        chat: sender.to_non_ad(),
        sender,
        push_name: node.get_attr("notify").unwrap_or_default().to_string(),
        timestamp: node
            .attr_u64("t")
            .map(timestamp_from_secs)
            .unwrap_or_else(SystemTime::now),
    })
}

fn decrypt_message(inner: &ClientInner, info: &MessageInfo, node: &Node) -> Result<MessageContent, String> {
    let enc = node.child_by_tag("enc").ok_or("missing enc node")?;
    let enc_type: EncType = enc
        .get_attr("type")
        .unwrap_or_default()
        .parse()
        .map_err(|e: SessionError| e.to_string())?;
    let payload = enc.bytes().ok_or("enc node has no content")?;

    let device = inner.device();
    let plaintext = SessionCipher::new(&inner.store, &device)
        .and_then(|cipher| cipher.decrypt(&info.sender, enc_type, payload))
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&plaintext).map_err(|e| format!("invalid message body: {}", e))
}

async fn handle_message(
    inner: &Arc<ClientInner>,
    socket: &mut NoiseSocket,
    node: &Node,
) -> crate::transport::TransportResult<Flow> {
    let Some(info) = message_info(node) else {
        warn!(target: "tether::client", "message without id or sender: {}", node);
        return Ok(Flow::Continue);
    };

    match decrypt_message(inner, &info, node) {
        Ok(message) => {
            let receipt = Node::new("receipt")
                .attr("id", &info.id)
                .attr("to", &info.sender);
            socket.send_node(&receipt).await?;
            inner
                .dispatcher
                .dispatch(&Event::Message(MessageEvent { info, message }));
        }
        Err(reason) => {
            warn!(target: "tether::client", "failed to decrypt {} from {}: {}", info.id, info.sender, reason);
            let registration_id = inner.device().registration_id;
            let retry = Node::new("receipt")
                .attr("id", &info.id)
                .attr("to", &info.sender)
                .attr("type", "retry")
                .children_nodes(vec![Node::new("retry")
                    .attr("count", 1)
                    .attr("id", &info.id)
                    .attr("registration", registration_id)]);
            socket.send_node(&retry).await?;
            inner
                .dispatcher
                .dispatch(&Event::UndecryptableMessage { info, reason });
        }
    }
    Ok(Flow::Continue)
}
