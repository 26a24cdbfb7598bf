//! OpAMP WebSocket transport.
//!
//! Agents connect to `/v1/opamp` and exchange binary protobuf frames.
//! Every inbound `AgentToServer` gets one `ServerToAgent` in reply, sent
//! inline on the same task, so delivery to a given agent is strictly
//! ordered by arrival. Pending configs ride on the reply to the next
//! status report rather than being pushed unsolicited.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use prost::Message as _;
use tracing::{debug, warn};
use uuid::Uuid;

use super::proto::{AgentRemoteConfig, AgentToServer, ServerToAgent};
use super::registry::AgentRegistry;
use crate::api::AppState;

/// `GET /v1/opamp` — upgrade to the OpAMP WebSocket.
pub async fn opamp_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = Arc::clone(&state.opamp);
    ws.on_upgrade(move |socket| handle_socket(registry, socket))
}

async fn handle_socket(registry: Arc<AgentRegistry>, mut socket: WebSocket) {
    let mut current_uid: Option<Uuid> = None;

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "OpAMP socket error");
                break;
            }
        };
        match message {
            Message::Binary(bytes) => {
                let inbound = match AgentToServer::decode(bytes.as_ref()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable OpAMP frame");
                        continue;
                    }
                };
                let Ok(uid) = Uuid::from_slice(&inbound.instance_uid) else {
                    warn!(
                        len = inbound.instance_uid.len(),
                        "Dropping OpAMP frame with malformed instance uid"
                    );
                    continue;
                };
                current_uid = Some(uid);

                if inbound.agent_disconnect.is_some() {
                    registry.mark_disconnected(uid);
                    break;
                }

                let description = inbound.agent_description.as_ref().map(|d| {
                    let find = |key: &str| {
                        d.identifying_attributes
                            .iter()
                            .find(|kv| kv.key == key)
                            .and_then(|kv| kv.value.as_ref())
                            .map(|v| crate::model::Value::from(v))
                            .and_then(|v| v.as_str().map(str::to_owned))
                            .unwrap_or_default()
                    };
                    (find("service.name"), find("service.version"))
                });
                let effective = inbound
                    .effective_config
                    .as_ref()
                    .and_then(super::proto::EffectiveConfig::as_text);

                let delivery = registry.handle_status(uid, description, effective);

                let reply = ServerToAgent {
                    instance_uid: inbound.instance_uid.clone(),
                    remote_config: delivery.map(|d| {
                        debug!(instance_id = %uid, "Delivering pending config");
                        AgentRemoteConfig::single_document(&d.body, &d.hash)
                    }),
                    ..Default::default()
                };
                if socket
                    .send(Message::Binary(reply.encode_to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            // Ping/pong are handled by the socket layer; text frames are
            // not part of the protocol.
            _ => {}
        }
    }

    if let Some(uid) = current_uid {
        registry.mark_disconnected(uid);
        debug!(instance_id = %uid, "OpAMP agent disconnected");
    }
}
