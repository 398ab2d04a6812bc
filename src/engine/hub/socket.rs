// ── WebSocket endpoint ─────────────────────────────────────────────────────
// Wire format on /api/v1/ws: JSON frames {type, payload, id?}. The bearer
// token rides the handshake query (or Authorization header) and is verified
// once; the claims live on the connection context afterwards. One writer
// task per socket preserves send order; the read loop handles frames
// sequentially.

use crate::atoms::types::{ClientEvent, ServerEvent};
use crate::engine::auth::TokenSigner;
use crate::engine::hub::{ConnCtx, OutboundFrame, SessionHub};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    event: ClientEvent,
}

/// Serialize a server event into a wire frame, echoing the client's `id`
/// when replying to a specific frame.
fn outbound_frame(event: &ServerEvent, id: Option<&str>) -> String {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| {
        serde_json::json!({"type": "error", "payload": {"code": "internal_error", "message": "serialization failed"}})
    });
    if let (Some(id), Some(obj)) = (id, value.as_object_mut()) {
        obj.insert("id".into(), serde_json::Value::String(id.to_string()));
    }
    value.to_string()
}

/// Upgrade handler. Verifies the token before upgrading; a bad token is a
/// plain 401 with no WebSocket.
pub fn upgrade(
    hub: Arc<SessionHub>,
    signer: Arc<TokenSigner>,
    ws: WebSocketUpgrade,
    token: Option<String>,
) -> Response {
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let claims = match signer.verify_connect(&token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("[hub] WS handshake rejected: {e}");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_socket(hub, claims.sub, claims.role, socket))
}

async fn run_socket(
    hub: Arc<SessionHub>,
    user_id: String,
    role: crate::atoms::types::UserRole,
    socket: WebSocket,
) {
    let (conn_id, mut outbound_rx, outbound_tx) = hub.connect();
    let ctx = ConnCtx {
        conn_id,
        user_id: user_id.clone(),
        role,
    };
    info!("[hub] Socket {} connected for {}", conn_id, user_id);

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Single writer per connection: everything the hub fans out to this
    // socket funnels through one task.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let frame = outbound_frame(&outbound.event, outbound.reply_to.as_deref());
            if ws_sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(message) = ws_stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("[hub] Socket {conn_id} read error: {e}");
                break;
            }
        };

        match message {
            WsMessage::Text(text) => {
                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = outbound_tx
                            .send(OutboundFrame {
                                event: ServerEvent::Error {
                                    code: "validation_error".into(),
                                    message: format!("malformed frame: {e}"),
                                },
                                reply_to: None,
                            })
                            .await;
                        continue;
                    }
                };

                if let Err(e) = hub.handle_event(&ctx, &outbound_tx, frame.event).await {
                    // Per-frame failures go to this socket only, echoing the
                    // frame id so the client can correlate.
                    let _ = outbound_tx
                        .send(OutboundFrame {
                            event: ServerEvent::Error {
                                code: e.code().into(),
                                message: e.to_string(),
                            },
                            reply_to: frame.id,
                        })
                        .await;
                }
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                // axum answers pings at the protocol layer.
            }
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {
                let _ = outbound_tx
                    .send(
                        ServerEvent::Error {
                            code: "validation_error".into(),
                            message: "binary frames are not supported".into(),
                        }
                        .into(),
                    )
                    .await;
            }
        }
    }

    hub.disconnect(&ctx);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frame_parses_with_and_without_id() {
        let with_id: InboundFrame = serde_json::from_str(
            r#"{"id": "42", "type": "typing_start", "payload": {"conversation_id": "c1"}}"#,
        )
        .unwrap();
        assert_eq!(with_id.id.as_deref(), Some("42"));

        let without: InboundFrame = serde_json::from_str(
            r#"{"type": "leave_conversation", "payload": {"conversation_id": "c1"}}"#,
        )
        .unwrap();
        assert!(without.id.is_none());
    }

    #[test]
    fn outbound_frame_echoes_id() {
        let event = ServerEvent::Error {
            code: "conflict".into(),
            message: "already claimed".into(),
        };
        let frame = outbound_frame(&event, Some("7"));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], "7");
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "conflict");
    }
}
