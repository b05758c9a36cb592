//! WebSocket chat endpoint.
//!
//! Each accepted socket becomes one session in its tenant's hub. The socket
//! halves are pumped by two tasks: hub frames out, publish requests in. A
//! closed or broken socket simply leaves the hub; there is no timeout-driven
//! disconnection.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::auth::{self, Claims};
use super::routes::AppState;
use crate::hub::{ChatError, ConnId, OutboundFrame};
use crate::tenant::TenantId;

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Inbound publish frame. Only `text` is read; authorship always comes from
/// the verified session identity, so a client-supplied `user` is ignored.
#[derive(Debug, Deserialize)]
struct PublishFrame {
    text: String,
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
) -> impl IntoResponse {
    let token = match auth::token_from_ws(&headers, query.token.as_deref()) {
        Some(t) => t,
        None => return (StatusCode::UNAUTHORIZED, "Missing websocket JWT").into_response(),
    };
    let claims = match auth::verify_jwt(&token, &state.config.jwt_secret) {
        Ok(c) => c,
        Err(_) => return (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    };
    // Chat is tenant-scoped; superadmins have no room of their own.
    let Some(tenant) = claims.tenant else {
        return (
            StatusCode::FORBIDDEN,
            "Chat requires an organization context",
        )
            .into_response();
    };

    ws.protocols(["orgboard"])
        .on_upgrade(move |socket| handle_chat(socket, state, claims, tenant))
}

async fn handle_chat(socket: WebSocket, state: Arc<AppState>, claims: Claims, tenant: TenantId) {
    let hub = state.hubs.hub_for(tenant).await;
    let conn = ConnId::new();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    if hub
        .join(conn, claims.usr.clone(), claims.muted, out_tx.clone())
        .is_err()
    {
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Hub -> WS
    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // WS -> hub
    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(raw) => {
                let Ok(frame) = serde_json::from_str::<PublishFrame>(&raw) else {
                    continue;
                };
                match hub.publish(conn, frame.text).await {
                    Ok(()) => {}
                    Err(err @ ChatError::Muted) => {
                        // Surfaced to the sender only; nobody else sees it.
                        let _ = out_tx.send(OutboundFrame::Error {
                            error: err.to_string(),
                        });
                    }
                    Err(_) => break,
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.leave(conn);
    send_task.abort();
    tracing::debug!(%tenant, user = %claims.usr, "chat connection closed");
}
