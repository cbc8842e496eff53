// =============================================================================
// Push Channel WebSocket — `/ws/trading/ws/{challenge_id}?token=...`
// =============================================================================
//
// Grounded on the teacher's `api::ws` upgrade handler (validate before
// `on_upgrade`, split the socket, `tokio::select!` between an outbound push
// loop and an inbound recv loop that answers Ping with Pong) but driven by
// the per-challenge Push Channel (spec.md §4.8) instead of a 500ms snapshot
// poll: every event the subscription yields is forwarded as soon as it's
// available, with no periodic tick of its own.
//
// spec.md §6 describes the wire frame as `{type, data}`; `PushEvent`'s serde
// representation is internally tagged (`type` sits alongside the payload
// fields, not nested under a `data` key), so `to_frame` re-shapes each event
// into the two-field envelope before it goes over the wire.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::push_channel::PushEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(challenge_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return (axum::http::StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let claims = match state.session_gateway.decode_access_token(&token) {
        Ok(c) => c,
        Err(_) => return (axum::http::StatusCode::UNAUTHORIZED, "invalid token").into_response(),
    };

    let challenge = match state.pg.get_challenge(challenge_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return (axum::http::StatusCode::NOT_FOUND, "challenge not found").into_response(),
        Err(e) => {
            warn!(error = %e, "ws: failed to load challenge");
            return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };
    let is_owner_or_admin = challenge.user_id == claims.sub || claims.role.is_admin();
    if !is_owner_or_admin {
        return (axum::http::StatusCode::NOT_FOUND, "challenge not found").into_response();
    }

    info!(%challenge_id, user_id = %claims.sub, "push channel connection accepted");
    ws.on_upgrade(move |socket| run(socket, state, challenge_id))
        .into_response()
}

async fn run(socket: WebSocket, state: Arc<AppState>, challenge_id: Uuid) {
    let subscription = state.push.subscribe(challenge_id);
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let frame = to_frame(&event);
                let Ok(text) = serde_json::to_string(&frame) else {
                    warn!(%challenge_id, "failed to serialize push frame, skipping");
                    continue;
                };
                if let Err(e) = sender.send(Message::Text(text.into())).await {
                    debug!(%challenge_id, error = %e, "push channel send failed — disconnecting");
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%challenge_id, error = %e, "push channel recv error — disconnecting");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(%challenge_id, "push channel connection closed");
}

/// Re-shapes an internally-tagged `PushEvent` into the `{type, data}` wire
/// frame spec.md §6 describes.
fn to_frame(event: &PushEvent) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or(Value::Null);
    let Value::Object(map) = &mut value else {
        return json!({ "type": "unknown", "data": Value::Null });
    };
    let ty = map.remove("type").unwrap_or(Value::Null);
    json!({ "type": ty, "data": Value::Object(map.clone()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_channel::BalanceUpdatePayload;

    #[test]
    fn to_frame_splits_tag_from_payload() {
        let event = PushEvent::BalanceUpdate(BalanceUpdatePayload {
            challenge_id: Uuid::nil(),
            current_balance: 100.0,
            equity: 100.0,
            open_position_count: 0,
        });
        let frame = to_frame(&event);
        assert_eq!(frame["type"], "balance_update");
        assert_eq!(frame["data"]["current_balance"], 100.0);
    }
}
