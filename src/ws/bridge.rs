//! The WebSocket bridge between a browser and a session's terminal daemon.
//!
//! The bridge holds a registry handle for its whole lifetime, so deletion
//! cannot reclaim the port or container underneath it. Frames pass through
//! verbatim in both directions; the bridge only watches daemon pongs to
//! notice a dead peer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio_tungstenite::tungstenite::{
    self, protocol::CloseFrame as TungsteniteCloseFrame, Message as TungsteniteMessage,
};

use crate::api::handlers::verify_owner;
use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::session::SessionHandle;

use super::{dial_daemon, TERMINAL_SUBPROTOCOL};

/// How often the bridge pings the daemon.
const DAEMON_PING_INTERVAL: Duration = Duration::from_secs(20);

/// A daemon that has not ponged for this long is considered dead.
const DAEMON_PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Convert an axum WebSocket message to a tungstenite message. The two
/// libraries model the same frames with distinct types.
fn axum_to_tungstenite(msg: AxumMessage) -> TungsteniteMessage {
    match msg {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text.as_str().to_string().into()),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data.to_vec().into()),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data.to_vec().into()),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data.to_vec().into()),
        AxumMessage::Close(frame) => {
            TungsteniteMessage::Close(frame.map(|f| TungsteniteCloseFrame {
                code: tungstenite::protocol::frame::coding::CloseCode::from(f.code),
                reason: f.reason.to_string().into(),
            }))
        }
    }
}

/// Convert a tungstenite message to an axum WebSocket message.
fn tungstenite_to_axum(msg: TungsteniteMessage) -> Option<AxumMessage> {
    match msg {
        TungsteniteMessage::Text(text) => Some(AxumMessage::Text(text.as_str().to_string().into())),
        TungsteniteMessage::Binary(data) => Some(AxumMessage::Binary(data.to_vec().into())),
        TungsteniteMessage::Ping(data) => Some(AxumMessage::Ping(data.to_vec().into())),
        TungsteniteMessage::Pong(data) => Some(AxumMessage::Pong(data.to_vec().into())),
        TungsteniteMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
        TungsteniteMessage::Frame(_) => None,
    }
}

/// Subprotocols the client offered on the upgrade request.
fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default()
}

/// GET /terminal/{id}/ws - upgrade and bridge to the session's daemon.
pub async fn terminal_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    verify_owner(&state, &user, &session_id)?;

    let offered = offered_protocols(&headers);
    if !offered.iter().any(|p| p == TERMINAL_SUBPROTOCOL) {
        return Err(ApiError::bad_request(format!(
            "subprotocol {} required",
            TERMINAL_SUBPROTOCOL
        )));
    }

    // The handle keeps the container and port alive for the bridge's
    // lifetime; acquisition fails once deletion has been requested.
    let handle = state.registry.acquire(&session_id)?;
    state.registry.touch(&session_id);

    debug!("bridging session {} for user {}", session_id, user.username);

    Ok(ws
        .protocols([TERMINAL_SUBPROTOCOL])
        .on_upgrade(move |socket| bridge(socket, handle)))
}

/// Shuttle frames between the client and the daemon until either side
/// closes, then release the handle exactly once.
async fn bridge(client_socket: WebSocket, handle: SessionHandle) {
    let session_id = handle.id().to_string();

    let daemon_socket = match dial_daemon(handle.port()).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                "failed to dial terminal daemon for session {}: {}",
                session_id, e
            );
            let mut client = client_socket;
            let _ = client
                .send(AxumMessage::Close(Some(AxumCloseFrame {
                    code: 1011,
                    reason: "terminal daemon unavailable".into(),
                })))
                .await;
            handle.release().await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut daemon_tx, mut daemon_rx) = daemon_socket.split();

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let pong_seen = last_pong.clone();
    // Resolves true when the daemon went silent on pings, false when the
    // client side ended the bridge.
    let client_to_daemon = async {
        let mut ping = tokio::time::interval(DAEMON_PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = client_rx.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let closing = matches!(msg, AxumMessage::Close(_));
                            if daemon_tx.send(axum_to_tungstenite(msg)).await.is_err() {
                                return false;
                            }
                            if closing {
                                return false;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("client websocket error: {}", e);
                            return false;
                        }
                        None => return false,
                    }
                }
                _ = ping.tick() => {
                    let silent_for = pong_seen
                        .lock()
                        .map(|t| t.elapsed())
                        .unwrap_or(DAEMON_PONG_TIMEOUT);
                    if silent_for >= DAEMON_PONG_TIMEOUT {
                        warn!("terminal daemon for session stopped answering pings");
                        return true;
                    }
                    if daemon_tx
                        .send(TungsteniteMessage::Ping(Vec::new().into()))
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
            }
        }
    };

    let pong_mark = last_pong.clone();
    let daemon_to_client = async {
        while let Some(result) = daemon_rx.next().await {
            match result {
                Ok(msg) => {
                    if matches!(msg, TungsteniteMessage::Pong(_)) {
                        if let Ok(mut t) = pong_mark.lock() {
                            *t = Instant::now();
                        }
                    }
                    if let Some(axum_msg) = tungstenite_to_axum(msg) {
                        if client_tx.send(axum_msg).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!("daemon websocket error: {}", e);
                    break;
                }
            }
        }
    };

    // Either direction ending cancels the other.
    let daemon_silent = tokio::select! {
        silent = client_to_daemon => {
            debug!("client side of bridge for {} closed", session_id);
            silent
        }
        _ = daemon_to_client => {
            debug!("daemon side of bridge for {} closed", session_id);
            false
        }
    };

    // Whichever direction ended first, both peers get an explicit close.
    // A daemon that stopped answering tells the browser why; in every
    // other case the daemon's own close frame was already forwarded or
    // the client is the one who hung up. Closing twice is harmless.
    if daemon_silent {
        let _ = client_tx
            .send(AxumMessage::Close(Some(AxumCloseFrame {
                code: 1011,
                reason: "terminal daemon unresponsive".into(),
            })))
            .await;
    }
    let _ = client_tx.close().await;
    let _ = daemon_tx.close().await;

    handle.release().await;
    debug!("bridge for session {} ended", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offered_protocols() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", "tty, chat".parse().unwrap());
        assert_eq!(offered_protocols(&headers), vec!["tty", "chat"]);
        assert!(offered_protocols(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn test_binary_frames_survive_conversion() {
        let payload = vec![0x30, b'l', b's', 0x0d];
        let msg = axum_to_tungstenite(AxumMessage::Binary(payload.clone().into()));
        match msg {
            TungsteniteMessage::Binary(data) => assert_eq!(data.to_vec(), payload),
            other => panic!("expected binary frame, got {:?}", other),
        }

        let back = tungstenite_to_axum(TungsteniteMessage::Binary(payload.clone().into())).unwrap();
        match back {
            AxumMessage::Binary(data) => assert_eq!(data.to_vec(), payload),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    #[test]
    fn test_text_frames_survive_conversion() {
        let msg = axum_to_tungstenite(AxumMessage::Text("hello".into()));
        match msg {
            TungsteniteMessage::Text(text) => assert_eq!(text.as_str(), "hello"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_close_frame_code_propagates() {
        let msg = axum_to_tungstenite(AxumMessage::Close(Some(AxumCloseFrame {
            code: 1001,
            reason: "going away".into(),
        })));
        match msg {
            TungsteniteMessage::Close(Some(frame)) => {
                let code: u16 = frame.code.into();
                assert_eq!(code, 1001);
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
