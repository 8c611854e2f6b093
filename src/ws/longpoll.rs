//! HTTP long-poll terminal transport.
//!
//! Some networks strip WebSocket upgrades; this transport keeps the
//! daemon-side WebSocket on localhost, buffers its output in a bounded
//! ring, and lets the browser drain it with plain GET/POST requests.
//!
//! A transport holds a registry handle like the WebSocket bridge does, so a
//! session cannot be reclaimed while a long-poll client is attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::api::handlers::verify_owner;
use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::session::{SessionHandle, SessionRegistry};

use super::{dial_daemon, DaemonStream};

/// Output retained for slow pollers.
const MAX_BUFFER_BYTES: usize = 256 * 1024;

/// Transports with no client activity for this long are reaped.
const STALE_AFTER: Duration = Duration::from_secs(300);

/// ttyd command bytes on the wire.
const CMD_OUTPUT: u8 = b'0';
const CMD_INPUT: u8 = b'0';
const CMD_RESIZE: u8 = b'1';

type DaemonSink = SplitSink<DaemonStream, TungsteniteMessage>;

/// Buffered daemon output with a monotonically increasing cursor. The
/// cursor base advances as old bytes are trimmed, so a client that polls
/// too slowly learns it missed data instead of silently skipping it.
#[derive(Debug, Default)]
struct OutputBuffer {
    data: Vec<u8>,
    cursor_base: u64,
}

impl OutputBuffer {
    fn push(&mut self, payload: &[u8]) {
        self.data.extend_from_slice(payload);
        if self.data.len() > MAX_BUFFER_BYTES {
            let trim = self.data.len() - MAX_BUFFER_BYTES;
            self.data.drain(..trim);
            self.cursor_base += trim as u64;
        }
    }

    fn end(&self) -> u64 {
        self.cursor_base + self.data.len() as u64
    }

    /// Data from `cursor` onward, with the new cursor and a missed flag.
    fn read_from(&self, cursor: u64) -> Option<(u64, Vec<u8>, bool)> {
        let effective = cursor.max(self.cursor_base);
        if effective >= self.end() {
            return None;
        }
        let offset = (effective - self.cursor_base) as usize;
        Some((self.end(), self.data[offset..].to_vec(), cursor < self.cursor_base))
    }
}

/// One session's long-poll attachment.
struct Transport {
    session_id: String,
    writer: tokio::sync::Mutex<DaemonSink>,
    buffer: Mutex<OutputBuffer>,
    notify: tokio::sync::Notify,
    connected: std::sync::atomic::AtomicBool,
    last_activity: Mutex<Instant>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    handle: Mutex<Option<SessionHandle>>,
}

impl Transport {
    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

/// Registry of live long-poll transports, one per session at most.
pub struct LongPollTransports {
    transports: Mutex<HashMap<String, Arc<Transport>>>,
}

impl Default for LongPollTransports {
    fn default() -> Self {
        Self::new()
    }
}

impl LongPollTransports {
    pub fn new() -> Self {
        Self {
            transports: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, session_id: &str) -> Option<Arc<Transport>> {
        self.transports
            .lock()
            .expect("transport table lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Attach to a session's daemon: reuse a healthy transport (just
    /// resizing it), or replace a dead one.
    async fn connect(
        &self,
        registry: &Arc<SessionRegistry>,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> ApiResult<()> {
        if let Some(existing) = self.get(session_id) {
            if existing.is_connected() {
                existing.touch();
                let resize = resize_frame(cols, rows);
                let mut writer = existing.writer.lock().await;
                match writer.send(TungsteniteMessage::Binary(resize.into())).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!("existing transport for {} is dead: {}", session_id, e);
                        existing.mark_disconnected();
                    }
                }
            }
            self.cleanup(session_id).await;
        }

        let handle = registry.acquire(session_id)?;

        let daemon = match dial_daemon(handle.port()).await {
            Ok(stream) => stream,
            Err(e) => {
                handle.release().await;
                return Err(ApiError::Unavailable(format!(
                    "failed to connect to terminal: {}",
                    e
                )));
            }
        };

        let (mut sink, stream) = daemon.split();

        // ttyd expects an initial JSON message with the terminal geometry.
        let init = json!({"columns": cols, "rows": rows}).to_string();
        if let Err(e) = sink
            .send(TungsteniteMessage::Binary(init.into_bytes().into()))
            .await
        {
            handle.release().await;
            return Err(ApiError::Unavailable(format!(
                "terminal handshake failed: {}",
                e
            )));
        }

        let transport = Arc::new(Transport {
            session_id: session_id.to_string(),
            writer: tokio::sync::Mutex::new(sink),
            buffer: Mutex::new(OutputBuffer::default()),
            notify: tokio::sync::Notify::new(),
            connected: std::sync::atomic::AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            reader_task: Mutex::new(None),
            handle: Mutex::new(Some(handle)),
        });

        let reader = tokio::spawn(read_daemon_output(transport.clone(), stream));
        *transport
            .reader_task
            .lock()
            .expect("transport lock poisoned") = Some(reader);

        let displaced = self
            .transports
            .lock()
            .expect("transport table lock poisoned")
            .insert(session_id.to_string(), transport);
        if let Some(displaced) = displaced {
            // a concurrent connect slipped in between lookup and insert
            retire(displaced).await;
        }

        info!("long-poll transport attached for session {}", session_id);
        Ok(())
    }

    /// Detach and reclaim everything a transport holds. Safe to call for
    /// unknown sessions.
    pub async fn cleanup(&self, session_id: &str) {
        let transport = self
            .transports
            .lock()
            .expect("transport table lock poisoned")
            .remove(session_id);

        let Some(transport) = transport else {
            return;
        };

        retire(transport).await;

        debug!("long-poll transport for {} cleaned up", session_id);
    }

    /// Session ids of transports that are dead or idle past the limit.
    fn stale_ids(&self) -> Vec<String> {
        self.transports
            .lock()
            .expect("transport table lock poisoned")
            .values()
            .filter(|t| !t.is_connected() || t.idle_for() > STALE_AFTER)
            .map(|t| t.session_id.clone())
            .collect()
    }
}

/// Stop a transport's reader, close its daemon socket, and give back its
/// session reference.
async fn retire(transport: Arc<Transport>) {
    transport.mark_disconnected();

    let reader = transport
        .reader_task
        .lock()
        .expect("transport lock poisoned")
        .take();
    if let Some(task) = reader {
        task.abort();
    }

    {
        let mut writer = transport.writer.lock().await;
        let _ = writer.close().await;
    }

    let handle = transport
        .handle
        .lock()
        .expect("transport lock poisoned")
        .take();
    if let Some(handle) = handle {
        handle.release().await;
    }
}

/// Reader half: buffers daemon output and wakes pollers.
async fn read_daemon_output(transport: Arc<Transport>, mut stream: SplitStream<DaemonStream>) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(TungsteniteMessage::Binary(data)) if !data.is_empty() => {
                if data[0] == CMD_OUTPUT {
                    let mut buffer = transport.buffer.lock().expect("transport lock poisoned");
                    buffer.push(&data[1..]);
                    drop(buffer);
                    transport.notify.notify_waiters();
                }
                // window title and preference frames are ignored
            }
            Ok(TungsteniteMessage::Close(_)) => {
                info!(
                    "terminal daemon closed long-poll transport for {}",
                    transport.session_id
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "long-poll daemon read error for {}: {}",
                    transport.session_id, e
                );
                break;
            }
        }
    }
    transport.mark_disconnected();
}

fn resize_frame(cols: u16, rows: u16) -> Vec<u8> {
    let mut frame = vec![CMD_RESIZE];
    frame.extend_from_slice(json!({"columns": cols, "rows": rows}).to_string().as_bytes());
    frame
}

/// Periodically reap dead and idle transports.
pub fn spawn_transport_reaper(transports: Arc<LongPollTransports>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for session_id in transports.stale_ids() {
                transports.cleanup(&session_id).await;
                info!("reaped stale long-poll transport for {}", session_id);
            }
        }
    });
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// POST /terminal/{id}/connect
pub async fn terminal_connect(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;

    state
        .transports
        .connect(&state.registry, &session_id, query.cols, query.rows)
        .await?;
    state.registry.touch(&session_id);

    Ok(Json(json!({"status": "connected", "session_id": session_id})))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub cursor: u64,
    #[serde(default = "default_poll_timeout")]
    pub timeout: f64,
}

fn default_poll_timeout() -> f64 {
    30.0
}

/// GET /terminal/{id}/poll - long-poll for output past `cursor`.
pub async fn terminal_poll(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;

    let transport = state
        .transports
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found("terminal not connected, call /connect first"))?;

    if !transport.is_connected() {
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }
    transport.touch();

    let timeout = Duration::from_secs_f64(query.timeout.clamp(1.0, 60.0));

    let notified = transport.notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    if let Some(reply) = poll_reply(&transport, query.cursor) {
        return Ok(Json(reply));
    }

    tokio::select! {
        _ = &mut notified => {}
        _ = tokio::time::sleep(timeout) => {}
    }

    if !transport.is_connected() {
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }

    if let Some(reply) = poll_reply(&transport, query.cursor) {
        return Ok(Json(reply));
    }

    let end = transport
        .buffer
        .lock()
        .expect("transport lock poisoned")
        .end();
    Ok(Json(json!({"cursor": end, "data": "", "missed": false})))
}

fn poll_reply(transport: &Transport, cursor: u64) -> Option<serde_json::Value> {
    let buffer = transport.buffer.lock().expect("transport lock poisoned");
    buffer.read_from(cursor).map(|(end, data, missed)| {
        json!({
            "cursor": end,
            "data": BASE64.encode(data),
            "missed": missed,
        })
    })
}

/// POST /terminal/{id}/input - raw keystrokes for the terminal.
pub async fn terminal_input(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;

    let transport = state
        .transports
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found("terminal not connected"))?;
    if !transport.is_connected() {
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }
    transport.touch();

    if body.is_empty() {
        return Ok(Json(json!({"status": "ok"})));
    }

    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(CMD_INPUT);
    frame.extend_from_slice(&body);

    let mut writer = transport.writer.lock().await;
    if let Err(e) = writer.send(TungsteniteMessage::Binary(frame.into())).await {
        transport.mark_disconnected();
        warn!("failed to send input for {}: {}", session_id, e);
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }

    Ok(Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
pub struct ResizeQuery {
    pub cols: u16,
    pub rows: u16,
}

/// POST /terminal/{id}/resize
pub async fn terminal_resize(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    verify_owner(&state, &user, &session_id)?;

    let transport = state
        .transports
        .get(&session_id)
        .ok_or_else(|| ApiError::not_found("terminal not connected"))?;
    if !transport.is_connected() {
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }
    transport.touch();

    let frame = resize_frame(query.cols, query.rows);
    let mut writer = transport.writer.lock().await;
    if let Err(e) = writer.send(TungsteniteMessage::Binary(frame.into())).await {
        transport.mark_disconnected();
        warn!("failed to resize terminal for {}: {}", session_id, e);
        return Err(ApiError::Gone("terminal disconnected".to_string()));
    }

    Ok(Json(json!({"status": "ok"})))
}

/// POST /terminal/{id}/disconnect - detach the transport. Ownership
/// failures do not block cleanup; detaching costs the caller nothing.
pub async fn terminal_disconnect(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let _ = verify_owner(&state, &user, &session_id);

    state.transports.cleanup(&session_id).await;
    Ok(Json(json!({"status": "disconnected"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_cursor_math() {
        let mut buf = OutputBuffer::default();
        buf.push(b"hello");
        buf.push(b" world");

        let (end, data, missed) = buf.read_from(0).unwrap();
        assert_eq!(end, 11);
        assert_eq!(data, b"hello world");
        assert!(!missed);

        let (end, data, _) = buf.read_from(6).unwrap();
        assert_eq!(end, 11);
        assert_eq!(data, b"world");

        assert!(buf.read_from(11).is_none());
    }

    #[test]
    fn test_output_buffer_trims_and_flags_missed() {
        let mut buf = OutputBuffer::default();
        buf.push(&vec![b'a'; MAX_BUFFER_BYTES]);
        buf.push(b"zz");

        assert_eq!(buf.data.len(), MAX_BUFFER_BYTES);
        assert_eq!(buf.cursor_base, 2);

        let (_, _, missed) = buf.read_from(0).unwrap();
        assert!(missed);

        let (_, _, missed) = buf.read_from(2).unwrap();
        assert!(!missed);
    }

    #[test]
    fn test_resize_frame_shape() {
        let frame = resize_frame(120, 40);
        assert_eq!(frame[0], b'1');
        let body: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(body["columns"], 120);
        assert_eq!(body["rows"], 40);
    }
}
