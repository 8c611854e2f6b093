//! Terminal transports.
//!
//! Two ways into a session's terminal daemon: the WebSocket bridge
//! (first-class) and an HTTP long-poll transport for clients stuck behind
//! proxies that strip upgrades.

mod bridge;
mod longpoll;

pub use bridge::terminal_ws;
pub use longpoll::{
    spawn_transport_reaper, terminal_connect, terminal_disconnect, terminal_input, terminal_poll,
    terminal_resize, LongPollTransports,
};

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// WebSocket subprotocol the terminal daemon speaks.
pub const TERMINAL_SUBPROTOCOL: &str = "tty";

pub(crate) type DaemonStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to the session's terminal daemon on localhost,
/// negotiating the daemon's subprotocol. No client credentials are
/// forwarded; the daemon trusts the proxy.
pub(crate) async fn dial_daemon(
    port: u16,
) -> Result<DaemonStream, tokio_tungstenite::tungstenite::Error> {
    let url = format!("ws://127.0.0.1:{}/ws", port);
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "sec-websocket-protocol",
        HeaderValue::from_static(TERMINAL_SUBPROTOCOL),
    );
    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}
