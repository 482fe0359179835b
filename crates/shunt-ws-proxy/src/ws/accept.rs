//! Server-side WebSocket upgrade on an already-parsed request.
//!
//! The front-end consumed the HTTP request line and headers before routing
//! the connection here, so the standard accept path of the WebSocket library
//! (which wants to parse the request itself) does not apply. Instead the 101
//! response is written by hand against the client's `Sec-WebSocket-Key`, and
//! the raw socket, with the front-end's over-read bytes replayed in front,
//! is wrapped directly into a server-role frame stream.

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::rewind::Rewind;
use crate::error::WsProxyError;
use crate::request::WsRequest;
use crate::socket::RawSocket;

/// An established downstream WebSocket.
pub type DownstreamSocket = WebSocketStream<Rewind<RawSocket>>;

/// Complete the server-side handshake and hand back the framed stream.
///
/// `subprotocol` is echoed in the 101 response when set; pass-through uses it
/// to mirror whatever the upstream negotiated.
pub async fn accept_websocket(
    request: &WsRequest,
    mut socket: RawSocket,
    head: Bytes,
    subprotocol: Option<&str>,
) -> Result<DownstreamSocket, WsProxyError> {
    let key = match request.header("sec-websocket-key") {
        Some(key) if !key.trim().is_empty() => key.trim().to_string(),
        _ => {
            socket.destroy().await;
            return Err(WsProxyError::Handshake(
                "upgrade request has no Sec-WebSocket-Key".to_string(),
            ));
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");

    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;

    debug!(
        "Accepted websocket upgrade for {} ({} head bytes replayed)",
        request.uri,
        head.len()
    );

    let stream = Rewind::new_buffered(socket, head);
    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}
