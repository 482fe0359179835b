//! The behavioral strategies a matched rule can apply to an upgrade.
//!
//! Every variant consumes the raw socket: pass-through bridges it to a real
//! upstream, echo and listen terminate it locally, reject answers with a raw
//! HTTP response, and the transport faults dispose of it without speaking
//! WebSocket at all.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::accept::accept_websocket;
use super::connect::{
    resolve_upstream_target, ForwardingOptions, PassthroughOptions, UpstreamConnector,
    UpstreamError,
};
use super::faults;
use super::pipe::{discard_websocket, echo_websocket, internal_error_close, pipe_websockets};
use crate::error::WsProxyError;
use crate::request::WsRequest;
use crate::socket::RawSocket;

/// A WebSocket handler attached to a rule.
pub enum WsHandler {
    Passthrough(PassthroughHandler),
    Echo(EchoHandler),
    Listen(ListenHandler),
    Reject(RejectHandler),
    CloseConnection,
    ResetConnection,
    Timeout,
}

impl WsHandler {
    /// Run the handler for one upgrade request.
    pub async fn handle(
        &self,
        request: &WsRequest,
        socket: RawSocket,
        head: Bytes,
    ) -> Result<(), WsProxyError> {
        match self {
            WsHandler::Passthrough(handler) => handler.handle(request, socket, head).await,
            WsHandler::Echo(handler) => handler.handle(request, socket, head).await,
            WsHandler::Listen(handler) => handler.handle(request, socket, head).await,
            WsHandler::Reject(handler) => handler.handle(socket).await,
            WsHandler::CloseConnection => {
                faults::close_connection(socket);
                Ok(())
            }
            WsHandler::ResetConnection => {
                faults::reset_connection(socket);
                Ok(())
            }
            WsHandler::Timeout => {
                faults::hold_open(socket).await;
                Ok(())
            }
        }
    }

    /// Wire tag for this variant.
    pub fn variant(&self) -> &'static str {
        match self {
            WsHandler::Passthrough(_) => "ws-passthrough",
            WsHandler::Echo(_) => "ws-echo",
            WsHandler::Listen(_) => "ws-listen",
            WsHandler::Reject(_) => "ws-reject",
            WsHandler::CloseConnection => "close-connection",
            WsHandler::ResetConnection => "reset-connection",
            WsHandler::Timeout => "timeout",
        }
    }

    pub fn explain(&self) -> String {
        match self {
            WsHandler::Passthrough(handler) => match &handler.forwarding {
                Some(forwarding) => {
                    format!("forward the websocket to {}", forwarding.target_host)
                }
                None => "pass the websocket through to the real upstream".to_string(),
            },
            WsHandler::Echo(_) => "echo every frame back to the client".to_string(),
            WsHandler::Listen(_) => "accept the websocket and discard every frame".to_string(),
            WsHandler::Reject(handler) => {
                format!("reject the upgrade with status {}", handler.status_code)
            }
            WsHandler::CloseConnection => "close the connection immediately".to_string(),
            WsHandler::ResetConnection => "reset the connection".to_string(),
            WsHandler::Timeout => "time out with no response".to_string(),
        }
    }
}

/// Write a raw HTTP/1.1 response: status line, headers in order, blank line,
/// body, trailing CRLF.
pub async fn write_raw_response<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes.extend_from_slice(b"\r\n");
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Bridge the client to the real upstream, frame for frame.
pub struct PassthroughHandler {
    forwarding: Option<ForwardingOptions>,
    connector: UpstreamConnector,
}

impl PassthroughHandler {
    pub fn new(forwarding: Option<ForwardingOptions>, options: PassthroughOptions) -> Self {
        Self {
            forwarding,
            connector: UpstreamConnector::new(options),
        }
    }

    pub fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    pub async fn handle(
        &self,
        request: &WsRequest,
        mut socket: RawSocket,
        head: Bytes,
    ) -> Result<(), WsProxyError> {
        let target = match resolve_upstream_target(request, &socket, self.forwarding.as_ref()) {
            Ok(target) => target,
            Err(error) => {
                socket.destroy().await;
                return Err(error);
            }
        };
        info!("Passing websocket through to {}", target.url);

        let (upstream, subprotocol) = match self.connector.connect(&target, request).await {
            Ok(connected) => connected,
            Err(UpstreamError::Rejected(response)) => {
                // The origin refused the upgrade with a plain HTTP response;
                // mirror it verbatim so the client sees the real failure.
                debug!(
                    "Upstream refused the upgrade with status {}",
                    response.status()
                );
                let headers: Vec<(String, String)> = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();
                let body = response.body().as_deref().unwrap_or_default();
                let reason = response
                    .status()
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_string();
                let _ = write_raw_response(
                    &mut socket,
                    response.status().as_u16(),
                    &reason,
                    &headers,
                    body,
                )
                .await;
                socket.destroy().await;
                return Ok(());
            }
            Err(UpstreamError::Failed(error)) => {
                // Dial failures surface downstream as bare socket destruction,
                // indistinguishable from the upstream itself failing.
                debug!("Upstream websocket dial failed: {}", error);
                socket.destroy().await;
                return Err(error);
            }
        };

        let downstream = match accept_websocket(request, socket, head, subprotocol.as_deref()).await
        {
            Ok(downstream) => downstream,
            Err(error) => {
                let mut upstream = upstream;
                let _ = upstream.close(Some(internal_error_close())).await;
                return Err(error);
            }
        };

        pipe_websockets(downstream, upstream).await;
        Ok(())
    }
}

/// Accept the upgrade and reflect every frame back at the sender.
pub struct EchoHandler;

impl EchoHandler {
    pub async fn handle(
        &self,
        request: &WsRequest,
        socket: RawSocket,
        head: Bytes,
    ) -> Result<(), WsProxyError> {
        let websocket = accept_websocket(request, socket, head, None).await?;
        echo_websocket(websocket).await;
        Ok(())
    }
}

/// Accept the upgrade, then swallow everything without answering.
pub struct ListenHandler;

impl ListenHandler {
    pub async fn handle(
        &self,
        request: &WsRequest,
        socket: RawSocket,
        head: Bytes,
    ) -> Result<(), WsProxyError> {
        let websocket = accept_websocket(request, socket, head, None).await?;
        discard_websocket(websocket).await;
        Ok(())
    }
}

/// Refuse the upgrade with a configured raw HTTP response.
pub struct RejectHandler {
    pub status_code: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RejectHandler {
    pub async fn handle(&self, mut socket: RawSocket) -> Result<(), WsProxyError> {
        let reason = match &self.status_message {
            Some(message) => message.clone(),
            None => http::StatusCode::from_u16(self.status_code)
                .ok()
                .and_then(|status| status.canonical_reason())
                .unwrap_or_default()
                .to_string(),
        };
        write_raw_response(
            &mut socket,
            self.status_code,
            &reason,
            &self.headers,
            self.body.as_bytes(),
        )
        .await?;
        socket.destroy().await;
        Ok(())
    }
}
