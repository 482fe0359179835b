//! Bidirectional frame relay between two established WebSocket endpoints.
//!
//! The relay is a single task driving both sockets as a small state machine:
//! data and control frames are forwarded while the far side is open, close
//! frames are replayed with their status code when the code is one the RFC
//! allows on the wire, and failures are mirrored so both peers observe the
//! same failure mode. A peer that commits a protocol violation gets that
//! violation replayed to the other side as a synthesized close frame written
//! directly to the raw socket, after which the socket is torn down.

use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// Close code sent upstream when the downstream socket fails mid-session.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close code mirrored to a peer whose counterpart violated the protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Reason text the WebSocket library attaches when it normalizes away a
/// peer-sent close frame carrying a forbidden status code.
const PROTOCOL_VIOLATION_REASON: &str = "Protocol violation";

/// Whether `code` may be forwarded verbatim in a close frame.
///
/// RFC 6455 §7.4 allows 1000–1014 minus the reserved 1004/1005/1006, plus
/// the registered and private ranges 3000–4999.
pub fn close_code_is_valid(code: u16) -> bool {
    match code {
        1004 | 1005 | 1006 => false,
        1000..=1014 => true,
        3000..=4999 => true,
        _ => false,
    }
}

/// How a received close frame is replayed on the opposite endpoint.
#[derive(Debug, PartialEq)]
pub(crate) enum CloseRelay {
    /// Replay the frame with its code and reason.
    Forward(CloseFrame),
    /// The code cannot go on the wire; send a bare close instead.
    Bare,
}

pub(crate) fn close_relay_action(frame: Option<CloseFrame>) -> CloseRelay {
    match frame {
        Some(frame) if close_code_is_valid(u16::from(frame.code)) => CloseRelay::Forward(frame),
        _ => CloseRelay::Bare,
    }
}

pub(crate) fn internal_error_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(CLOSE_INTERNAL_ERROR),
        reason: Utf8Bytes::from_static(""),
    }
}

/// Encode a close frame carrying `code` without validating it.
///
/// This is the low-level escape hatch the relay uses to replay status codes
/// the frame layer itself would refuse to parse back. `mask` must be set
/// when writing on a client-role connection.
pub(crate) fn encode_close_frame(code: u16, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut payload = code.to_be_bytes();
    let mut frame = Vec::with_capacity(8);
    frame.push(0x88);
    match mask {
        Some(key) => {
            frame.push(0x80 | payload.len() as u8);
            frame.extend_from_slice(&key);
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
            frame.extend_from_slice(&payload);
        }
        None => {
            frame.push(payload.len() as u8);
            frame.extend_from_slice(&payload);
        }
    }
    frame
}

/// Write a raw close frame with an arbitrary status code to `stream`.
pub async fn send_raw_close<S>(stream: &mut S, code: u16, masked: bool) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mask = masked.then(rand::random::<[u8; 4]>);
    stream.write_all(&encode_close_frame(code, mask)).await?;
    stream.flush().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndState {
    Open,
    Closing,
    Done,
}

enum RelayFailure {
    /// Forwarding to the far side failed; the inbound side must be closed.
    Send,
    /// The inbound peer violated the protocol and the violation was replayed.
    Violation,
}

async fn relay_message<S>(
    message: Message,
    target: &mut WebSocketStream<S>,
    target_state: &mut EndState,
    target_masked: bool,
    direction: &'static str,
) -> Result<(), RelayFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match message {
        Message::Close(frame) => {
            if let Some(frame) = &frame {
                if frame.code == CloseCode::Protocol
                    && frame.reason.as_str() == PROTOCOL_VIOLATION_REASON
                {
                    // The peer sent a close frame the protocol forbids. Replay
                    // the violation on the far side and tear its socket down.
                    debug!("{}: peer close violated the protocol", direction);
                    let _ =
                        send_raw_close(target.get_mut(), u16::from(frame.code), target_masked)
                            .await;
                    return Err(RelayFailure::Violation);
                }
            }
            if *target_state == EndState::Open {
                *target_state = EndState::Closing;
                match close_relay_action(frame) {
                    CloseRelay::Forward(frame) => {
                        trace!("{}: forwarding close {}", direction, frame.code);
                        if target.close(Some(frame)).await.is_err() {
                            let _ = target.close(None).await;
                        }
                    }
                    CloseRelay::Bare => {
                        trace!("{}: forwarding bare close", direction);
                        let _ = target.close(None).await;
                    }
                }
            }
            Ok(())
        }
        Message::Frame(_) => Ok(()),
        message => {
            if *target_state != EndState::Open {
                trace!(
                    "{}: dropping {} byte frame, peer is not open",
                    direction,
                    message.len()
                );
                return Ok(());
            }
            target.send(message).await.map_err(|error| {
                debug!("{}: forwarding failed: {}", direction, error);
                RelayFailure::Send
            })
        }
    }
}

/// Relay frames between the downstream client and the upstream origin until
/// either side ends the session. Consumes both sockets; whatever is left
/// alive when the relay stops is torn down by dropping it.
pub async fn pipe_websockets<D, U>(
    mut downstream: WebSocketStream<D>,
    mut upstream: WebSocketStream<U>,
) where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut down = EndState::Open;
    let mut up = EndState::Open;

    loop {
        tokio::select! {
            message = downstream.next(), if down != EndState::Done => match message {
                Some(Ok(message)) => {
                    match relay_message(message, &mut upstream, &mut up, true, "client -> upstream").await {
                        Ok(()) => {}
                        Err(RelayFailure::Send) => {
                            let _ = downstream.close(None).await;
                            break;
                        }
                        Err(RelayFailure::Violation) => break,
                    }
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    down = EndState::Done;
                    if up == EndState::Open {
                        up = EndState::Closing;
                        let _ = upstream.close(None).await;
                    }
                }
                Some(Err(WsError::Protocol(violation))) => {
                    debug!("client websocket protocol violation: {}", violation);
                    let _ = send_raw_close(upstream.get_mut(), CLOSE_PROTOCOL_ERROR, true).await;
                    break;
                }
                Some(Err(error)) => {
                    // Downstream transport failure: the upstream is released
                    // with an internal-error close.
                    debug!("client websocket failed: {}", error);
                    if up != EndState::Done {
                        let _ = upstream.close(Some(internal_error_close())).await;
                    }
                    break;
                }
            },
            message = upstream.next(), if up != EndState::Done => match message {
                Some(Ok(message)) => {
                    match relay_message(message, &mut downstream, &mut down, false, "upstream -> client").await {
                        Ok(()) => {}
                        Err(RelayFailure::Send) => {
                            let _ = upstream.close(None).await;
                            break;
                        }
                        Err(RelayFailure::Violation) => break,
                    }
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    up = EndState::Done;
                    if down == EndState::Open {
                        down = EndState::Closing;
                        let _ = downstream.close(None).await;
                    }
                }
                Some(Err(WsError::Protocol(violation))) => {
                    debug!("upstream websocket protocol violation: {}", violation);
                    let _ = send_raw_close(downstream.get_mut(), CLOSE_PROTOCOL_ERROR, false).await;
                    break;
                }
                Some(Err(error)) => {
                    // Upstream transport failure: the downstream raw socket is
                    // destroyed without any framing.
                    debug!("upstream websocket failed: {}", error);
                    break;
                }
            },
            else => break,
        }

        if down == EndState::Done && up == EndState::Done {
            break;
        }
    }
}

/// Reflect every data and control frame back at the sender until it closes.
pub async fn echo_websocket<S>(mut socket: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = socket.next().await {
        match message {
            Ok(
                message @ (Message::Text(_)
                | Message::Binary(_)
                | Message::Ping(_)
                | Message::Pong(_)),
            ) => {
                if let Err(error) = socket.send(message).await {
                    debug!("echo send failed: {}", error);
                    break;
                }
            }
            // The close reply is queued by the frame layer; keep draining
            // until the close handshake finishes.
            Ok(Message::Close(_)) | Ok(Message::Frame(_)) => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(error) => {
                debug!("echo session failed: {}", error);
                break;
            }
        }
    }
}

/// Accept frames and silently discard them, never sending anything back.
pub async fn discard_websocket<S>(mut socket: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Close(_)) => {}
            Ok(message) => trace!("discarding {} byte frame", message.len()),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(error) => {
                debug!("listening session failed: {}", error);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[test]
    fn test_close_code_table() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 1014, 3000, 4000, 4999] {
            assert!(close_code_is_valid(code), "{code} should be forwardable");
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 2999, 5000, u16::MAX] {
            assert!(!close_code_is_valid(code), "{code} should not be forwardable");
        }
    }

    #[test]
    fn test_close_relay_action() {
        assert_eq!(close_relay_action(None), CloseRelay::Bare);

        let invalid = CloseFrame {
            code: CloseCode::from(1005),
            reason: Utf8Bytes::from_static("x"),
        };
        assert_eq!(close_relay_action(Some(invalid)), CloseRelay::Bare);

        let valid = CloseFrame {
            code: CloseCode::from(4321),
            reason: Utf8Bytes::from_static("done"),
        };
        match close_relay_action(Some(valid)) {
            CloseRelay::Forward(frame) => {
                assert_eq!(u16::from(frame.code), 4321);
                assert_eq!(frame.reason.as_str(), "done");
            }
            CloseRelay::Bare => panic!("4321 must be forwarded verbatim"),
        }
    }

    #[test]
    fn test_encode_close_frame_unmasked() {
        // 999 = 0x03E7, sent as an unmasked 2-byte close payload.
        assert_eq!(encode_close_frame(999, None), vec![0x88, 0x02, 0x03, 0xE7]);
    }

    #[test]
    fn test_encode_close_frame_masked() {
        let frame = encode_close_frame(999, Some([1, 2, 3, 4]));
        assert_eq!(
            frame,
            vec![0x88, 0x82, 0x01, 0x02, 0x03, 0x04, 0x03 ^ 0x01, 0xE7 ^ 0x02]
        );
    }

    async fn pipe_fixture() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let (client_io, down_io) = tokio::io::duplex(4096);
        let (up_io, server_io) = tokio::io::duplex(4096);

        let downstream = WebSocketStream::from_raw_socket(down_io, Role::Server, None).await;
        let upstream = WebSocketStream::from_raw_socket(up_io, Role::Client, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

        let pipe = tokio::spawn(pipe_websockets(downstream, upstream));
        (client, server, pipe)
    }

    #[tokio::test]
    async fn test_data_frames_keep_their_discriminator_and_order() {
        let (mut client, mut server, pipe) = pipe_fixture().await;

        client.send(Message::text("one")).await.unwrap();
        client
            .send(Message::binary(vec![0x01, 0x02, 0x03]))
            .await
            .unwrap();

        match server.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "one"),
            other => panic!("expected text, got {other:?}"),
        }
        match server.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], &[0x01, 0x02, 0x03]),
            other => panic!("expected binary, got {other:?}"),
        }

        server.send(Message::text("reply")).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "reply"),
            other => panic!("expected text, got {other:?}"),
        }

        drop(client);
        drop(server);
        pipe.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_relayed_as_ping() {
        let (mut client, mut server, pipe) = pipe_fixture().await;

        client
            .send(Message::Ping(vec![0xAA].into()))
            .await
            .unwrap();
        match server.next().await.unwrap().unwrap() {
            Message::Ping(payload) => assert_eq!(&payload[..], &[0xAA]),
            other => panic!("expected ping, got {other:?}"),
        }

        drop(client);
        drop(server);
        pipe.await.unwrap();
    }

    #[tokio::test]
    async fn test_valid_close_code_is_forwarded_verbatim() {
        let (mut client, mut server, pipe) = pipe_fixture().await;

        client
            .close(Some(CloseFrame {
                code: CloseCode::from(4321),
                reason: Utf8Bytes::from_static("done"),
            }))
            .await
            .unwrap();

        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4321);
                assert_eq!(frame.reason.as_str(), "done");
            }
            other => panic!("expected the relayed close, got {other:?}"),
        }

        drop(server);
        pipe.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_violation_reaches_the_far_side() {
        let (mut client, mut server, pipe) = pipe_fixture().await;

        // 999 is not a legal close code; the frame layer reports the
        // violation and the relay replays it before destroying the far side.
        client
            .close(Some(CloseFrame {
                code: CloseCode::from(999),
                reason: Utf8Bytes::from_static(""),
            }))
            .await
            .unwrap();

        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_PROTOCOL_ERROR)
            }
            other => panic!("expected a protocol-error close, got {other:?}"),
        }

        pipe.await.unwrap();

        // The far side's socket was destroyed, not gracefully drained.
        match server.next().await {
            None | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("expected the socket to be gone, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abrupt_client_death_is_mirrored_upstream() {
        let (client, mut server, pipe) = pipe_fixture().await;

        // Dropping the client kills its half of the stream with no close
        // handshake, which the relay mirrors as a protocol-error close.
        drop(client);

        match server.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), CLOSE_PROTOCOL_ERROR)
            }
            other => panic!("expected a protocol-error close, got {other:?}"),
        }

        pipe.await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_reflects_frames_with_discriminator() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let echo = tokio::spawn(echo_websocket(server));

        client.send(Message::text("hello")).await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "hello"),
            other => panic!("expected text back, got {other:?}"),
        }

        client
            .send(Message::binary(vec![0x01, 0x02, 0x03]))
            .await
            .unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], &[0x01, 0x02, 0x03]),
            other => panic!("expected binary back, got {other:?}"),
        }

        client.close(None).await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_never_emits_data() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let listener = tokio::spawn(discard_websocket(server));

        for i in 0..100u8 {
            client.send(Message::binary(vec![i])).await.unwrap();
        }

        // Nothing may come back within a generous window.
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(200), client.next()).await;
        assert!(nothing.is_err(), "listen handler must stay silent");

        client.close(None).await.unwrap();
        listener.await.unwrap();
    }
}
