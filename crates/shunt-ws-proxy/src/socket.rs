//! The raw downstream socket handed over by the HTTP front-end.
//!
//! By the time a connection reaches this core the front-end has accepted the
//! TCP connection, possibly terminated TLS (directly or at the end of a
//! CONNECT tunnel), and parsed the upgrade request. What remains is an opaque
//! duplex byte stream plus two pieces of transport metadata: whether the
//! stream itself is encrypted, and (for CONNECT tunnels) whether the last
//! hop was, which the front-end records explicitly because the tunnel
//! socket's own type no longer tells.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// A duplex byte stream the core can relay WebSocket traffic over.
///
/// `arm_reset` is the hook for the reset-connection fault: transports that
/// can send an RST on close (plain TCP) report `true`, everything else falls
/// back to an ordinary close.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    fn arm_reset(&self) -> bool {
        false
    }
}

impl Transport for TcpStream {
    fn arm_reset(&self) -> bool {
        self.set_linger(Some(Duration::ZERO)).is_ok()
    }
}

impl Transport for tokio::io::DuplexStream {}

impl<T: Transport> Transport for tokio_rustls::server::TlsStream<T> {
    fn arm_reset(&self) -> bool {
        self.get_ref().0.arm_reset()
    }
}

/// The raw socket for one intercepted connection.
pub struct RawSocket {
    stream: Box<dyn Transport>,
    tls: bool,
    last_hop_encrypted: Option<bool>,
}

impl std::fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket")
            .field("tls", &self.tls)
            .field("last_hop_encrypted", &self.last_hop_encrypted)
            .finish()
    }
}

impl RawSocket {
    pub fn new(stream: impl Transport + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            tls: false,
            last_hop_encrypted: None,
        }
    }

    /// Mark whether the stream itself is TLS-wrapped.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Record the front-end's explicit last-hop-encryption hint.
    pub fn with_last_hop_encrypted(mut self, encrypted: Option<bool>) -> Self {
        self.last_hop_encrypted = encrypted;
        self
    }

    /// Whether the hop the client spoke over was encrypted, preferring the
    /// front-end's explicit hint over the socket's own state.
    pub fn hop_was_encrypted(&self) -> bool {
        self.last_hop_encrypted.unwrap_or(self.tls)
    }

    pub fn arm_reset(&self) -> bool {
        self.stream.arm_reset()
    }

    /// Tear the socket down immediately.
    pub async fn destroy(mut self) {
        if let Err(error) = self.stream.shutdown().await {
            debug!("error shutting down raw socket: {}", error);
        }
    }
}

impl AsyncRead for RawSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Transport for RawSocket {
    fn arm_reset(&self) -> bool {
        RawSocket::arm_reset(self)
    }
}
