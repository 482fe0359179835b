//! Transport-level faults shared with the HTTP interception core.
//!
//! These simulate the failure modes clients actually hit in production:
//! connections that vanish, connections that reset, and servers that accept
//! and then never speak.

use tracing::debug;

use crate::socket::RawSocket;

/// Destroy the socket without writing anything.
pub fn close_connection(socket: RawSocket) {
    debug!("Closing connection without any response");
    drop(socket);
}

/// Destroy the socket with an RST where the transport supports it, an
/// ordinary close otherwise.
pub fn reset_connection(socket: RawSocket) {
    if socket.arm_reset() {
        debug!("Resetting connection");
    } else {
        debug!("Transport cannot send RST, closing instead");
    }
    drop(socket);
}

/// Keep the socket open forever without ever responding.
pub async fn hold_open(socket: RawSocket) {
    debug!("Holding connection open without responding");
    let _socket = socket;
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_close_connection_ends_the_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        close_connection(RawSocket::new(near));

        let mut buf = [0u8; 8];
        // EOF with no bytes written.
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hold_open_never_resolves() {
        let (near, mut far) = tokio::io::duplex(64);

        let held = tokio::time::timeout(Duration::from_millis(100), hold_open(RawSocket::new(near)));
        assert!(held.await.is_err(), "timeout handler must never respond");

        // And nothing was written while it waited.
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(50), far.read(&mut buf)).await;
        match read {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(other) => panic!("unexpected bytes from a timeout fault: {other:?}"),
        }
    }
}
