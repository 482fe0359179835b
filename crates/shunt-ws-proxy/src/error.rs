//! Error types for the WebSocket interception core.
//!
//! Transport-level failures are surfaced to the downstream client as socket
//! destruction, never as a thrown error; the variants here exist so callers
//! (the dispatcher, tests, embedders) can log and classify what went wrong.

use thiserror::Error;

/// Failure kinds produced by the WebSocket core.
#[derive(Debug, Error)]
pub enum WsProxyError {
    /// The downstream upgrade request could not be completed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// No usable upstream target could be derived from the request.
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    /// DNS resolution failed for the upstream hostname.
    #[error("dns lookup for {host} failed: {details}")]
    Dns { host: String, details: String },

    /// The caching resolver could not be constructed.
    #[error("dns resolver configuration failed: {0}")]
    DnsConfig(String),

    /// An upstream HTTP proxy refused or broke the CONNECT tunnel.
    #[error("proxy CONNECT failed: {0}")]
    ProxyConnect(String),

    /// Trust roots or client certificates could not be assembled.
    #[error("tls configuration failed: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}
