//! WebSocket interception core for the Shunt mocking proxy.
//!
//! The HTTP front-end accepts connections, terminates TLS and parses upgrade
//! requests; this crate takes over from there. Given `(request, socket,
//! head)` and a matched rule it mediates the full-duplex session: relaying
//! to the real upstream, echoing, black-holing, rejecting the upgrade, or
//! simulating transport faults, while counting and optionally recording
//! every exchange on the rule.

// ===== Core session handling =====
pub mod error;
pub mod request;
pub mod socket;
pub mod ws;

// ===== Rule binding =====
pub mod rule;

// ===== Network plumbing =====
pub mod net;

pub use error::WsProxyError;
pub use request::WsRequest;
pub use rule::WsRule;
pub use socket::{RawSocket, Transport};
pub use ws::WsHandler;
