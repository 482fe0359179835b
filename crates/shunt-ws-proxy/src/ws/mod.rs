//! The WebSocket interception core.
//!
//! An upgrade request routed to a matching rule ends up here with its raw
//! socket and head buffer. Depending on the rule's handler the session is
//! bridged to the real upstream ([`connect`] + [`accept`] + [`pipe`]),
//! terminated locally ([`handlers::EchoHandler`], [`handlers::ListenHandler`]),
//! refused with a raw HTTP response, or failed at the transport level
//! ([`faults`]).

pub mod accept;
pub mod connect;
pub mod faults;
pub mod handlers;
pub mod pipe;
pub mod rewind;

pub use accept::{accept_websocket, DownstreamSocket};
pub use connect::{
    resolve_upstream_target, CaSource, ClientCertificate, ForwardingOptions, IgnoreHttpsErrors,
    PassthroughOptions, UpdateHostHeader, UpstreamConnector, UpstreamError, UpstreamSocket,
    UpstreamTarget,
};
pub use handlers::{
    write_raw_response, EchoHandler, ListenHandler, PassthroughHandler, RejectHandler, WsHandler,
};
pub use pipe::{
    close_code_is_valid, discard_websocket, echo_websocket, pipe_websockets, send_raw_close,
    CLOSE_INTERNAL_ERROR, CLOSE_PROTOCOL_ERROR,
};
pub use rewind::Rewind;
