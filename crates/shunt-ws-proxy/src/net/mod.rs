//! Network plumbing shared by the upstream connector: TLS trust assembly,
//! caching DNS resolution, and proxy CONNECT tunnelling.

pub mod dns;
pub mod proxy;
pub mod tls;
