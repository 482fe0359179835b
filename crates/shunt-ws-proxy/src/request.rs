//! The upgrade request as delivered by the HTTP front-end.
//!
//! The front-end has already consumed the request line and headers off the
//! wire; what reaches this core is the parsed request plus the raw socket and
//! any bytes the front-end over-read. Headers are kept as an ordered list of
//! name/value pairs so the original casing survives into the upstream request
//! and into exchange records.

use http::{Method, Uri, Version};
use std::net::IpAddr;

/// A parsed HTTP Upgrade request routed to the WebSocket core.
#[derive(Debug, Clone)]
pub struct WsRequest {
    pub method: Method,
    pub uri: Uri,
    /// Raw headers in wire order, case preserved.
    pub headers: Vec<(String, String)>,
    /// HTTP version hint from the front-end.
    pub version: Version,
    /// Address the client connected from, when known.
    pub remote_ip: Option<IpAddr>,
}

impl WsRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            version: Version::HTTP_11,
            remote_ip: None,
        }
    }

    /// First header value matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut request = WsRequest::new(Method::GET, "/chat".parse().unwrap());
        request
            .headers
            .push(("Sec-WebSocket-Key".to_string(), "abc".to_string()));
        request.headers.push(("Host".to_string(), "a".to_string()));
        request.headers.push(("host".to_string(), "b".to_string()));

        assert_eq!(request.header("sec-websocket-key"), Some("abc"));
        // First match wins when a header repeats.
        assert_eq!(request.header("HOST"), Some("a"));
        assert_eq!(request.header("missing"), None);
    }
}
