//! Request matchers a rule combines by conjunction.
//!
//! The full matcher vocabulary lives with the HTTP rule engine; these are the
//! matchers WebSocket rules actually need, plus the trait the dispatcher
//! programs against.

use crate::request::WsRequest;

/// One predicate over an upgrade request.
pub trait WsMatcher: Send + Sync {
    fn matches(&self, request: &WsRequest) -> bool;

    /// Human-readable fragment for rule explanations, e.g. `"for host x"`.
    fn explain(&self) -> String;
}

/// Matches every request.
pub struct WildcardMatcher;

impl WsMatcher for WildcardMatcher {
    fn matches(&self, _request: &WsRequest) -> bool {
        true
    }

    fn explain(&self) -> String {
        "for anything".to_string()
    }
}

/// Matches requests addressed to a specific host, by URL or Host header.
pub struct HostMatcher(pub String);

impl WsMatcher for HostMatcher {
    fn matches(&self, request: &WsRequest) -> bool {
        let requested = request
            .uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                request
                    .header("host")
                    .map(|host| host.split(':').next().unwrap_or(host).to_string())
            });
        requested.is_some_and(|host| host.eq_ignore_ascii_case(&self.0))
    }

    fn explain(&self) -> String {
        format!("for host {}", self.0)
    }
}

/// Matches requests whose URL path is exactly the given string.
pub struct PathMatcher(pub String);

impl WsMatcher for PathMatcher {
    fn matches(&self, request: &WsRequest) -> bool {
        request.uri.path() == self.0
    }

    fn explain(&self) -> String {
        format!("for path {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request(uri: &str, host_header: Option<&str>) -> WsRequest {
        let mut request = WsRequest::new(Method::GET, uri.parse().unwrap());
        if let Some(host) = host_header {
            request.headers.push(("Host".to_string(), host.to_string()));
        }
        request
    }

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(WildcardMatcher.matches(&request("/x", None)));
        assert_eq!(WildcardMatcher.explain(), "for anything");
    }

    #[test]
    fn test_host_matcher_prefers_the_url_host() {
        let matcher = HostMatcher("example.com".to_string());
        assert!(matcher.matches(&request("ws://example.com/x", None)));
        assert!(matcher.matches(&request("ws://EXAMPLE.com/x", None)));
        assert!(!matcher.matches(&request("ws://other.com/x", Some("example.com"))));
    }

    #[test]
    fn test_host_matcher_falls_back_to_the_host_header() {
        let matcher = HostMatcher("example.com".to_string());
        assert!(matcher.matches(&request("/x", Some("example.com:8080"))));
        assert!(!matcher.matches(&request("/x", None)));
    }

    #[test]
    fn test_path_matcher_is_exact() {
        let matcher = PathMatcher("/chat".to_string());
        assert!(matcher.matches(&request("ws://example.com/chat?x=1", None)));
        assert!(!matcher.matches(&request("ws://example.com/chat/sub", None)));
    }
}
