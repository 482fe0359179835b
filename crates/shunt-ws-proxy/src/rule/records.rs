//! Exchange records for rules with request recording enabled.
//!
//! A record is pushed into the rule's list the moment dispatch begins and
//! resolves once the exchange finishes, so anyone inspecting the rule while
//! a session is live observes it as pending rather than absent.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::request::WsRequest;

/// Snapshot of one completed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest {
    pub method: String,
    pub url: String,
    /// Raw headers in wire order, case preserved.
    pub headers: Vec<(String, String)>,
    /// Upgrade requests carry no body; kept for parity with HTTP records.
    pub body: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CompletedRequest {
    pub fn from_request(
        request: &WsRequest,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.uri.to_string(),
            headers: request.headers.clone(),
            body: Vec::new(),
            started_at,
            duration_ms,
        }
    }
}

/// A future-like cell that resolves to a [`CompletedRequest`].
#[derive(Debug, Default)]
pub struct ExchangeRecord {
    slot: OnceLock<CompletedRequest>,
    notify: Notify,
}

impl ExchangeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the record. Later calls are ignored; a record completes once.
    pub fn complete(&self, request: CompletedRequest) {
        if self.slot.set(request).is_ok() {
            self.notify.notify_waiters();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.get().is_none()
    }

    /// The completed snapshot, if the exchange has finished.
    pub fn snapshot(&self) -> Option<&CompletedRequest> {
        self.slot.get()
    }

    /// Wait until the exchange completes.
    pub async fn wait(&self) -> &CompletedRequest {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.slot.get() {
                return request;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::sync::Arc;

    fn sample() -> CompletedRequest {
        let request = WsRequest::new(Method::GET, "ws://example.com/chat".parse().unwrap());
        CompletedRequest::from_request(&request, Utc::now(), 12)
    }

    #[tokio::test]
    async fn test_record_starts_pending_and_resolves_once() {
        let record = ExchangeRecord::new();
        assert!(record.is_pending());
        assert!(record.snapshot().is_none());

        record.complete(sample());
        assert!(!record.is_pending());
        assert_eq!(record.snapshot().unwrap().method, "GET");

        // A second completion does not overwrite the first.
        let mut other = sample();
        other.method = "POST".to_string();
        record.complete(other);
        assert_eq!(record.snapshot().unwrap().method, "GET");
    }

    #[tokio::test]
    async fn test_waiters_are_woken_on_completion() {
        let record = Arc::new(ExchangeRecord::new());

        let waiter = {
            let record = Arc::clone(&record);
            tokio::spawn(async move { record.wait().await.url.clone() })
        };

        tokio::task::yield_now().await;
        record.complete(sample());

        assert_eq!(waiter.await.unwrap(), "ws://example.com/chat");
    }
}
