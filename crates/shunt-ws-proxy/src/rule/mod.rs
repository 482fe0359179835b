//! Rule binding: matchers + handler + completion predicate as one unit.
//!
//! A rule is created by the admin layer, queried by the dispatcher, and
//! mutated only on the dispatch path: every handled request bumps the
//! counter and, when recording is requested, appends an exchange record
//! before the handler runs so concurrent observers see the session while it
//! is still in flight.

pub mod completion;
pub mod matchers;
pub mod records;

mod definitions;

pub use completion::{once, thrice, twice, Always, RuleCompletion, Times};
pub use definitions::{
    DefinitionError, ForwardingDef, PassthroughOptionsDef, ProxyConfigDef, RuleParameters,
    UpdateHostHeaderDef, WsHandlerDef,
};
pub use matchers::{HostMatcher, PathMatcher, WildcardMatcher, WsMatcher};
pub use records::{CompletedRequest, ExchangeRecord};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::WsProxyError;
use crate::request::WsRequest;
use crate::socket::RawSocket;
use crate::ws::WsHandler;

/// One WebSocket interception rule.
pub struct WsRule {
    pub id: String,
    matchers: Vec<Box<dyn WsMatcher>>,
    handler: WsHandler,
    completion: Option<Box<dyn RuleCompletion>>,
    request_count: AtomicU64,
    requests: RwLock<Vec<Arc<ExchangeRecord>>>,
    disposed: AtomicBool,
}

impl WsRule {
    /// Build a rule; an id is generated when the admin layer supplied none.
    pub fn new(
        id: Option<String>,
        matchers: Vec<Box<dyn WsMatcher>>,
        handler: WsHandler,
        completion: Option<Box<dyn RuleCompletion>>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            matchers,
            handler,
            completion,
            request_count: AtomicU64::new(0),
            requests: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Whether every matcher accepts the request. Disposed rules match
    /// nothing.
    pub fn matches(&self, request: &WsRequest) -> bool {
        !self.disposed.load(Ordering::SeqCst)
            && self.matchers.iter().all(|matcher| matcher.matches(request))
    }

    /// Run the rule's handler for one upgrade.
    ///
    /// The request counter is bumped unconditionally; `record` additionally
    /// appends an exchange record that resolves when the session ends.
    pub async fn handle(
        &self,
        request: &WsRequest,
        socket: RawSocket,
        head: Bytes,
        record: bool,
    ) -> Result<(), WsProxyError> {
        let seen = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Rule {} handling websocket request #{}", self.id, seen);

        let pending = record.then(|| {
            let record = Arc::new(ExchangeRecord::new());
            self.requests.write().push(Arc::clone(&record));
            record
        });

        let started_at = Utc::now();
        let timer = Instant::now();
        let result = self.handler.handle(request, socket, head).await;

        if let Some(pending) = pending {
            pending.complete(CompletedRequest::from_request(
                request,
                started_at,
                timer.elapsed().as_millis() as u64,
            ));
        }
        result
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// The recorded exchanges, pending ones included, in dispatch order.
    pub fn requests(&self) -> Vec<Arc<ExchangeRecord>> {
        self.requests.read().clone()
    }

    /// Whether the rule has served its purpose; `None` when no completion
    /// predicate is configured.
    pub fn is_complete(&self) -> Option<bool> {
        self.completion
            .as_ref()
            .map(|completion| completion.is_complete(self.request_count()))
    }

    /// Human-readable summary of matchers, handler and completion.
    pub fn explain(&self, without_exact_completion: bool) -> String {
        let matchers = if self.matchers.is_empty() {
            "for any websocket".to_string()
        } else {
            self.matchers
                .iter()
                .map(|matcher| matcher.explain())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let completion = match &self.completion {
            Some(completion) => format!(", {}", completion.explain(without_exact_completion)),
            None => String::new(),
        };
        format!(
            "Match websockets {}, and then {}{}.",
            matchers,
            self.handler.explain(),
            completion
        )
    }

    /// Release the rule's resources. In-flight sessions keep running; the
    /// rule just stops matching and drops its records.
    pub fn dispose(&self) {
        debug!("Disposing rule {}", self.id);
        self.disposed.store(true, Ordering::SeqCst);
        self.requests.write().clear();
    }
}
