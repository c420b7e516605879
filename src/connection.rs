//! Request dispatch, completion classification and pagination.
//!
//! [`ConnectionManager::dispatch`] turns one logical operation into one or
//! more HTTP exchanges and reports a single [`Outcome`] to the caller's
//! continuation. Every operation is tracked as a [`PendingRequest`] in a table
//! owned by the manager; whichever of completion or [`kill_all`] removes the
//! entry first is the one that invokes the continuation, so a cancelled
//! request never reports twice.
//!
//! ## Status handling
//!
//! | Status            | Action                                                 |
//! |-------------------|--------------------------------------------------------|
//! | 2xx               | decode JSON; for collections follow `links.next`       |
//! | 401 (first)       | force a token refresh, re-send once                    |
//! | 401 (second)      | [`AuthError::Unauthorized`]                            |
//! | other 4xx / 5xx   | [`ClientError::Api`] from the vendor error envelope    |
//!
//! 403 means the token is valid but lacks privilege, so it is not retried.
//!
//! [`kill_all`]: ConnectionManager::kill_all

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{decode_error_envelope, AuthError, ClientError};
use crate::request::{Action, Continuation, Outcome, PaginationCursor, PendingRequest, RequestId};
use crate::session::SessionManager;
use crate::token::Token;
use crate::transport::{HttpRequest, Transport};

const JSON_API: &str = "application/vnd.api+json";

/// How a logical operation finished, before the pending entry is consumed.
enum Completion {
    Single(Value),
    /// Items are in the pending entry's `accumulated` buffer.
    Collection,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    api_root: String,
    page_size: AtomicUsize,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionManager>,
        api_root: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            transport,
            session,
            api_root: api_root.into(),
            page_size: AtomicUsize::new(page_size.max(1)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::SeqCst)
    }

    /// Items per page for collection requests dispatched from now on.
    pub fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Number of logical operations not yet completed or cancelled.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.table().contains_key(&id)
    }

    /// Start a logical operation and return immediately.
    ///
    /// `path` is relative to the API root (e.g. `devices/abc`) or an absolute
    /// URL. The continuation runs on a runtime worker once the full result is
    /// known. Must be called from within a Tokio runtime.
    pub fn dispatch(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
        action: Action,
        continuation: Continuation,
    ) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let url = match self.request_url(path, action) {
            Ok(url) => url,
            Err(e) => {
                continuation(Err(e));
                return id;
            }
        };

        debug!(request = %id, ?action, %method, %url, "dispatch");
        self.table().insert(
            id,
            PendingRequest::new(id, action, method.clone(), path, body.clone(), continuation),
        );

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.execute(id, action, &method, url, body.as_ref()).await;
            this.complete(id, result);
        });

        if let Some(entry) = self.table().get_mut(&id) {
            entry.task = Some(task.abort_handle());
        }
        id
    }

    /// Dispatch and await the outcome.
    pub async fn request(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
        action: Action,
    ) -> Outcome {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            method,
            path,
            body,
            action,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        rx.await.unwrap_or(Err(ClientError::Cancelled))
    }

    /// Cancel one operation. Returns `false` if it already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let entry = self.table().remove(&id);
        match entry {
            Some(entry) => {
                debug!(request = %id, "cancelled");
                Self::cancel_entry(entry);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending operation; each continuation receives
    /// [`ClientError::Cancelled`]. Completions that land afterwards are dropped.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.table().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        if count > 0 {
            info!(count, "cancelling all pending requests");
        }
        for entry in drained {
            Self::cancel_entry(entry);
        }
        count
    }

    fn cancel_entry(mut entry: PendingRequest) {
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        if let Some(continuation) = entry.continuation.take() {
            continuation(Err(ClientError::Cancelled));
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver the result if the entry is still registered.
    fn complete(&self, id: RequestId, result: Result<Completion, ClientError>) {
        let Some(mut entry) = self.table().remove(&id) else {
            debug!(request = %id, "completion for cancelled request discarded");
            return;
        };

        let outcome = match result {
            Ok(Completion::Single(value)) => Ok(value),
            Ok(Completion::Collection) => {
                let items = std::mem::take(&mut entry.accumulated);
                debug!(request = %id, items = items.len(), "collection assembled");
                Ok(json!({ "data": items }))
            }
            Err(e) => {
                warn!(request = %id, action = ?entry.action, error = %e, "request failed");
                Err(e)
            }
        };

        if let Some(continuation) = entry.continuation.take() {
            continuation(outcome);
        }
    }

    /// Run the request/refresh/paginate loop for one operation.
    async fn execute(
        &self,
        id: RequestId,
        action: Action,
        method: &Method,
        mut url: String,
        body: Option<&Value>,
    ) -> Result<Completion, ClientError> {
        let mut visited = HashSet::from([url.clone()]);

        loop {
            let token = self.session.valid_token().await?;
            let resp = self
                .transport
                .send(self.build_request(method, &url, &token, body))
                .await?;

            match resp.status {
                200..=299 => {
                    let value = parse_json(&resp.body)?;
                    if !action.is_collection() {
                        return Ok(Completion::Single(value));
                    }

                    let cursor = PaginationCursor::from_body(&value, &self.api_root);
                    if !self.accumulate(id, page_items(value)) {
                        return Err(ClientError::Cancelled);
                    }
                    match cursor.next_url {
                        Some(next) if visited.insert(next.clone()) => {
                            debug!(request = %id, next = %next, "following next page");
                            url = next;
                        }
                        Some(next) => {
                            warn!(request = %id, next = %next, "next link already fetched; stopping");
                            return Ok(Completion::Collection);
                        }
                        None => return Ok(Completion::Collection),
                    }
                }
                401 => match self.retry_count(id) {
                    Some(0) => {
                        info!(request = %id, "401 received; refreshing token and retrying once");
                        self.mark_retry(id);
                        self.session.force_refresh(&token).await?;
                    }
                    Some(_) => return Err(AuthError::Unauthorized.into()),
                    None => return Err(ClientError::Cancelled),
                },
                status => return Err(decode_error_envelope(status, &resp.body)),
            }
        }
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        token: &Token,
        body: Option<&Value>,
    ) -> HttpRequest {
        let mut req = HttpRequest::new(method.clone(), url)
            .header("Authorization", token.bearer())
            .header("Accept", JSON_API);
        if let Some(body) = body {
            req = req.header("Content-Type", JSON_API).json(body.clone());
        }
        req
    }

    /// Absolute URL for `path`; collection requests get the page size.
    fn request_url(&self, path: &str, action: Action) -> Result<String, ClientError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.api_root, path.trim_start_matches('/'))
        };
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| ClientError::Config(format!("invalid request URL {raw}: {e}")))?;
        if action.is_collection() {
            url.query_pairs_mut()
                .append_pair("page[size]", &self.page_size().to_string());
        }
        Ok(url.to_string())
    }

    /// Append a page to the pending entry. `false` if it was cancelled.
    fn accumulate(&self, id: RequestId, items: Vec<Value>) -> bool {
        match self.table().get_mut(&id) {
            Some(entry) => {
                entry.accumulated.extend(items);
                true
            }
            None => false,
        }
    }

    /// `None` once the entry has been cancelled.
    fn retry_count(&self, id: RequestId) -> Option<u8> {
        self.table().get(&id).map(|entry| entry.retry_count)
    }

    fn mark_retry(&self, id: RequestId) {
        if let Some(entry) = self.table().get_mut(&id) {
            entry.retry_count += 1;
        }
    }
}

fn parse_json(body: &[u8]) -> Result<Value, ClientError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ClientError::Parse(format!("invalid JSON response: {e}")))
}

fn page_items(mut page: Value) -> Vec<Value> {
    match page["data"].take() {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};

    use tokio::sync::mpsc;

    use crate::session::SessionPhase;
    use crate::testing::{empty_response, json_response, route, MockTransport, API_ROOT};
    use crate::transport::TransportError;

    fn fresh_token() -> Token {
        Token::new("acc-1", Some(Utc::now() + ChronoDuration::hours(1)), "refresh-1")
    }

    fn refreshed_token_json() -> Value {
        json!({
            "access_token": "acc-2",
            "expires_at": (Utc::now() + ChronoDuration::hours(1)).to_rfc3339(),
            "refresh_token": "refresh-2"
        })
    }

    fn setup(transport: MockTransport) -> (Arc<ConnectionManager>, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        let session = Arc::new(SessionManager::new(transport.clone(), API_ROOT));
        session.restore(fresh_token());
        let manager = Arc::new(ConnectionManager::new(transport.clone(), session, API_ROOT, 20));
        (manager, transport)
    }

    fn items(n: usize, offset: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": format!("dev-{}", offset + i)})).collect()
    }

    fn authorization(req: &HttpRequest) -> &str {
        req.header_value("authorization").unwrap_or("")
    }

    #[tokio::test]
    async fn single_resource_with_bearer_token() {
        let (manager, transport) = setup(MockTransport::new(|req| match route(req) {
            "devices/abc" => json_response(200, &json!({"data": {"id": "abc"}})),
            _ => empty_response(404),
        }));

        let value = manager
            .request(Method::GET, "devices/abc", None, Action::GetDevice)
            .await
            .unwrap();
        assert_eq!(value["data"]["id"], "abc");

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(authorization(&sent[0]), "Bearer acc-1");
        assert!(!sent[0].url.contains("page"));
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn body_is_sent_as_json_api() {
        let (manager, transport) = setup(MockTransport::new(|_| empty_response(204)));
        let value = manager
            .request(
                Method::PATCH,
                "/devices/abc",
                Some(json!({"data": {"attributes": {"name": "kitchen"}}})),
                Action::UpdateDevice,
            )
            .await
            .unwrap();
        assert_eq!(value, Value::Null);

        let sent = &transport.requests()[0];
        assert_eq!(sent.header_value("content-type"), Some(JSON_API));
        assert_eq!(sent.url, format!("{API_ROOT}devices/abc"));
        assert_eq!(sent.body.as_ref().unwrap()["data"]["attributes"]["name"], "kitchen");
    }

    #[tokio::test]
    async fn linked_pages_are_assembled_in_order() {
        let (manager, transport) = setup(MockTransport::new(|req| {
            let url = req.url.as_str();
            if url.ends_with("devices?page=3") {
                json_response(200, &json!({"data": items(5, 40), "links": {"self": url}}))
            } else if url.ends_with("devices?page=2") {
                json_response(
                    200,
                    &json!({"data": items(20, 20), "links": {"next": format!("{API_ROOT}devices?page=3")}}),
                )
            } else {
                json_response(
                    200,
                    &json!({"data": items(20, 0), "links": {"next": "/v5/devices?page=2"}}),
                )
            }
        }));

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&calls);
        manager.dispatch(
            Method::GET,
            "devices",
            None,
            Action::ListDevices,
            Box::new(move |outcome| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome);
            }),
        );

        let value = rx.await.unwrap().unwrap();
        let data = value["data"].as_array().unwrap();
        assert_eq!(data.len(), 45);
        assert_eq!(data[0]["id"], "dev-0");
        assert_eq!(data[20]["id"], "dev-20");
        assert_eq!(data[44]["id"], "dev-44");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let sent = transport.requests();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].url.contains("page%5Bsize%5D=20"));
        assert!(sent.iter().all(|r| authorization(r) == "Bearer acc-1"));
    }

    #[tokio::test]
    async fn failed_page_discards_partial_collection() {
        let (manager, _) = setup(MockTransport::new(|req| {
            if req.url.ends_with("page=2") {
                json_response(500, &json!({"code": "InternalError", "message": "db down"}))
            } else {
                json_response(200, &json!({"data": items(20, 0), "links": {"next": "devices?page=2"}}))
            }
        }));
        let err = manager
            .request(Method::GET, "devices", None, Action::ListDevices)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 500, ref code, .. } if code == "InternalError"));
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn self_referencing_next_link_stops() {
        let (manager, transport) = setup(MockTransport::new(|req| {
            json_response(200, &json!({"data": items(2, 0), "links": {"next": req.url.clone()}}))
        }));
        let value = manager
            .request(Method::GET, "products", None, Action::ListProducts)
            .await
            .unwrap();
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn next_link_cycle_stops() {
        let (manager, transport) = setup(MockTransport::new(|req| {
            let next = if req.url.ends_with("page=b") { "products?page=c" } else { "products?page=b" };
            json_response(200, &json!({"data": items(2, 0), "links": {"next": next}}))
        }));
        let value = manager
            .request(Method::GET, "products", None, Action::ListProducts)
            .await
            .unwrap();
        // first -> b -> c -> b: the second visit to b is not fetched.
        assert_eq!(value["data"].as_array().unwrap().len(), 6);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_retried_once_after_refresh() {
        let (manager, transport) = setup(MockTransport::new(|req| match route(req) {
            "auth/token" => json_response(200, &refreshed_token_json()),
            "products/p1" if authorization(req) == "Bearer acc-2" => {
                json_response(200, &json!({"data": {"id": "p1"}}))
            }
            "products/p1" => empty_response(401),
            _ => empty_response(404),
        }));

        let value = manager
            .request(Method::GET, "products/p1", None, Action::GetProduct)
            .await
            .unwrap();
        assert_eq!(value["data"]["id"], "p1");
        assert_eq!(transport.count("products/p1"), 2);
        assert_eq!(transport.count("auth/token"), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_is_terminal() {
        let (manager, transport) = setup(MockTransport::new(|req| match route(req) {
            "auth/token" => json_response(200, &refreshed_token_json()),
            _ => empty_response(401),
        }));

        let err = manager
            .request(Method::GET, "products/p1", None, Action::GetProduct)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::Unauthorized)));
        assert_eq!(transport.count("products/p1"), 2);
        assert_eq!(transport.count("auth/token"), 1);
    }

    #[tokio::test]
    async fn forbidden_is_not_retried() {
        let (manager, transport) = setup(MockTransport::new(|_| {
            json_response(403, &json!({"errors": [{"code": "Forbidden", "detail": "not a collaborator"}]}))
        }));
        let err = manager
            .request(Method::DELETE, "products/p1", None, Action::DeleteProduct)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api { status: 403, ref message, .. } if message == "not a collaborator"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_surfaces_and_ends_session() {
        let (manager, _) = setup(MockTransport::new(|req| match route(req) {
            "auth/token" => json_response(400, &json!({"code": "InvalidKey", "message": "revoked"})),
            _ => empty_response(401),
        }));
        let err = manager
            .request(Method::GET, "devices/x", None, Action::GetDevice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::RefreshRejected(_))));
        assert!(!manager.session.is_logged_in());
    }

    #[tokio::test]
    async fn transport_failure_is_network_error() {
        let (manager, transport) = setup(MockTransport::new(|_| {
            Err(TransportError::Connect("dns failure".into()))
        }));
        let err = manager
            .request(Method::GET, "devices/x", None, Action::GetDevice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Network(TransportError::Connect(_))));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let (manager, _) = setup(MockTransport::new(|_| {
            Ok(crate::transport::HttpResponse {
                status: 200,
                body: bytes::Bytes::from_static(b"{not json"),
            })
        }));
        let err = manager
            .request(Method::GET, "devices/x", None, Action::GetDevice)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Parse(_)));
    }

    #[tokio::test]
    async fn logged_out_session_fails_dispatch() {
        let (manager, transport) = setup(MockTransport::new(|_| empty_response(200)));
        manager.session.logout();
        let err = manager
            .request(Method::GET, "devices", None, Action::ListDevices)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::NotLoggedIn)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kill_all_cancels_and_suppresses_late_completions() {
        let (manager, _) = setup(
            MockTransport::new(|_| json_response(200, &json!({"data": {}})))
                .with_latency(Duration::from_secs(5)),
        );

        let calls = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            manager.dispatch(
                Method::GET,
                "devices/x",
                None,
                Action::GetDevice,
                Box::new(move |outcome| calls.lock().unwrap().push(outcome)),
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.in_flight(), 3);

        assert_eq!(manager.kill_all(), 3);
        assert_eq!(manager.in_flight(), 0);
        {
            let calls = calls.lock().unwrap();
            assert_eq!(calls.len(), 3);
            assert!(calls.iter().all(|o| matches!(o, Err(ClientError::Cancelled))));
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_single_request() {
        let (manager, _) = setup(
            MockTransport::new(|_| json_response(200, &json!({"data": {}})))
                .with_latency(Duration::from_secs(1)),
        );
        let (tx, rx) = oneshot::channel();
        let id = manager.dispatch(
            Method::GET,
            "devices/x",
            None,
            Action::GetDevice,
            Box::new(move |o| {
                let _ = tx.send(o);
            }),
        );
        assert!(manager.is_pending(id));
        assert!(manager.cancel(id));
        assert!(!manager.cancel(id));
        assert!(matches!(rx.await.unwrap(), Err(ClientError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn page_size_change_applies_to_later_requests_only() {
        let (manager, transport) = setup(
            MockTransport::new(|_| json_response(200, &json!({"data": []})))
                .with_latency(Duration::from_millis(100)),
        );

        let (tx, rx) = oneshot::channel();
        manager.dispatch(
            Method::GET,
            "deployments",
            None,
            Action::ListDeployments,
            Box::new(move |o| {
                let _ = tx.send(o);
            }),
        );
        manager.set_page_size(50);
        rx.await.unwrap().unwrap();
        manager
            .request(Method::GET, "deployments", None, Action::ListDeployments)
            .await
            .unwrap();

        let sent = transport.requests();
        assert!(sent[0].url.contains("page%5Bsize%5D=20"));
        assert!(sent[1].url.contains("page%5Bsize%5D=50"));
        assert_eq!(manager.page_size(), 50);
    }

    fn setup_expired(transport: MockTransport) -> (Arc<ConnectionManager>, Arc<MockTransport>) {
        let (manager, transport) = setup(transport);
        manager.session.restore(Token::new(
            "acc-1",
            Some(Utc::now() - ChronoDuration::seconds(5)),
            "refresh-1",
        ));
        (manager, transport)
    }

    fn refresh_then_ok(req: &HttpRequest) -> Result<crate::transport::HttpResponse, TransportError> {
        match route(req) {
            "auth/token" => json_response(200, &refreshed_token_json()),
            _ => json_response(200, &json!({"data": {"id": "x"}})),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_request_that_drives_refresh_keeps_single_refresh() {
        let (manager, transport) = setup_expired(
            MockTransport::new(refresh_then_ok).with_latency(Duration::from_millis(200)),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ids: Vec<RequestId> = (0..3)
            .map(|_| {
                let tx = tx.clone();
                manager.dispatch(
                    Method::GET,
                    "devices/x",
                    None,
                    Action::GetDevice,
                    Box::new(move |o| {
                        let _ = tx.send(o);
                    }),
                )
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.session.phase(), SessionPhase::Refreshing);
        assert!(manager.cancel(ids[0]));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(rx.recv().await.unwrap());
        }
        assert!(matches!(outcomes[0], Err(ClientError::Cancelled)));
        assert!(outcomes[1..].iter().all(Result::is_ok));

        assert_eq!(transport.count("auth/token"), 1);
        assert_eq!(manager.session.phase(), SessionPhase::LoggedIn);
        let sent = transport.requests();
        let calls: Vec<_> = sent.iter().filter(|r| route(r) == "devices/x").collect();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|r| authorization(r) == "Bearer acc-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_all_during_refresh_leaves_session_usable() {
        let (manager, transport) = setup_expired(
            MockTransport::new(refresh_then_ok).with_latency(Duration::from_millis(200)),
        );
        manager.dispatch(Method::GET, "devices/x", None, Action::GetDevice, Box::new(|_| {}));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.session.phase(), SessionPhase::Refreshing);

        assert_eq!(manager.kill_all(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(manager.session.phase(), SessionPhase::LoggedIn);
        assert_eq!(manager.session.token().unwrap().access_token, "acc-2");
        assert_eq!(transport.count("auth/token"), 1);
        assert_eq!(transport.count("devices/x"), 0);

        let value = manager
            .request(Method::GET, "devices/x", None, Action::GetDevice)
            .await
            .unwrap();
        assert_eq!(value["data"]["id"], "x");
        assert_eq!(transport.count("auth/token"), 1);
    }

    #[test]
    fn page_size_is_at_least_one() {
        let transport = Arc::new(MockTransport::new(|_| empty_response(200)));
        let session = Arc::new(SessionManager::new(transport.clone(), API_ROOT));
        let manager = ConnectionManager::new(transport, session, API_ROOT, 0);
        assert_eq!(manager.page_size(), 1);
        manager.set_page_size(0);
        assert_eq!(manager.page_size(), 1);
    }
}
