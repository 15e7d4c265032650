//! Typed request/response routing between in-process services.
//!
//! Failures that reach a handler come back as responses with a
//! non-`Success` status; the transport never silently drops a request,
//! and a deadline overrun is itself a `Timeout` response.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use plugrid_core::{Document, PluginResult};

/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One request addressed to `(receiver, method)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed on the response.
    pub id: Uuid,
    /// Who is asking.
    pub sender: String,
    /// The service the request is addressed to.
    pub receiver: String,
    /// The method on that service.
    pub method: String,
    /// Request payload.
    pub payload: Document,
    /// Deadline for the whole call.
    #[serde(with = "timeout_ms")]
    pub timeout: Duration,
}

impl Request {
    /// A request with the default deadline.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        method: impl Into<String>,
        payload: Document,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            receiver: receiver.into(),
            method: method.into(),
            payload,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

mod timeout_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The handler ran and returned a payload.
    Success,
    /// The request was malformed (empty receiver or method).
    BadRequest,
    /// No handler is registered for `(receiver, method)`.
    NotFound,
    /// The deadline passed before the handler finished.
    Timeout,
    /// The handler failed or panicked.
    InternalError,
}

/// The answer to one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request this answers.
    pub request_id: Uuid,
    /// How the request ended.
    pub status: ResponseStatus,
    /// Human-readable status detail.
    pub status_message: String,
    /// Response payload; `Null` unless `Success`.
    pub payload: Document,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn success(request_id: Uuid, payload: Document) -> Self {
        Self {
            request_id,
            status: ResponseStatus::Success,
            status_message: String::new(),
            payload,
        }
    }

    /// A non-success response.
    #[must_use]
    pub fn failure(
        request_id: Uuid,
        status: ResponseStatus,
        status_message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            status,
            status_message: status_message.into(),
            payload: Document::Null,
        }
    }

    /// Whether the request succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Handler running on the caller's task.
pub type SyncServiceHandler = Arc<dyn Fn(&Request) -> PluginResult<Document> + Send + Sync>;

/// Handler returning a future; awaited under the request deadline.
pub type AsyncServiceHandler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, PluginResult<Document>> + Send + Sync>;

#[derive(Clone)]
enum ServiceHandler {
    Sync(SyncServiceHandler),
    Async(AsyncServiceHandler),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServiceKey {
    receiver: String,
    method: String,
}

/// Counters for [`ServiceRouter::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatistics {
    /// Requests handed to `send_request` / `send_request_async`.
    pub total_requests_sent: u64,
    /// Responses produced with `Success` status.
    pub total_responses_received: u64,
    /// Responses produced with any other status.
    pub total_errors: u64,
}

struct RouterInner {
    services: DashMap<ServiceKey, ServiceHandler>,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
}

/// The request/response router. Cheap to clone; clones share all state.
#[derive(Clone, Default)]
pub struct ServiceRouter {
    inner: Arc<RouterInner>,
}

impl Default for RouterInner {
    fn default() -> Self {
        Self {
            services: DashMap::new(),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl ServiceRouter {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for `(receiver, method)`.
    ///
    /// Re-registering replaces the previous handler; calls already in
    /// flight complete on the handler they started with.
    pub fn register_sync_service(
        &self,
        receiver: impl Into<String>,
        method: impl Into<String>,
        handler: SyncServiceHandler,
    ) {
        let key = ServiceKey {
            receiver: receiver.into(),
            method: method.into(),
        };
        debug!(receiver = %key.receiver, method = %key.method, "Registered sync service");
        self.inner.services.insert(key, ServiceHandler::Sync(handler));
    }

    /// Register an asynchronous handler for `(receiver, method)`.
    pub fn register_async_service(
        &self,
        receiver: impl Into<String>,
        method: impl Into<String>,
        handler: AsyncServiceHandler,
    ) {
        let key = ServiceKey {
            receiver: receiver.into(),
            method: method.into(),
        };
        debug!(receiver = %key.receiver, method = %key.method, "Registered async service");
        self.inner.services.insert(key, ServiceHandler::Async(handler));
    }

    /// Remove a service. Returns whether it was registered.
    pub fn unregister_service(&self, receiver: &str, method: &str) -> bool {
        let key = ServiceKey {
            receiver: receiver.to_string(),
            method: method.to_string(),
        };
        self.inner.services.remove(&key).is_some()
    }

    /// Every registered `(receiver, method)` pair, sorted.
    #[must_use]
    pub fn list_services(&self) -> Vec<(String, String)> {
        let mut services: Vec<(String, String)> = self
            .inner
            .services
            .iter()
            .map(|entry| (entry.key().receiver.clone(), entry.key().method.clone()))
            .collect();
        services.sort();
        services
    }

    /// Send a request and wait for its response under the request's own
    /// deadline.
    ///
    /// Always resolves to a response: malformed requests come back as
    /// `BadRequest`, unknown services as `NotFound`, handler failures as
    /// `InternalError`, and a deadline overrun as `Timeout`. A timed-out
    /// synchronous handler keeps running on its blocking thread; its
    /// result is discarded.
    pub async fn send_request(&self, request: Request) -> Response {
        self.inner.requests_sent.fetch_add(1, Ordering::Relaxed);
        let response = self.dispatch(request).await;
        if response.is_success() {
            self.inner.responses_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.errors.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    /// Send a request with an explicit deadline overriding the request's.
    pub async fn send_request_async(&self, request: Request, timeout: Duration) -> Response {
        self.send_request(request.with_timeout(timeout)).await
    }

    /// Current counters.
    #[must_use]
    pub fn statistics(&self) -> RouterStatistics {
        RouterStatistics {
            total_requests_sent: self.inner.requests_sent.load(Ordering::Relaxed),
            total_responses_received: self.inner.responses_received.load(Ordering::Relaxed),
            total_errors: self.inner.errors.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        if request.receiver.is_empty() || request.method.is_empty() {
            return Response::failure(
                request.id,
                ResponseStatus::BadRequest,
                "empty receiver or method",
            );
        }

        let key = ServiceKey {
            receiver: request.receiver.clone(),
            method: request.method.clone(),
        };
        // Cloned out so a concurrent re-registration cannot swap the
        // handler under an in-flight call.
        let Some(handler) = self.inner.services.get(&key).map(|entry| entry.clone()) else {
            return Response::failure(
                request.id,
                ResponseStatus::NotFound,
                format!("no service {}/{}", request.receiver, request.method),
            );
        };

        let request_id = request.id;
        let budget = request.timeout;
        let outcome = match handler {
            ServiceHandler::Sync(handler) => {
                let task = tokio::task::spawn_blocking(move || handler(&request));
                match tokio::time::timeout(budget, task).await {
                    Ok(Ok(result)) => Some(result),
                    Ok(Err(join_error)) => {
                        warn!(request = %request_id, "Sync service handler panicked");
                        return Response::failure(
                            request_id,
                            ResponseStatus::InternalError,
                            join_error.to_string(),
                        );
                    },
                    Err(_) => None,
                }
            },
            ServiceHandler::Async(handler) => {
                match tokio::time::timeout(budget, handler(request)).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            },
        };

        match outcome {
            Some(Ok(payload)) => Response::success(request_id, payload),
            Some(Err(e)) => {
                Response::failure(request_id, ResponseStatus::InternalError, e.to_string())
            },
            None => Response::failure(
                request_id,
                ResponseStatus::Timeout,
                format!("no response within {budget:?}"),
            ),
        }
    }
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("services", &self.inner.services.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use plugrid_core::PluginError;
    use serde_json::json;
    use std::time::Instant;

    fn echo() -> SyncServiceHandler {
        Arc::new(|request: &Request| Ok(request.payload.clone()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_service_round_trip() {
        let router = ServiceRouter::new();
        router.register_sync_service("math", "echo", echo());

        let response = router
            .send_request(Request::new("caller", "math", "echo", json!({ "x": 7 })))
            .await;
        assert!(response.is_success());
        assert_eq!(response.payload, json!({ "x": 7 }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_service_round_trip() {
        let router = ServiceRouter::new();
        let handler: AsyncServiceHandler = Arc::new(|request: Request| {
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!({ "doubled": request.payload["n"].as_i64().unwrap_or(0) * 2 }))
            }
            .boxed()
        });
        router.register_async_service("math", "double", handler);

        let response = router
            .send_request(Request::new("caller", "math", "double", json!({ "n": 21 })))
            .await;
        assert!(response.is_success());
        assert_eq!(response.payload, json!({ "doubled": 42 }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_receiver_or_method_is_bad_request() {
        let router = ServiceRouter::new();
        for (receiver, method) in [("", "echo"), ("math", "")] {
            let response = router
                .send_request(Request::new("caller", receiver, method, Document::Null))
                .await;
            assert_eq!(response.status, ResponseStatus::BadRequest);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_service_is_not_found() {
        let router = ServiceRouter::new();
        let response = router
            .send_request(Request::new("caller", "nobody", "nothing", Document::Null))
            .await;
        assert_eq!(response.status, ResponseStatus::NotFound);
        assert!(response.status_message.contains("nobody/nothing"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_error_is_internal_error() {
        let router = ServiceRouter::new();
        router.register_sync_service(
            "svc",
            "broken",
            Arc::new(|_: &Request| Err(PluginError::execution_failed("database gone"))),
        );

        let response = router
            .send_request(Request::new("caller", "svc", "broken", Document::Null))
            .await;
        assert_eq!(response.status, ResponseStatus::InternalError);
        assert!(response.status_message.contains("database gone"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_panic_is_internal_error() {
        let router = ServiceRouter::new();
        router.register_sync_service(
            "svc",
            "explosive",
            Arc::new(|_: &Request| panic!("boom")),
        );

        let response = router
            .send_request(Request::new("caller", "svc", "explosive", Document::Null))
            .await;
        assert_eq!(response.status, ResponseStatus::InternalError);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deadline_overrun_is_a_timeout_response() {
        let router = ServiceRouter::new();
        let handler: AsyncServiceHandler = Arc::new(|_: Request| {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Document::Null)
            }
            .boxed()
        });
        router.register_async_service("svc", "slow", handler);

        let started = Instant::now();
        let response = router
            .send_request(
                Request::new("caller", "svc", "slow", Document::Null)
                    .with_timeout(Duration::from_millis(100)),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reregistration_replaces_but_in_flight_calls_finish_on_old() {
        let router = ServiceRouter::new();
        let slow_old: AsyncServiceHandler = Arc::new(|_: Request| {
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(json!("old"))
            }
            .boxed()
        });
        router.register_async_service("svc", "get", slow_old);

        let in_flight = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send_request(Request::new("caller", "svc", "get", Document::Null))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        router.register_sync_service("svc", "get", Arc::new(|_: &Request| Ok(json!("new"))));

        let old_response = in_flight.await.unwrap();
        assert_eq!(old_response.payload, json!("old"));

        let new_response = router
            .send_request(Request::new("caller", "svc", "get", Document::Null))
            .await;
        assert_eq!(new_response.payload, json!("new"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn service_listing_and_unregister() {
        let router = ServiceRouter::new();
        router.register_sync_service("b", "m2", echo());
        router.register_sync_service("a", "m1", echo());
        assert_eq!(
            router.list_services(),
            vec![
                ("a".to_string(), "m1".to_string()),
                ("b".to_string(), "m2".to_string())
            ]
        );
        assert!(router.unregister_service("a", "m1"));
        assert!(!router.unregister_service("a", "m1"));
        assert_eq!(router.list_services().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn statistics_count_outcomes() {
        let router = ServiceRouter::new();
        router.register_sync_service("svc", "ok", echo());

        router
            .send_request(Request::new("c", "svc", "ok", json!(1)))
            .await;
        router
            .send_request(Request::new("c", "missing", "m", json!(1)))
            .await;

        let stats = router.statistics();
        assert_eq!(stats.total_requests_sent, 2);
        assert_eq!(stats.total_responses_received, 1);
        assert_eq!(stats.total_errors, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_request_async_overrides_deadline() {
        let router = ServiceRouter::new();
        let handler: AsyncServiceHandler = Arc::new(|_: Request| {
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Document::Null)
            }
            .boxed()
        });
        router.register_async_service("svc", "slow", handler);

        let response = router
            .send_request_async(
                Request::new("c", "svc", "slow", Document::Null),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(response.status, ResponseStatus::Timeout);
    }
}
