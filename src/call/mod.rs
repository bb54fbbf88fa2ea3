//! The call pipeline: route policy, node selection, limiter and fusing gates,
//! and the retried downstream invocation.

mod error;
pub mod fusing;
pub mod http;
mod internal_event;
pub mod invoker;
pub mod limiter;
pub mod load_tracker;
pub mod reqwest_integration;
pub mod retries;
pub mod spec;

use std::sync::Arc;

use ::http::{Request as HttpRequest, Response as HttpResponse};
use bytes::Bytes;
use snafu::OptionExt;
use tower::Service;

pub use error::{CallError, CallResult, NOT_FOUND, SERVER_ERROR, SERVER_FUSING, SERVER_LIMITER};
use error::{CircuitOpenSnafu, RateLimitedSnafu, RouteNotFoundSnafu};
use fusing::CircuitBreaker;
use http::HttpError;
use internal_event::{CallCompleted, GateRejected};
use invoker::DownstreamInvoker;
use limiter::RateLimiter;
use load_tracker::LoadTracker;
use reqwest_integration::ReqwestService;
use retries::{DownstreamRetryLogic, RetryPlan};

use crate::{
    Error as CrateError,
    config::{Config, NodeDirectory, RouteKind, RouteTable, ServiceSettings},
    request::Request,
    trace::SpanContext,
};

/// Limiter and fusing bookkeeping key of one `(node, service, action)`.
pub fn gate_key(address: &str, service: &str, action: &str) -> String {
    format!("{address}/{service}/{action}")
}

/// Entry point of the call layer.
///
/// Cloning is cheap; clones share the load tracker, limiter and breaker
/// state, which live as long as the last clone.
#[derive(Clone, Debug)]
pub struct Dispatcher<S = ReqwestService> {
    settings: Arc<ServiceSettings>,
    routes: Arc<RouteTable>,
    retry_plan: RetryPlan,
    tracker: LoadTracker,
    limiter: Arc<RateLimiter>,
    fusing: Arc<CircuitBreaker>,
    invoker: DownstreamInvoker<S>,
}

impl Dispatcher<ReqwestService> {
    /// Dispatcher calling downstream services over `reqwest`, bounded by the
    /// configured downstream timeout. Must run inside a tokio runtime.
    pub fn new(config: Config, nodes: Arc<dyn NodeDirectory>) -> Result<Self, HttpError> {
        let service = ReqwestService::new(config.service.downstream_timeout())?;
        Ok(Self::with_service(config, nodes, service))
    }
}

impl<S> Dispatcher<S>
where
    S: Service<HttpRequest<Bytes>, Response = HttpResponse<String>> + Clone + Send + 'static,
    S::Error: Into<CrateError>,
    S::Future: Send,
{
    /// Dispatcher sending every attempt through `service`. Must run inside a
    /// tokio runtime.
    pub fn with_service(config: Config, nodes: Arc<dyn NodeDirectory>, service: S) -> Self {
        let Config { service: settings, routes } = config;
        let retry_plan = RetryPlan::analyze_or_single(&settings.call_retry);
        let invoker = DownstreamInvoker::new(service, settings.call_key.clone());

        info!(
            role = %settings.service_name,
            attempts = retry_plan.attempts(),
            "Dispatcher initialized"
        );

        Self {
            settings: Arc::new(settings),
            routes: Arc::new(routes),
            retry_plan,
            tracker: LoadTracker::spawn(nodes),
            limiter: Arc::new(RateLimiter::new()),
            fusing: Arc::new(CircuitBreaker::new()),
            invoker,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &LoadTracker {
        &self.tracker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn fusing(&self) -> &CircuitBreaker {
        &self.fusing
    }

    /// Calls `action` on `service` and normalises the outcome.
    pub async fn call<T: SpanContext + ?Sized>(
        &self,
        span: &T,
        service: &str,
        action: &str,
        request: &Request,
    ) -> CallResult {
        let mut attempts = 0;
        let result = match self
            .dispatch(span, service, action, request, &mut attempts)
            .await
        {
            Ok(body) => CallResult::success(body),
            Err(error) => {
                debug!(service, action, %error, "Call failed");
                CallResult::failure(error)
            }
        };

        CallCompleted {
            service,
            action,
            status: result.status,
            attempts,
        }
        .emit();
        result
    }

    async fn dispatch<T: SpanContext + ?Sized>(
        &self,
        span: &T,
        service: &str,
        action: &str,
        request: &Request,
        attempts: &mut usize,
    ) -> Result<String, CallError> {
        if !self.routes.has_service(service) {
            return RouteNotFoundSnafu {
                reason: "service not found",
            }
            .fail();
        }
        let route = self
            .routes
            .lookup(service, action)
            .context(RouteNotFoundSnafu {
                reason: "service route not found",
            })?;

        if !route.kind.permits(self.settings.is_gateway()) {
            let reason = match route.kind {
                RouteKind::Outbound => "only the gateway may call outbound routes",
                RouteKind::Inbound => "the gateway may not call inbound routes",
            };
            return RouteNotFoundSnafu { reason }.fail();
        }

        // Selecting the node and counting the call are one actor step so two
        // concurrent calls never both see the same minimum. The gates below
        // do not await; a rejected call drops this lease before yielding.
        let lease = self
            .tracker
            .acquire(service)
            .await
            .map_err(|e| CallError::RouteNotFound {
                reason: e.to_string(),
            })?;
        let node = lease.node().clone();
        let key = gate_key(&node.address, service, action);

        if let Some(spec) = &route.limiter {
            match RateLimiter::analyze(spec) {
                Err(error) => debug!(%error, service, action, "Limiter spec rejected; gate skipped"),
                Ok(window) if !self.limiter.inspect(&key, window) => {
                    span.tag("break", "service limiter");
                    GateRejected {
                        gate: "limiter",
                        service,
                        action,
                        node: &node.address,
                    }
                    .emit();
                    return RateLimitedSnafu.fail();
                }
                Ok(_) => {}
            }
        }

        if let Some(spec) = &route.fusing {
            match CircuitBreaker::analyze(spec) {
                Err(error) => debug!(%error, service, action, "Fusing spec rejected; gate skipped"),
                Ok(window) if !self.fusing.inspect(&key, window) => {
                    span.tag("break", "service fusing");
                    GateRejected {
                        gate: "fusing",
                        service,
                        action,
                        node: &node.address,
                    }
                    .emit();
                    return CircuitOpenSnafu.fail();
                }
                Ok(_) => {}
            }
        }

        let url = format!("http://{}{}", node.address, route.path);
        let url = url.as_str();
        let invoker = &self.invoker;
        let tracker = &self.tracker;
        let attempts_made = &mut *attempts;
        // The selection lease counts the first attempt; later attempts take
        // their own lease on the same node.
        let mut reserved = Some(lease);

        let outcome = self
            .retry_plan
            .run(&DownstreamRetryLogic, move |index| {
                *attempts_made = index + 1;
                let lease = reserved
                    .take()
                    .unwrap_or_else(|| tracker.lease(service, node.clone()));
                let invocation = invoker.invoke(span, url, request);
                async move {
                    let result = invocation.await;
                    drop(lease);
                    result
                }
            })
            .await;

        match outcome {
            Ok(body) => Ok(body),
            Err(error) if error.is_not_found() => Err(CallError::RouteNotFound {
                reason: error.to_string(),
            }),
            Err(error) => {
                // Counted once per exhausted call, not per attempt.
                if route.fusing.is_some() {
                    self.fusing.add_failure(&key);
                }
                Err(CallError::Downstream { source: error })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        task::{Context, Poll},
        time::Duration,
    };

    use ::http::StatusCode;
    use futures::future::BoxFuture;
    use tower_test::mock;

    use super::*;
    use crate::{
        config::{Route, StaticNodes},
        trace::NoopSpan,
    };

    /// Downstream stub answering each hit with the status `reply(hit)` and
    /// the body `"reply <hit>"`.
    #[derive(Clone)]
    struct Downstream {
        seen: Arc<Mutex<Vec<String>>>,
        reply: Arc<dyn Fn(usize) -> u16 + Send + Sync>,
    }

    impl Downstream {
        fn replying(reply: impl Fn(usize) -> u16 + Send + Sync + 'static) -> Self {
            Self {
                seen: Arc::default(),
                reply: Arc::new(reply),
            }
        }

        fn always(status: u16) -> Self {
            Self::replying(move |_| status)
        }

        fn hits(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn uris(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Service<HttpRequest<Bytes>> for Downstream {
        type Response = HttpResponse<String>;
        type Error = HttpError;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: HttpRequest<Bytes>) -> Self::Future {
            let hit = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(request.uri().to_string());
                seen.len() - 1
            };
            let status = StatusCode::from_u16((self.reply)(hit)).unwrap();
            Box::pin(async move {
                let mut response = HttpResponse::new(format!("reply {hit}"));
                *response.status_mut() = status;
                Ok(response)
            })
        }
    }

    fn routes() -> RouteTable {
        let mut routes = RouteTable::new();
        routes.insert("user", "login", Route::new("/login", RouteKind::Inbound));
        routes.insert("user", "home", Route::new("/home", RouteKind::Outbound));
        routes.insert(
            "user",
            "limited",
            Route::new("/limited", RouteKind::Inbound).with_limiter("60/1"),
        );
        routes.insert(
            "user",
            "fragile",
            Route::new("/fragile", RouteKind::Inbound).with_fusing("60/1"),
        );
        routes.insert(
            "user",
            "sloppy",
            Route::new("/sloppy", RouteKind::Inbound)
                .with_limiter("soon/ish")
                .with_fusing("often"),
        );
        routes.insert(
            "user",
            "flaky",
            Route::new("/flaky", RouteKind::Inbound).with_fusing("60/5"),
        );
        routes
    }

    fn dispatcher<S>(role: &str, retry: &str, nodes: &[&str], service: S) -> Dispatcher<S>
    where
        S: Service<HttpRequest<Bytes>, Response = HttpResponse<String>> + Clone + Send + 'static,
        S::Error: Into<CrateError>,
        S::Future: Send,
    {
        let settings = ServiceSettings::builder()
            .service_name(role)
            .call_retry(retry)
            .call_key("key")
            .build();
        let directory = StaticNodes::from_iter([(
            "user",
            nodes.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )]);
        Dispatcher::with_service(Config::new(settings, routes()), Arc::new(directory), service)
    }

    async fn call(dispatcher: &Dispatcher<Downstream>, action: &str) -> CallResult {
        dispatcher
            .call(&NoopSpan, "user", action, &Request::new("POST"))
            .await
    }

    #[tokio::test]
    async fn healthy_call_returns_downstream_body() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        let result = call(&dispatcher, "login").await;

        assert_eq!(result.status, 200);
        assert_eq!(result.body, "reply 0");
        assert!(result.is_success());
        assert_eq!(downstream.uris(), vec!["http://10.0.0.1:9000/login"]);
        assert_eq!(dispatcher.tracker().snapshot("user").await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn unknown_service_or_action_is_not_found() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        let missing_service = dispatcher
            .call(&NoopSpan, "billing", "login", &Request::default())
            .await;
        assert_eq!((missing_service.status, missing_service.body.as_str()), (404, NOT_FOUND));

        let missing_action = call(&dispatcher, "logout").await;
        assert_eq!((missing_action.status, missing_action.body.as_str()), (404, NOT_FOUND));
        assert_eq!(downstream.hits(), 0);
    }

    #[tokio::test]
    async fn gateway_may_only_call_outbound_routes() {
        let downstream = Downstream::always(200);
        let gateway = dispatcher("gateway", "0", &["10.0.0.1:9000"], downstream.clone());

        assert_eq!(call(&gateway, "home").await.status, 200);
        let inbound = call(&gateway, "login").await;
        assert_eq!((inbound.status, inbound.body.as_str()), (404, NOT_FOUND));
        assert!(matches!(inbound.error, Some(CallError::RouteNotFound { .. })));
    }

    #[tokio::test]
    async fn services_may_only_call_inbound_routes() {
        let downstream = Downstream::always(200);
        let internal = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        assert_eq!(call(&internal, "login").await.status, 200);
        assert_eq!(call(&internal, "home").await.status, 404);
        assert_eq!(downstream.hits(), 1);
    }

    #[tokio::test]
    async fn service_without_nodes_is_not_found() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &[], downstream.clone());

        assert_eq!(call(&dispatcher, "login").await.status, 404);
        assert_eq!(downstream.hits(), 0);
    }

    #[tokio::test]
    async fn limiter_rejects_over_budget_calls() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        assert_eq!(call(&dispatcher, "limited").await.status, 200);
        let rejected = call(&dispatcher, "limited").await;
        assert_eq!((rejected.status, rejected.body.as_str()), (403, SERVER_LIMITER));
        assert_eq!(downstream.hits(), 1);
        assert_eq!(dispatcher.tracker().snapshot("user").await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn exhausted_failure_opens_the_circuit() {
        let downstream = Downstream::always(500);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        let failed = call(&dispatcher, "fragile").await;
        assert_eq!((failed.status, failed.body.as_str()), (500, SERVER_ERROR));
        assert!(matches!(failed.error, Some(CallError::Downstream { .. })));

        let fused = call(&dispatcher, "fragile").await;
        assert_eq!((fused.status, fused.body.as_str()), (403, SERVER_FUSING));
        assert_eq!(downstream.hits(), 1);
        assert_eq!(
            dispatcher
                .fusing()
                .state(&gate_key("10.0.0.1:9000", "user", "fragile")),
            fusing::CircuitState::Open
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_call_counts_one_failure_whatever_its_attempts() {
        let downstream = Downstream::always(502);
        let dispatcher = dispatcher("order", "0/10/10", &["10.0.0.1:9000"], downstream.clone());
        let key = gate_key("10.0.0.1:9000", "user", "flaky");

        let result = call(&dispatcher, "flaky").await;

        assert_eq!((result.status, result.body.as_str()), (500, SERVER_ERROR));
        assert_eq!(downstream.hits(), 3);
        assert_eq!(dispatcher.fusing().failures(&key), 1);
        assert_eq!(dispatcher.fusing().state(&key), fusing::CircuitState::Closed);

        call(&dispatcher, "flaky").await;
        assert_eq!(dispatcher.fusing().failures(&key), 2);
        assert_eq!(downstream.hits(), 6);
    }

    #[tokio::test]
    async fn gate_rejection_releases_the_selected_node() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000", "10.0.0.2:9000"], downstream.clone());

        assert_eq!(call(&dispatcher, "limited").await.status, 200);
        assert_eq!(call(&dispatcher, "limited").await.status, 403);
        assert_eq!(
            dispatcher.tracker().snapshot("user").await.unwrap(),
            vec![0, 0]
        );

        // The rejected call left no count behind, so selection still starts
        // from the lowest index.
        assert_eq!(call(&dispatcher, "login").await.status, 200);
        assert_eq!(
            downstream.uris(),
            vec!["http://10.0.0.1:9000/limited", "http://10.0.0.1:9000/login"]
        );
    }

    #[tokio::test]
    async fn malformed_gate_specs_fail_open() {
        let downstream = Downstream::always(200);
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000"], downstream.clone());

        for _ in 0..3 {
            assert_eq!(call(&dispatcher, "sloppy").await.status, 200);
        }
        assert_eq!(dispatcher.limiter().tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_downstream_is_retried_per_plan() {
        let downstream = Downstream::always(502);
        let dispatcher = dispatcher("order", "0/100/300", &["10.0.0.1:9000"], downstream.clone());
        let start = tokio::time::Instant::now();

        let result = call(&dispatcher, "login").await;

        assert_eq!((result.status, result.body.as_str()), (500, SERVER_ERROR));
        assert_eq!(downstream.hits(), 3);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(500),
            "elapsed {elapsed:?}"
        );
        assert_eq!(dispatcher.tracker().snapshot("user").await.unwrap(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let downstream = Downstream::replying(|hit| if hit == 0 { 503 } else { 200 });
        let dispatcher = dispatcher("order", "0/100", &["10.0.0.1:9000"], downstream.clone());

        let result = call(&dispatcher, "login").await;

        assert_eq!((result.status, result.body.as_str()), (200, "reply 1"));
        assert_eq!(downstream.hits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn downstream_not_found_short_circuits() {
        let downstream = Downstream::always(404);
        let dispatcher = dispatcher("order", "0/100/300", &["10.0.0.1:9000"], downstream.clone());

        let result = call(&dispatcher, "fragile").await;

        assert_eq!((result.status, result.body.as_str()), (404, NOT_FOUND));
        assert_eq!(downstream.hits(), 1);
        assert_eq!(
            dispatcher
                .fusing()
                .failures(&gate_key("10.0.0.1:9000", "user", "fragile")),
            0
        );
    }

    #[tokio::test]
    async fn in_flight_calls_steer_selection_to_idle_nodes() {
        let (service, mut handle) = mock::pair::<HttpRequest<Bytes>, HttpResponse<String>>();
        let dispatcher = dispatcher("order", "0", &["10.0.0.1:9000", "10.0.0.2:9000"], service);

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .call(&NoopSpan, "user", "login", &Request::new("GET"))
                    .await
            }
        });
        let (first_request, first_reply) = handle.next_request().await.unwrap();
        assert_eq!(first_request.uri().host(), Some("10.0.0.1"));

        let second = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .call(&NoopSpan, "user", "login", &Request::new("GET"))
                    .await
            }
        });
        let (second_request, second_reply) = handle.next_request().await.unwrap();
        assert_eq!(second_request.uri().host(), Some("10.0.0.2"));
        assert_eq!(
            dispatcher.tracker().snapshot("user").await.unwrap(),
            vec![1, 1]
        );

        first_reply.send_response(HttpResponse::new("one".to_string()));
        second_reply.send_response(HttpResponse::new("two".to_string()));
        assert_eq!(first.await.unwrap().body, "one");
        assert_eq!(second.await.unwrap().body, "two");
        assert_eq!(
            dispatcher.tracker().snapshot("user").await.unwrap(),
            vec![0, 0]
        );
    }
}
