//! End-to-end runtime behaviour over real listeners on `127.0.0.1:0`.

use async_trait::async_trait;
use esgate_gateway::GatewayError;
use esgate_gateway::frontend::{
    FrontendConnector, HttpFrontendConnector, LineConnectionHandler, TcpFrontendConnector,
};
use esgate_gateway::handler::RequestHandler;
use esgate_gateway::pipeline::PipelineBuilder;
use esgate_gateway::processor::BackendForwardProcessor;
use esgate_gateway::router::PathRouter;
use esgate_gateway::runtime::{GatewayBuilder, Runtime};
use esgate_kernel::pipeline::{
    BackendConnector, BackendConnectorKind, BackendError, BackendResponse, DocumentBackend,
    HttpMethod, Middleware, ProcessResult, Request, ResponseWriter, handler_fn,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

const DEADLINE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct CountingMiddleware {
    calls: Arc<AtomicUsize>,
    emit_error: bool,
}

#[async_trait]
impl Middleware for CountingMiddleware {
    fn name(&self) -> &str {
        "counting"
    }

    async fn handle(&self, _req: &Request, w: &mut ResponseWriter) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.emit_error {
            w.error(500, "middleware");
        }
    }
}

fn counting(calls: &Arc<AtomicUsize>, emit_error: bool) -> Arc<dyn Middleware> {
    Arc::new(CountingMiddleware {
        calls: Arc::clone(calls),
        emit_error,
    })
}

fn text_router(routes: &[(&str, &'static str)]) -> PathRouter {
    let mut router = PathRouter::new();
    for (pattern, body) in routes {
        let body = *body;
        router.add_route(pattern, handler_fn(move |_| async move { Ok(ProcessResult::text(body)) }));
    }
    router
}

fn http_pipeline(name: &str, connector: HttpFrontendConnector) -> PipelineBuilder {
    let mut pipeline = PipelineBuilder::new(name);
    pipeline.add_frontend_connector(connector);
    pipeline
}

/// Loopback address of a running connector, also for wildcard binds.
fn addr_of(runtime: &Runtime, index: usize) -> SocketAddr {
    let bound = runtime.connectors()[index]
        .local_addr()
        .expect("connector should be listening");
    SocketAddr::from(([127, 0, 0, 1], bound.port()))
}

async fn post(addr: SocketAddr, path: &str) -> (u16, String) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .body("{}")
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

/// Answers every request the way an Elasticsearch node does.
struct ElasticStub;

#[async_trait]
impl DocumentBackend for ElasticStub {
    async fn send(
        &self,
        _method: HttpMethod,
        _path_and_query: &str,
        _body: Vec<u8>,
    ) -> Result<BackendResponse, BackendError> {
        let headers = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("x-elastic-product".to_string(), "Elasticsearch".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ]);
        Ok(BackendResponse {
            status: 200,
            headers,
            body: br#"{"hits":{"total":{"value":0}}}"#.to_vec(),
            elapsed: Duration::ZERO,
        })
    }

    async fn index_document(
        &self,
        _index: &str,
        _document: &serde_json::Value,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl BackendConnector for ElasticStub {
    fn kind(&self) -> BackendConnectorKind {
        BackendConnectorKind::Document
    }

    fn endpoint(&self) -> &str {
        "stub://elastic"
    }

    async fn close(&self) {}

    fn as_document(&self) -> Option<&dyn DocumentBackend> {
        Some(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector merging
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pipelines_at_one_address_serve_each_others_routes() {
    let ingest = http_pipeline(
        "ingest",
        HttpFrontendConnector::new("127.0.0.1:0").with_router(text_router(&[("/_bulk", "bulk\n")])),
    );
    let query = http_pipeline(
        "query",
        HttpFrontendConnector::new("127.0.0.1:0")
            .with_router(text_router(&[("/_search", "search\n"), ("/:index/_search", "index search\n")])),
    );
    let runtime = GatewayBuilder::new()
        .with_pipeline(ingest)
        .with_pipeline(query)
        .build()
        .unwrap();

    let a = &runtime.pipelines()[0].frontend_connectors()[0];
    let b = &runtime.pipelines()[1].frontend_connectors()[0];
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(a.handler_count(), 3);

    runtime.start().await.unwrap();
    let addr = addr_of(&runtime, 0);
    assert_eq!(post(addr, "/_bulk").await, (200, "bulk\n".to_string()));
    assert_eq!(post(addr, "/_search").await, (200, "search\n".to_string()));
    assert_eq!(post(addr, "/logs/_search").await, (200, "index search\n".to_string()));
    runtime.stop(DEADLINE).await.unwrap();

    let stats = runtime.statistics().snapshot();
    assert_eq!(stats.matched.iter().map(|c| c.count).sum::<u64>(), 3);
}

#[tokio::test]
async fn pipelines_at_distinct_addresses_stay_apart() {
    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline(
            "ingest",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(text_router(&[("/_bulk", "bulk\n")])),
        ))
        .with_pipeline(http_pipeline(
            "query",
            HttpFrontendConnector::new(":0").with_router(text_router(&[("/_search", "search\n")])),
        ))
        .build()
        .unwrap();

    assert_eq!(runtime.connectors().len(), 2);
    runtime.start().await.unwrap();
    let ingest = addr_of(&runtime, 0);
    let query = addr_of(&runtime, 1);
    assert_ne!(ingest, query);

    assert_eq!(post(ingest, "/_bulk").await.0, 200);
    assert_eq!(post(ingest, "/_search").await.0, 404);
    assert_eq!(post(query, "/_search").await.0, 200);
    assert_eq!(post(query, "/_bulk").await.0, 404);
    runtime.stop(DEADLINE).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware chain
// ─────────────────────────────────────────────────────────────────────────────

async fn run_chain(emit_error: bool) -> (usize, Vec<(u16, String)>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let connector = HttpFrontendConnector::new("127.0.0.1:0")
        .with_router(text_router(&[("/_bulk", "bulk\n"), ("/:index/_search", "search\n")]))
        .with_middleware(counting(&calls, emit_error))
        .with_middleware(counting(&calls, false));
    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline("chain", connector))
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let addr = addr_of(&runtime, 0);
    let mut answers = Vec::new();
    for path in ["/_bulk", "/_bulk", "/logs/_search", "/logs/_search"] {
        answers.push(post(addr, path).await);
    }
    runtime.stop(DEADLINE).await.unwrap();
    (calls.load(Ordering::SeqCst), answers)
}

#[tokio::test]
async fn committing_first_middleware_stops_the_chain() {
    let (calls, answers) = run_chain(true).await;
    assert_eq!(calls, 4);
    for (status, body) in answers {
        assert_eq!(status, 500);
        assert_eq!(body, "middleware\n");
    }
}

#[tokio::test]
async fn passthrough_middlewares_all_run() {
    let (calls, answers) = run_chain(false).await;
    assert_eq!(calls, 8);
    assert_eq!(answers[0], (200, "bulk\n".to_string()));
    assert_eq!(answers[3], (200, "search\n".to_string()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback-only router
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fallback_only_router_answers_every_path() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let mut router = PathRouter::new();
    router.add_fallback_handler(handler_fn(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessResult::text("unknown\n"))
        }
    }));
    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline(
            "fallback",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(router),
        ))
        .build()
        .unwrap();
    assert_eq!(runtime.connectors()[0].handler_count(), 0);
    runtime.start().await.unwrap();

    let addr = addr_of(&runtime, 0);
    for path in ["/_bulk", "/_doc", "/_search", "/_search"] {
        assert_eq!(post(addr, path).await, (200, "unknown\n".to_string()));
    }
    runtime.stop(DEADLINE).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 4);

    let stats = runtime.statistics().snapshot();
    assert_eq!(stats.unmatched.iter().map(|c| c.count).sum::<u64>(), 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn forwarded_responses_keep_backend_headers() {
    let mut router = PathRouter::new();
    router.add_route("/:index/_search", RequestHandler::shared());
    let mut pipeline = http_pipeline(
        "query",
        HttpFrontendConnector::new("127.0.0.1:0").with_router(router),
    );
    pipeline
        .add_processor(BackendForwardProcessor::new("query-forward"))
        .add_backend_connector(Arc::new(ElasticStub));
    let runtime = GatewayBuilder::new().with_pipeline(pipeline).build().unwrap();
    runtime.start().await.unwrap();

    let addr = addr_of(&runtime, 0);
    let resp = reqwest::get(format!("http://{addr}/logs/_search")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    assert_eq!(header("content-type").as_deref(), Some("application/json"));
    assert_eq!(header("x-elastic-product").as_deref(), Some("Elasticsearch"));
    assert_eq!(resp.text().await.unwrap(), r#"{"hits":{"total":{"value":0}}}"#);

    runtime.stop(DEADLINE).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shared_connector_is_stopped_once() {
    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline(
            "a",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(text_router(&[("/a", "a")])),
        ))
        .with_pipeline(http_pipeline(
            "b",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(text_router(&[("/b", "b")])),
        ))
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    let addr = addr_of(&runtime, 0);
    assert!(runtime.connectors()[0].is_running());

    // a second stop of the same listener would surface as NotRunning
    runtime.stop(DEADLINE).await.unwrap();
    assert!(!runtime.connectors()[0].is_running());
    assert!(reqwest::get(format!("http://{addr}/a")).await.is_err());

    // stopping an already stopped runtime is a no-op
    runtime.stop(DEADLINE).await.unwrap();
}

#[tokio::test]
async fn bind_failure_rolls_back_started_connectors() {
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().to_string();

    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline(
            "ok",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(text_router(&[("/a", "a")])),
        ))
        .with_pipeline(http_pipeline(
            "taken",
            HttpFrontendConnector::new(taken.as_str()).with_router(text_router(&[("/b", "b")])),
        ))
        .build()
        .unwrap();

    assert!(runtime.start().await.is_err());
    assert!(runtime.connectors().iter().all(|c| !c.is_running()));
}

#[tokio::test]
async fn tcp_connector_runs_pipeline_processors() {
    let mut pipeline = PipelineBuilder::new("raw");
    pipeline.add_frontend_connector(TcpFrontendConnector::new(
        "127.0.0.1:0",
        Arc::new(LineConnectionHandler),
    ));
    let runtime = GatewayBuilder::new().with_pipeline(pipeline).build().unwrap();
    runtime.start().await.unwrap();

    let addr = addr_of(&runtime, 0);
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ping\n").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    // no processors: each line is echoed back
    assert_eq!(reply, "ping\n");

    runtime.stop(DEADLINE).await.unwrap();
}

#[tokio::test]
async fn stop_deadline_abandons_in_flight_requests() {
    let entered = Arc::new(Notify::new());
    let signal = Arc::clone(&entered);
    let mut router = PathRouter::new();
    router.add_route(
        "/slow",
        handler_fn(move |_| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ProcessResult::text("late"))
            }
        }),
    );
    let runtime = GatewayBuilder::new()
        .with_pipeline(http_pipeline(
            "slow",
            HttpFrontendConnector::new("127.0.0.1:0").with_router(router),
        ))
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let addr = addr_of(&runtime, 0);
    let client = tokio::spawn(async move { reqwest::get(format!("http://{addr}/slow")).await });
    entered.notified().await;

    let started = std::time::Instant::now();
    let err = runtime.stop(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, GatewayError::ShutdownTimeout(_)), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!runtime.connectors()[0].is_running());
    client.abort();
}
