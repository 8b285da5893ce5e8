//! HTTP frontend connector on axum.
//!
//! axum only provides the listener: every request lands in a single
//! fallback handler that converts it into a kernel [`Request`] and hands it
//! to the connector's [`HttpDispatcher`]. Routing, middlewares and processor
//! dispatch all happen there, which keeps them testable without a socket.

use super::{FrontendConnector, FrontendKind, ListenerHandle, bind_address};
use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PipelineStages;
use crate::processor::catch_panic;
use crate::router::{PathRouter, RouterStatistics};
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use esgate_kernel::pipeline::{
    FrontendHandler, HttpMethod, Middleware, Payload, ProcessResult, ProcessorError, Request,
    ResponseWriter,
};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Response header carrying the request's correlation id.
pub const REQUEST_ID_HEADER: &str = "x-esgate-request-id";

// ─────────────────────────────────────────────────────────────────────────────
// HttpDispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Routing state of one HTTP connector: its router, middleware chain and the
/// runtime's statistics.
#[derive(Clone)]
pub struct HttpDispatcher {
    endpoint: String,
    router: PathRouter,
    middlewares: Vec<Arc<dyn Middleware>>,
    statistics: Option<Arc<RouterStatistics>>,
}

impl HttpDispatcher {
    pub fn router(&self) -> &PathRouter {
        &self.router
    }

    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Run `req` through the middleware chain, then the matched route (or
    /// the fallback) and its pipeline's processors.
    pub async fn dispatch(&self, mut req: Request) -> ResponseWriter {
        let mut w = ResponseWriter::new();
        w.set_header(REQUEST_ID_HEADER, req.id.clone());

        for middleware in &self.middlewares {
            middleware.handle(&req, &mut w).await;
            if w.is_committed() {
                debug!(
                    request_id = %req.id,
                    middleware = middleware.name(),
                    status = w.status(),
                    "middleware committed the response"
                );
                return w;
            }
        }

        let outcome = match self.router.find(&req) {
            Some(matched) => {
                if let Some(stats) = &self.statistics {
                    stats.add_matched(matched.route.pattern());
                }
                req.pattern = Some(matched.route.pattern().to_string());
                req.params = matched.params;
                let handler = Arc::clone(matched.route.handler());
                let stages = matched.route.stages().cloned();
                catch_panic(run_route(&req, handler, stages)).await
            }
            None => {
                if let Some(stats) = &self.statistics {
                    stats.add_unmatched(&req.path);
                }
                match self.router.fallback() {
                    Some(fallback) => catch_panic(fallback.handle(&req)).await,
                    None => {
                        debug!(request_id = %req.id, path = %req.path, "no route matched");
                        w.error(404, &format!("no handler for path '{}'", req.path));
                        return w;
                    }
                }
            }
        };

        match outcome {
            Ok(result) => write_result(&mut w, &req, result),
            Err(e) => {
                error!(
                    request_id = %req.id,
                    endpoint = %self.endpoint,
                    path = %req.path,
                    error = %e,
                    "request processing failed"
                );
                write_error(&mut w, &GatewayError::from(e));
            }
        }
        w
    }
}

async fn run_route(
    req: &Request,
    handler: Arc<dyn FrontendHandler>,
    stages: Option<Arc<PipelineStages>>,
) -> Result<ProcessResult, ProcessorError> {
    let result = handler.handle(req).await?;
    match stages {
        Some(stages) => stages.process(&req.id, result).await,
        None => Ok(result),
    }
}

fn write_result(w: &mut ResponseWriter, req: &Request, result: ProcessResult) {
    let Some(body) = result.payload.to_bytes() else {
        warn!(request_id = %req.id, "processor chain left the request unprocessed");
        write_error(
            w,
            &GatewayError::Internal("request was not processed by any backend".into()),
        );
        return;
    };
    if matches!(result.payload, Payload::Json(_) | Payload::Rows(_))
        && !result.headers.contains_key("content-type")
    {
        w.set_header("content-type", "application/json");
    }
    for (key, value) in result.headers {
        w.set_header(key, value);
    }
    w.write_header(result.status);
    w.write(&body);
}

fn write_error(w: &mut ResponseWriter, err: &GatewayError) {
    let (status, body) = err.to_reply();
    w.set_header("content-type", "application/json");
    w.write_header(status);
    w.write(&body);
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpFrontendConnector
// ─────────────────────────────────────────────────────────────────────────────

pub struct HttpFrontendConnector {
    dispatcher: Arc<HttpDispatcher>,
    running: Mutex<Option<ListenerHandle>>,
}

impl HttpFrontendConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            dispatcher: Arc::new(HttpDispatcher {
                endpoint: endpoint.into(),
                router: PathRouter::new(),
                middlewares: Vec::new(),
                statistics: None,
            }),
            running: Mutex::new(None),
        }
    }

    /// Append `router`'s routes; its fallback is adopted only if none is set.
    pub fn add_router(&mut self, router: PathRouter) -> &mut Self {
        Arc::make_mut(&mut self.dispatcher).router.append(router);
        self
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        Arc::make_mut(&mut self.dispatcher).middlewares.push(middleware);
        self
    }

    pub fn with_router(mut self, router: PathRouter) -> Self {
        self.add_router(router);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add_middleware(middleware);
        self
    }

    pub fn router(&self) -> &PathRouter {
        &self.dispatcher.router
    }

    pub fn dispatcher(&self) -> &Arc<HttpDispatcher> {
        &self.dispatcher
    }

    pub(crate) fn with_statistics(mut self, statistics: Arc<RouterStatistics>) -> Self {
        Arc::make_mut(&mut self.dispatcher).statistics = Some(statistics);
        self
    }

    pub(crate) fn bind_stages(&mut self, stages: &Arc<PipelineStages>) {
        Arc::make_mut(&mut self.dispatcher).router.bind_stages(stages);
    }

    pub(crate) fn absorb(&mut self, other: HttpFrontendConnector) {
        let other = Arc::unwrap_or_clone(other.dispatcher);
        let dispatcher = Arc::make_mut(&mut self.dispatcher);
        dispatcher.router.append(other.router);
        dispatcher.middlewares.extend(other.middlewares);
    }
}

#[async_trait]
impl FrontendConnector for HttpFrontendConnector {
    fn endpoint(&self) -> &str {
        &self.dispatcher.endpoint
    }

    fn kind(&self) -> FrontendKind {
        FrontendKind::Http
    }

    fn handler_count(&self) -> usize {
        self.dispatcher.router.handler_count()
    }

    fn middleware_count(&self) -> usize {
        self.dispatcher.middlewares.len()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|h| h.local_addr)
    }

    async fn listen(&self) -> GatewayResult<()> {
        let endpoint = self.endpoint().to_string();
        if self.running.lock().is_some() {
            return Err(GatewayError::AlreadyRunning(endpoint));
        }
        let bind_err = |source| GatewayError::Bind {
            endpoint: endpoint.clone(),
            source,
        };
        let listener = tokio::net::TcpListener::bind(bind_address(&endpoint))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        // a concurrent listen() may have won while we were binding
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(GatewayError::AlreadyRunning(endpoint));
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let app = Router::new()
            .fallback(serve_request)
            .with_state(Arc::clone(&self.dispatcher));
        let task_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = served {
                error!(endpoint = %task_endpoint, error = %e, "HTTP listener failed");
            }
        });

        info!(
            endpoint = %endpoint,
            local_addr = %local_addr,
            routes = self.handler_count(),
            middlewares = self.middleware_count(),
            "HTTP frontend listening"
        );
        *running = Some(ListenerHandle {
            token,
            task,
            local_addr,
        });
        Ok(())
    }

    async fn stop(&self, deadline: Duration) -> GatewayResult<()> {
        let handle = self
            .running
            .lock()
            .take()
            .ok_or_else(|| GatewayError::NotRunning(self.endpoint().to_string()))?;
        info!(endpoint = %self.endpoint(), "stopping HTTP frontend");
        handle.shutdown(self.endpoint(), deadline).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// axum glue
// ─────────────────────────────────────────────────────────────────────────────

async fn serve_request(
    State(dispatcher): State<Arc<HttpDispatcher>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(http_method) = HttpMethod::from_str_ci(method.as_str()) else {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({ "error": format!("method '{method}' is not supported") })),
        )
            .into_response();
    };

    let mut req = Request::new(Uuid::new_v4().to_string(), http_method, uri.path())
        .with_remote_addr(remote)
        .with_body(body.to_vec());
    if let Some(query) = uri.query() {
        req = req.with_query(query);
    }
    for (name, value) in &headers {
        if let Ok(v) = value.to_str() {
            req = req.with_header(name.as_str(), v);
        }
    }

    into_response(dispatcher.dispatch(req).await)
}

fn into_response(w: ResponseWriter) -> Response {
    let (status, headers, body) = w.into_parts();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (key, value) in headers {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!(header = %key, "dropping invalid response header"),
        }
    }
    response
}
