//! `esgate-gateway`: runtime for the esgate protocol gateway.
//!
//! This crate provides the concrete implementations of the contracts defined
//! in `esgate-kernel`:
//!
//! | Kernel contract | Implementation |
//! |-----------------|----------------|
//! | frontend handler | [`handler::RequestHandler`], [`handler::ElasticsearchFallback`] |
//! | [`Middleware`](esgate_kernel::pipeline::Middleware) | [`middleware::ApiKeyMiddleware`], [`middleware::RateLimitMiddleware`], [`middleware::AccessLogMiddleware`] |
//! | [`Processor`](esgate_kernel::pipeline::Processor) | [`processor::BackendForwardProcessor`], [`processor::AbTestProcessor`], [`processor::FanOutProcessor`], [`processor::SqlQueryProcessor`] |
//! | [`BackendConnector`](esgate_kernel::pipeline::BackendConnector) | [`backend::ElasticsearchBackend`], [`backend::ClickHouseBackend`] |
//! | [`ResultSender`](esgate_kernel::ab_testing::ResultSender) | [`ab_testing::DispatchingSender`], [`ab_testing::NoopSender`] |
//! | [`Collector`](esgate_kernel::ab_testing::Collector) | [`ab_testing::InMemoryCollector`] |
//!
//! [`runtime::GatewayBuilder`] merges the pipelines' connector declarations
//! and produces a [`runtime::Runtime`] that owns listener lifecycles.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use esgate_gateway::frontend::HttpFrontendConnector;
//! use esgate_gateway::pipeline::PipelineBuilder;
//! use esgate_gateway::router::PathRouter;
//! use esgate_gateway::runtime::GatewayBuilder;
//! use esgate_kernel::pipeline::{ProcessResult, handler_fn};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = PathRouter::new();
//!     router.add_route("/_bulk", handler_fn(|_| async { Ok(ProcessResult::text("bulk\n")) }));
//!
//!     let mut ingest = PipelineBuilder::new("ingest");
//!     ingest.add_frontend_connector(HttpFrontendConnector::new(":9200").with_router(router));
//!
//!     let runtime = GatewayBuilder::new().with_pipeline(ingest).build().unwrap();
//!     runtime.start().await.unwrap();
//!     tokio::signal::ctrl_c().await.unwrap();
//!     runtime.stop(Duration::from_secs(5)).await.unwrap();
//! }
//! ```

pub mod ab_testing;
pub mod app;
pub mod backend;
pub mod error;
pub mod frontend;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod processor;
pub mod router;
pub mod runtime;

pub use error::{GatewayError, GatewayResult};
pub use runtime::{GatewayBuilder, Runtime};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` directives are honoured
/// on top of the `esgate_gateway=info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("esgate_gateway=info,esgate_kernel=info"));
    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
