//! Wiring of the gateway binary: backends, pipelines and A/B testing, all
//! derived from one [`GatewayConfig`].
//!
//! Every pipeline listens on `config.listen`, so the runtime merges them into
//! a single HTTP connector:
//!
//! | Pipeline | Routes | Processors |
//! |----------|--------|------------|
//! | `ingest` | `/_bulk`, `/:index/_bulk`, `/:index/_doc` | forward to Elasticsearch |
//! | `ab-query` | `/<index>/_search` per A/B-tested index | fan out to primary + shadow, compare |
//! | `query` | `/_search`, `/:index/_search`, `/:index/_count` | forward to Elasticsearch |
//! | `sql` | `POST /_sql` | ClickHouse query |
//!
//! `ab-query` is only built when a shadow cluster is configured and at least
//! one index has A/B testing on; `sql` only with a ClickHouse backend. Paths
//! no route claims are relayed to Elasticsearch by the fallback handler.

use crate::ab_testing::{DocumentSink, InMemoryCollectorFactory, SenderCoordinator, TracingSink};
use crate::backend::{ClickHouseBackend, ElasticsearchBackend};
use crate::error::GatewayResult;
use crate::frontend::HttpFrontendConnector;
use crate::handler::{ElasticsearchFallback, RequestHandler};
use crate::middleware::{AccessLogMiddleware, ApiKeyMiddleware, RateLimitMiddleware};
use crate::pipeline::PipelineBuilder;
use crate::processor::{AbTestProcessor, BackendForwardProcessor, FanOutProcessor, ProcessorNode, SqlQueryProcessor};
use crate::router::PathRouter;
use crate::runtime::{GatewayBuilder, Runtime};
use esgate_kernel::ab_testing::ResultSender;
use esgate_kernel::config::GatewayConfig;
use esgate_kernel::pipeline::{BackendConnector, HttpMethod, matcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PRIMARY_LABEL: &str = "elastic";
const SHADOW_LABEL: &str = "shadow";

/// A fully assembled gateway, not yet started.
pub struct Gateway {
    pub runtime: Runtime,
    pub coordinator: SenderCoordinator,
    /// Present when rate limiting is configured; its state needs periodic
    /// [`cleanup`](RateLimitMiddleware::cleanup).
    pub rate_limiter: Option<Arc<RateLimitMiddleware>>,
}

impl Gateway {
    /// Start A/B dispatch, then every listener.
    pub async fn start(&self) -> GatewayResult<()> {
        self.coordinator.start();
        self.runtime.start().await
    }

    /// Stop listeners and backends, then A/B dispatch.
    pub async fn stop(&self, deadline: Duration) -> GatewayResult<()> {
        let result = self.runtime.stop(deadline).await;
        self.coordinator.stop(deadline).await;
        result
    }
}

pub fn assemble(config: &GatewayConfig) -> GatewayResult<Gateway> {
    let elastic: Arc<dyn BackendConnector> = Arc::new(ElasticsearchBackend::new(&config.elasticsearch)?);

    let factory = InMemoryCollectorFactory::new(config.ab_testing.clone())
        .with_sink(Arc::new(TracingSink))
        .with_sink(Arc::new(DocumentSink::new(
            Arc::clone(&elastic),
            config.ab_testing.results_index.clone(),
        )));
    let coordinator = SenderCoordinator::new(config, Arc::new(factory));

    let rate_limiter = config
        .rate_limit
        .as_ref()
        .map(|rl| Arc::new(RateLimitMiddleware::from_config(rl)));

    let mut builder = GatewayBuilder::new();
    builder.add_pipeline(ingest_pipeline(config, &elastic, rate_limiter.clone()));

    match &config.shadow_elasticsearch {
        Some(shadow) if config.ab_testing_enabled() => {
            let shadow: Arc<dyn BackendConnector> = Arc::new(ElasticsearchBackend::new(shadow)?);
            builder.add_pipeline(ab_query_pipeline(config, &elastic, &shadow, coordinator.get_sender()));
        }
        None if config.ab_testing_enabled() => {
            warn!("A/B testing enabled for some indexes but no shadow_elasticsearch configured, A/B dispatch disabled");
        }
        _ => {}
    }

    builder.add_pipeline(query_pipeline(config, &elastic));

    if let Some(clickhouse) = &config.clickhouse {
        let clickhouse: Arc<dyn BackendConnector> = Arc::new(ClickHouseBackend::new(clickhouse)?);
        builder.add_pipeline(sql_pipeline(config, clickhouse));
    }

    let runtime = builder.build()?;
    info!(
        listen = %config.listen,
        pipelines = runtime.pipelines().len(),
        ab_testing = coordinator.is_enabled(),
        "gateway assembled"
    );
    Ok(Gateway {
        runtime,
        coordinator,
        rate_limiter,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipelines
// ─────────────────────────────────────────────────────────────────────────────

/// The first connector declared at `config.listen`. Middlewares and the
/// fallback live here; later declarations at the same address are merged
/// into it and declare routes only.
fn ingest_pipeline(
    config: &GatewayConfig,
    elastic: &Arc<dyn BackendConnector>,
    rate_limiter: Option<Arc<RateLimitMiddleware>>,
) -> PipelineBuilder {
    let mut router = PathRouter::new();
    let writes = matcher::is_http_method([HttpMethod::Post, HttpMethod::Put]);
    router
        .register("/_bulk", Arc::clone(&writes), RequestHandler::shared())
        .register("/:index/_bulk", Arc::clone(&writes), RequestHandler::shared())
        .register("/:index/_doc", writes, RequestHandler::shared())
        .add_fallback_handler(Arc::new(ElasticsearchFallback::new(Arc::clone(elastic))));

    let mut connector = HttpFrontendConnector::new(config.listen.as_str())
        .with_router(router)
        .with_middleware(Arc::new(AccessLogMiddleware::new()));
    if let Some(rate_limiter) = rate_limiter {
        connector.add_middleware(rate_limiter);
    }
    if !config.disable_auth {
        connector.add_middleware(Arc::new(ApiKeyMiddleware::new(config.api_keys.iter().cloned())));
    }

    let mut pipeline = PipelineBuilder::new("ingest");
    pipeline
        .add_frontend_connector(connector)
        .add_processor(BackendForwardProcessor::new("ingest-forward"))
        .add_backend_connector(Arc::clone(elastic));
    pipeline
}

fn ab_query_pipeline(
    config: &GatewayConfig,
    elastic: &Arc<dyn BackendConnector>,
    shadow: &Arc<dyn BackendConnector>,
    sender: Arc<dyn ResultSender>,
) -> PipelineBuilder {
    let mut indexes: Vec<&String> = config
        .indexes
        .iter()
        .filter(|(_, index)| index.ab_testing)
        .map(|(name, _)| name)
        .collect();
    indexes.sort();

    let mut router = PathRouter::new();
    for index in indexes {
        router.add_route(&format!("/{index}/_search"), RequestHandler::shared());
    }

    let fan_out = ProcessorNode::new(FanOutProcessor::new("ab-fan-out"))
        .with_child(
            BackendForwardProcessor::new("ab-primary")
                .with_endpoint(elastic.endpoint())
                .with_label(PRIMARY_LABEL),
        )
        .with_child(
            BackendForwardProcessor::new("ab-shadow")
                .with_endpoint(shadow.endpoint())
                .with_label(SHADOW_LABEL)
                .tolerate_errors(),
        );

    let mut pipeline = PipelineBuilder::new("ab-query");
    pipeline
        .add_frontend_connector(HttpFrontendConnector::new(config.listen.as_str()).with_router(router))
        .add_processor(fan_out)
        .add_processor(
            AbTestProcessor::new("ab-compare", sender)
                .with_names(PRIMARY_LABEL, SHADOW_LABEL)
                .relay_a(),
        )
        .add_backend_connector(Arc::clone(elastic))
        .add_backend_connector(Arc::clone(shadow));
    pipeline
}

fn query_pipeline(config: &GatewayConfig, elastic: &Arc<dyn BackendConnector>) -> PipelineBuilder {
    let mut router = PathRouter::new();
    router
        .add_route("/_search", RequestHandler::shared())
        .add_route("/:index/_search", RequestHandler::shared())
        .add_route("/:index/_count", RequestHandler::shared());

    let mut pipeline = PipelineBuilder::new("query");
    pipeline
        .add_frontend_connector(HttpFrontendConnector::new(config.listen.as_str()).with_router(router))
        .add_processor(BackendForwardProcessor::new("query-forward"))
        .add_backend_connector(Arc::clone(elastic));
    pipeline
}

fn sql_pipeline(config: &GatewayConfig, clickhouse: Arc<dyn BackendConnector>) -> PipelineBuilder {
    let mut router = PathRouter::new();
    router.register(
        "/_sql",
        matcher::is_http_method([HttpMethod::Post]),
        RequestHandler::shared(),
    );

    let mut pipeline = PipelineBuilder::new("sql");
    pipeline
        .add_frontend_connector(HttpFrontendConnector::new(config.listen.as_str()).with_router(router))
        .add_processor(SqlQueryProcessor::new("sql-query"))
        .add_backend_connector(clickhouse);
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use esgate_kernel::config::{BackendEndpointConfig, IndexConfig};

    fn config() -> GatewayConfig {
        GatewayConfig::new("http://127.0.0.1:9")
            .with_listen("127.0.0.1:0")
            .with_index("logs", IndexConfig { ab_testing: true })
    }

    #[test]
    fn all_pipelines_share_one_connector() {
        let mut cfg = config();
        cfg.shadow_elasticsearch = Some(BackendEndpointConfig::new("http://127.0.0.1:10"));
        cfg.clickhouse = Some(BackendEndpointConfig::new("http://127.0.0.1:11"));

        let gateway = assemble(&cfg).unwrap();
        let runtime = &gateway.runtime;
        let names: Vec<_> = runtime.pipelines().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["ingest", "ab-query", "query", "sql"]);
        assert_eq!(runtime.connectors().len(), 1);
        // 3 ingest + 1 A/B + 3 query + 1 sql
        assert_eq!(runtime.connectors()[0].handler_count(), 8);
        assert_eq!(runtime.connectors()[0].middleware_count(), 1);
        assert_eq!(runtime.backends().len(), 3);
        assert!(gateway.coordinator.is_enabled());
    }

    #[test]
    fn no_shadow_means_no_ab_pipeline() {
        let gateway = assemble(&config().with_api_keys(["k1"])).unwrap();
        let names: Vec<_> = gateway.runtime.pipelines().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["ingest", "query"]);
        // access log + api key
        assert_eq!(gateway.runtime.connectors()[0].middleware_count(), 2);
    }

    #[tokio::test]
    async fn ab_index_without_shadow_disables_dispatch() {
        let cfg = config();
        assert!(cfg.ab_testing_enabled());

        let gateway = assemble(&cfg).unwrap();
        assert!(!gateway.coordinator.is_enabled());
        assert!(!gateway.coordinator.get_sender().is_enabled());

        // nothing to spawn: stopping right away must not wait on any loop
        gateway.coordinator.start();
        gateway.coordinator.stop(Duration::from_millis(50)).await;
        assert!(gateway.coordinator.is_stopped());
    }
}
