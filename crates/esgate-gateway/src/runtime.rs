//! Gateway builder and runtime.
//!
//! [`GatewayBuilder::build`] walks every pipeline's frontend declarations in
//! declaration order and keeps one canonical connector per listen address.
//! Later declarations at a known address are folded into the canonical one
//! and never instantiated, so every pipeline slot at that address refers to
//! the same object:
//!
//! ```text
//!  declarations                      registry                 canonical
//!  ─────────────                     ────────                 ─────────
//!  ingest:  HTTP :9200 /_bulk   ──►  ":9200" → 0  ──────────►  [0] HTTP :9200
//!  query:   HTTP :9200 /_search ──►  absorb into 0              /_bulk, /_search
//!  raw:     TCP  :9300          ──►  ":9300" → 1  ──────────►  [1] TCP  :9300
//! ```
//!
//! The [`Runtime`] starts and stops each canonical connector exactly once and
//! closes each distinct backend exactly once.

use crate::error::{GatewayError, GatewayResult};
use crate::frontend::{FrontendConnector, FrontendDeclaration};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStages};
use crate::processor::ProcessorChain;
use crate::router::RouterStatistics;
use esgate_kernel::pipeline::{BackendConnector, PipelineError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Deadline used to roll back listeners when a later one fails to bind.
const ROLLBACK_DEADLINE: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// GatewayBuilder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct GatewayBuilder {
    pipelines: Vec<PipelineBuilder>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pipeline(&mut self, pipeline: PipelineBuilder) -> &mut Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineBuilder) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Merge connector declarations and produce a runnable [`Runtime`].
    pub fn build(self) -> Result<Runtime, PipelineError> {
        if self.pipelines.is_empty() {
            return Err(PipelineError::NoPipelines);
        }

        let statistics = Arc::new(RouterStatistics::new());
        let mut declarations: Vec<FrontendDeclaration> = Vec::new();
        let mut registry: HashMap<String, usize> = HashMap::new();
        let mut layouts: Vec<(Arc<PipelineStages>, Vec<usize>)> = Vec::new();
        let mut backends: Vec<Arc<dyn BackendConnector>> = Vec::new();

        for builder in self.pipelines {
            let PipelineBuilder {
                name,
                frontends,
                processors,
                backends: pipeline_backends,
            } = builder;
            if name.trim().is_empty() {
                return Err(PipelineError::EmptyPipelineName);
            }

            let mut chain = ProcessorChain::new(processors);
            chain.init()?;
            for backend in &pipeline_backends {
                if !backends.iter().any(|known| same_backend(known, backend)) {
                    backends.push(Arc::clone(backend));
                }
            }
            let stages = Arc::new(PipelineStages::new(name.clone(), chain, pipeline_backends));

            let mut slots = Vec::with_capacity(frontends.len());
            for mut declaration in frontends {
                declaration.validate(&name)?;
                declaration.bind_stages(&stages);

                let existing = registry.get(declaration.endpoint()).copied();
                let slot = match existing {
                    Some(index) => {
                        debug!(
                            pipeline = %name,
                            endpoint = %declaration.endpoint(),
                            "merging connector into canonical instance"
                        );
                        declarations[index].absorb(declaration)?;
                        index
                    }
                    None => {
                        let index = declarations.len();
                        registry.insert(declaration.endpoint().to_string(), index);
                        declarations.push(declaration);
                        index
                    }
                };
                slots.push(slot);
            }
            layouts.push((stages, slots));
        }

        let connectors: Vec<Arc<dyn FrontendConnector>> = declarations
            .into_iter()
            .map(|declaration| declaration.into_connector(&statistics))
            .collect();
        let pipelines = layouts
            .into_iter()
            .map(|(stages, slots)| {
                let frontends = slots
                    .iter()
                    .map(|&slot| Arc::clone(&connectors[slot]))
                    .collect();
                Pipeline::new(frontends, stages)
            })
            .collect::<Vec<_>>();

        info!(
            pipelines = pipelines.len(),
            connectors = connectors.len(),
            backends = backends.len(),
            "gateway runtime built"
        );
        Ok(Runtime {
            pipelines,
            connectors,
            backends,
            statistics,
            backends_closed: AtomicBool::new(false),
        })
    }
}

fn same_backend(a: &Arc<dyn BackendConnector>, b: &Arc<dyn BackendConnector>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

pub struct Runtime {
    pipelines: Vec<Pipeline>,
    connectors: Vec<Arc<dyn FrontendConnector>>,
    backends: Vec<Arc<dyn BackendConnector>>,
    statistics: Arc<RouterStatistics>,
    backends_closed: AtomicBool,
}

impl Runtime {
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name() == name)
    }

    /// Canonical connectors, one per listen address, in first-seen order.
    pub fn connectors(&self) -> &[Arc<dyn FrontendConnector>] {
        &self.connectors
    }

    pub fn connector(&self, endpoint: &str) -> Option<&Arc<dyn FrontendConnector>> {
        self.connectors.iter().find(|c| c.endpoint() == endpoint)
    }

    /// Distinct backends across all pipelines.
    pub fn backends(&self) -> &[Arc<dyn BackendConnector>] {
        &self.backends
    }

    pub fn statistics(&self) -> &Arc<RouterStatistics> {
        &self.statistics
    }

    /// Start every canonical connector. If one fails to bind, the ones
    /// already started are stopped again and the error is returned.
    pub async fn start(&self) -> GatewayResult<()> {
        for (i, connector) in self.connectors.iter().enumerate() {
            if let Err(e) = connector.listen().await {
                error!(endpoint = %connector.endpoint(), error = %e, "failed to start connector");
                for started in &self.connectors[..i] {
                    if let Err(stop_err) = started.stop(ROLLBACK_DEADLINE).await {
                        warn!(endpoint = %started.endpoint(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e);
            }
            info!(
                endpoint = %connector.endpoint(),
                kind = %connector.kind(),
                addr = ?connector.local_addr(),
                handlers = connector.handler_count(),
                "connector listening"
            );
        }
        Ok(())
    }

    /// Stop every running connector, sharing one `deadline` across all of
    /// them, then close every backend. Returns the first failure.
    pub async fn stop(&self, deadline: Duration) -> GatewayResult<()> {
        let until = Instant::now() + deadline;
        let mut first_error: Option<GatewayError> = None;

        for connector in &self.connectors {
            if !connector.is_running() {
                continue;
            }
            let remaining = until.saturating_duration_since(Instant::now());
            match connector.stop(remaining).await {
                Ok(()) => info!(endpoint = %connector.endpoint(), "connector stopped"),
                Err(e) => {
                    warn!(endpoint = %connector.endpoint(), error = %e, "connector stop failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !self.backends_closed.swap(true, Ordering::AcqRel) {
            for backend in &self.backends {
                backend.close().await;
                debug!(backend = %backend.endpoint(), "backend closed");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
