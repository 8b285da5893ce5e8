//! Frontend connectors: the physical listeners of a runtime.
//!
//! Pipelines declare connectors as [`FrontendDeclaration`]s. While the
//! runtime is built, every declaration at an already-seen listen address is
//! folded into the first one (its routes and middlewares are appended), and
//! only the surviving declarations are turned into running connectors:
//!
//! ```text
//!  pipeline "ingest"  ──► HTTP ":9200" (/_bulk)   ─┐
//!                                                   ├─► one HTTP connector
//!  pipeline "query"   ──► HTTP ":9200" (/_search) ─┘    with both routes
//!
//!  pipeline "raw"     ──► TCP  ":9300"            ───► TCP connector
//! ```
//!
//! | Variant | Type | Request unit |
//! |---------|------|--------------|
//! | HTTP | [`HttpFrontendConnector`] | one HTTP request |
//! | TCP  | [`TcpFrontendConnector`] | defined by its [`ConnectionHandler`] |

mod http;
mod tcp;

pub use http::{HttpDispatcher, HttpFrontendConnector, REQUEST_ID_HEADER};
pub use tcp::{ConnectionHandler, LineConnectionHandler, TcpFrontendConnector};

use crate::error::{GatewayError, GatewayResult};
use crate::pipeline::PipelineStages;
use crate::router::RouterStatistics;
use async_trait::async_trait;
use esgate_kernel::pipeline::PipelineError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// FrontendConnector trait
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontendKind {
    Http,
    Tcp,
}

impl FrontendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrontendKind::Http => "http",
            FrontendKind::Tcp => "tcp",
        }
    }
}

impl fmt::Display for FrontendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical, runnable listener.
///
/// Instances are only created by the runtime builder, so there is at most
/// one per listen address.
#[async_trait]
pub trait FrontendConnector: Send + Sync {
    /// Listen address as declared, e.g. `":9200"` or `"127.0.0.1:0"`.
    fn endpoint(&self) -> &str;

    fn kind(&self) -> FrontendKind;

    /// Number of registered route handlers (fallbacks are not counted).
    fn handler_count(&self) -> usize;

    fn middleware_count(&self) -> usize;

    /// Address actually bound, once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Bind and start serving in the background.
    async fn listen(&self) -> GatewayResult<()>;

    /// Stop accepting, then wait up to `deadline` for in-flight work.
    async fn stop(&self, deadline: Duration) -> GatewayResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

/// A connector as declared by a pipeline, before merging.
pub enum FrontendDeclaration {
    Http(HttpFrontendConnector),
    Tcp(TcpFrontendConnector),
}

impl From<HttpFrontendConnector> for FrontendDeclaration {
    fn from(c: HttpFrontendConnector) -> Self {
        FrontendDeclaration::Http(c)
    }
}

impl From<TcpFrontendConnector> for FrontendDeclaration {
    fn from(c: TcpFrontendConnector) -> Self {
        FrontendDeclaration::Tcp(c)
    }
}

impl FrontendDeclaration {
    pub fn endpoint(&self) -> &str {
        match self {
            FrontendDeclaration::Http(c) => c.endpoint(),
            FrontendDeclaration::Tcp(c) => c.endpoint(),
        }
    }

    pub fn kind(&self) -> FrontendKind {
        match self {
            FrontendDeclaration::Http(_) => FrontendKind::Http,
            FrontendDeclaration::Tcp(_) => FrontendKind::Tcp,
        }
    }

    pub(crate) fn validate(&self, pipeline: &str) -> Result<(), PipelineError> {
        if self.endpoint().is_empty() {
            return Err(PipelineError::EmptyEndpoint(pipeline.to_string()));
        }
        match self {
            FrontendDeclaration::Http(c) => c.router().validate(),
            FrontendDeclaration::Tcp(_) => Ok(()),
        }
    }

    /// Bind the declaring pipeline's stages to everything this declaration
    /// registered so far.
    pub(crate) fn bind_stages(&mut self, stages: &Arc<PipelineStages>) {
        match self {
            FrontendDeclaration::Http(c) => c.bind_stages(stages),
            FrontendDeclaration::Tcp(c) => c.bind_stages(stages),
        }
    }

    /// Fold a later declaration at the same address into this one.
    pub(crate) fn absorb(&mut self, other: FrontendDeclaration) -> Result<(), PipelineError> {
        match (self, other) {
            (FrontendDeclaration::Http(canonical), FrontendDeclaration::Http(other)) => {
                canonical.absorb(other);
                Ok(())
            }
            (FrontendDeclaration::Tcp(canonical), FrontendDeclaration::Tcp(_)) => {
                warn!(
                    endpoint = %canonical.endpoint(),
                    "duplicate TCP declaration, keeping the first connection handler"
                );
                Ok(())
            }
            (canonical, other) => Err(PipelineError::ConnectorKindConflict {
                endpoint: canonical.endpoint().to_string(),
                first: canonical.kind().as_str(),
                second: other.kind().as_str(),
            }),
        }
    }

    pub(crate) fn into_connector(
        self,
        statistics: &Arc<RouterStatistics>,
    ) -> Arc<dyn FrontendConnector> {
        match self {
            FrontendDeclaration::Http(c) => Arc::new(c.with_statistics(Arc::clone(statistics))),
            FrontendDeclaration::Tcp(c) => Arc::new(c),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener bookkeeping shared by both variants
// ─────────────────────────────────────────────────────────────────────────────

/// `":9200"` binds every interface; anything else is used verbatim.
pub(crate) fn bind_address(endpoint: &str) -> String {
    if endpoint.starts_with(':') {
        format!("0.0.0.0{endpoint}")
    } else {
        endpoint.to_string()
    }
}

pub(crate) struct ListenerHandle {
    pub(crate) token: CancellationToken,
    pub(crate) task: JoinHandle<()>,
    pub(crate) local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Cancel the accept loop and wait for it to drain. Past `deadline` the
    /// loop is aborted and its in-flight work abandoned.
    pub(crate) async fn shutdown(self, endpoint: &str, deadline: Duration) -> GatewayResult<()> {
        self.token.cancel();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(deadline, self.task).await {
            Ok(Ok(())) => {
                debug!(endpoint, "listener drained");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(endpoint, error = %e, "listener task ended abnormally");
                Ok(())
            }
            Err(_) => {
                abort.abort();
                warn!(
                    endpoint,
                    deadline_ms = deadline.as_millis() as u64,
                    "listener did not drain in time, abandoning in-flight requests"
                );
                Err(GatewayError::ShutdownTimeout(endpoint.to_string()))
            }
        }
    }
}
