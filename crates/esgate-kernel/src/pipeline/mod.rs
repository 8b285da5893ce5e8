//! Pipeline kernel contract.
//!
//! Trait interfaces and data types for the esgate pipeline runtime. No
//! concrete connectors, routers or processors live here; those belong to
//! `esgate-gateway`.
//!
//! # Architecture mapping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              esgate-kernel  (this module)                   │
//! │  Middleware trait       FrontendHandler trait               │
//! │  Processor trait        BackendConnector trait              │
//! │  RequestMatcher         Request / Metadata / Payload        │
//! │  PipelineError / ProcessorError / BackendError              │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │  depends on
//! ┌──────────────────────────▼──────────────────────────────────┐
//! │              esgate-gateway  (runtime crate)                │
//! │  PathRouter, HTTP / TCP frontend connectors                 │
//! │  ProcessorNode tree, AbTestProcessor                        │
//! │  Elasticsearch / ClickHouse backends                        │
//! │  GatewayBuilder ──► Runtime (connector merge, start/stop)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod error;
pub mod handler;
pub mod matcher;
pub mod middleware;
pub mod processor;
pub mod types;

// ── Flat re-exports ────────────────────────────────────────────────────────

pub use backend::{
    BackendConnector, BackendConnectorKind, BackendResponse, DocumentBackend, SqlBackend,
};
pub use error::{BackendError, PipelineError, ProcessorError};
pub use handler::{FrontendHandler, handler_fn};
pub use matcher::RequestMatcher;
pub use middleware::{Middleware, ResponseWriter};
pub use processor::{Processor, ProcessorContext};
pub use types::{HttpMethod, Metadata, Payload, ProcessResult, Request, keys};
