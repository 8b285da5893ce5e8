//! Processor contract.
//!
//! Processors are composed into trees by the runtime. Each node's
//! [`Processor::handle`] receives the outputs of the previous step and returns
//! one payload; children then run against that payload.

use super::backend::{BackendConnector, BackendConnectorKind, DocumentBackend, SqlBackend};
use super::error::ProcessorError;
use super::types::{Metadata, Payload};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-request view of the pipeline a processor runs in.
pub struct ProcessorContext<'a> {
    pub request_id: &'a str,
    /// Backend connectors attached to the pipeline, in declaration order.
    pub backends: &'a [Arc<dyn BackendConnector>],
}

impl<'a> ProcessorContext<'a> {
    pub fn new(request_id: &'a str, backends: &'a [Arc<dyn BackendConnector>]) -> Self {
        Self {
            request_id,
            backends,
        }
    }

    /// First backend of `kind`.
    pub fn backend(&self, kind: BackendConnectorKind) -> Option<&Arc<dyn BackendConnector>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    /// Document backend whose endpoint equals `endpoint`, or the first one when
    /// `endpoint` is `None`.
    pub fn document_backend(&self, endpoint: Option<&str>) -> Option<&dyn DocumentBackend> {
        self.backends
            .iter()
            .filter(|b| endpoint.is_none_or(|e| b.endpoint() == e))
            .find_map(|b| b.as_document())
    }

    pub fn sql_backend(&self) -> Option<&dyn SqlBackend> {
        self.backends.iter().find_map(|b| b.as_sql())
    }
}

/// One transformation step of a pipeline.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Stable identifier used in logs and verdict messages.
    fn id(&self) -> &str;

    /// Backend kinds this processor knows how to talk to. Informational only:
    /// the builder never rejects a pairing, the processor fails the request.
    fn supported_backend_kinds(&self) -> &[BackendConnectorKind] {
        &[]
    }

    /// Called once while the runtime is built.
    fn init(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &ProcessorContext<'_>,
        metadata: &mut Metadata,
        inputs: Vec<Payload>,
    ) -> Result<Payload, ProcessorError>;
}
