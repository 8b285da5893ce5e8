//! Pipelines: named bundles of frontend connectors, processors and backends.
//!
//! A [`PipelineBuilder`] collects declarations. [`GatewayBuilder::build`]
//! turns every builder into a [`Pipeline`] whose connectors are the shared,
//! canonical instances of the built runtime.
//!
//! [`GatewayBuilder::build`]: crate::runtime::GatewayBuilder::build

use crate::frontend::{FrontendConnector, FrontendDeclaration};
use crate::processor::{ProcessorChain, ProcessorNode};
use esgate_kernel::pipeline::{
    BackendConnector, Payload, ProcessResult, ProcessorContext, ProcessorError, keys,
};
use std::collections::HashMap;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// PipelineStages
// ─────────────────────────────────────────────────────────────────────────────

/// The request-time part of a pipeline: its processor chain and backends.
///
/// Every route a pipeline declares is bound to that pipeline's stages, so a
/// merged connector still runs each request through the processors of the
/// pipeline that registered the matched route.
pub struct PipelineStages {
    name: String,
    processors: ProcessorChain,
    backends: Vec<Arc<dyn BackendConnector>>,
}

impl PipelineStages {
    pub(crate) fn new(
        name: String,
        processors: ProcessorChain,
        backends: Vec<Arc<dyn BackendConnector>>,
    ) -> Self {
        Self {
            name,
            processors,
            backends,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processors(&self) -> &ProcessorChain {
        &self.processors
    }

    pub fn backends(&self) -> &[Arc<dyn BackendConnector>] {
        &self.backends
    }

    /// Run a handler result through the processor chain.
    ///
    /// Several outputs are concatenated into one byte payload. A
    /// `status` entry left in the metadata overrides the handler's status;
    /// `response_headers` entries are added unless the handler set them.
    pub async fn process(
        &self,
        request_id: &str,
        result: ProcessResult,
    ) -> Result<ProcessResult, ProcessorError> {
        if self.processors.is_empty() {
            return Ok(result);
        }
        let ProcessResult {
            mut metadata,
            payload,
            status,
            mut headers,
        } = result;
        if !metadata.contains(keys::REQUEST_ID) {
            metadata.set(keys::REQUEST_ID, &request_id);
        }

        let ctx = ProcessorContext::new(request_id, &self.backends);
        let outputs = self.processors.dispatch(&ctx, &mut metadata, payload).await?;
        let payload = merge_outputs(outputs)?;
        let status = metadata.get::<u16>(keys::STATUS).unwrap_or(status);
        if let Some(relayed) = metadata.get::<HashMap<String, String>>(keys::RESPONSE_HEADERS) {
            for (name, value) in relayed {
                headers.entry(name).or_insert(value);
            }
        }

        Ok(ProcessResult {
            metadata,
            payload,
            status,
            headers,
        })
    }
}

fn merge_outputs(mut outputs: Vec<Payload>) -> Result<Payload, ProcessorError> {
    if outputs.len() == 1 {
        return Ok(outputs.remove(0));
    }
    let mut merged = Vec::new();
    for output in outputs {
        let bytes = output
            .to_bytes()
            .ok_or_else(|| ProcessorError::Handler("invalid message type: unprocessed request".into()))?;
        merged.extend(bytes);
    }
    Ok(Payload::Bytes(merged))
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Declarations of one pipeline, consumed by the gateway builder.
pub struct PipelineBuilder {
    pub(crate) name: String,
    pub(crate) frontends: Vec<FrontendDeclaration>,
    pub(crate) processors: Vec<ProcessorNode>,
    pub(crate) backends: Vec<Arc<dyn BackendConnector>>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frontends: Vec::new(),
            processors: Vec::new(),
            backends: Vec::new(),
        }
    }

    pub fn add_frontend_connector(&mut self, connector: impl Into<FrontendDeclaration>) -> &mut Self {
        self.frontends.push(connector.into());
        self
    }

    /// Append a root to the processor chain.
    pub fn add_processor(&mut self, processor: impl Into<ProcessorNode>) -> &mut Self {
        self.processors.push(processor.into());
        self
    }

    pub fn add_backend_connector(&mut self, backend: Arc<dyn BackendConnector>) -> &mut Self {
        self.backends.push(backend);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// A built pipeline. Its connector slots reference the runtime's canonical
/// connectors, so two slots at one address hold the same object.
pub struct Pipeline {
    frontends: Vec<Arc<dyn FrontendConnector>>,
    stages: Arc<PipelineStages>,
}

impl Pipeline {
    pub(crate) fn new(frontends: Vec<Arc<dyn FrontendConnector>>, stages: Arc<PipelineStages>) -> Self {
        Self { frontends, stages }
    }

    pub fn name(&self) -> &str {
        self.stages.name()
    }

    pub fn frontend_connectors(&self) -> &[Arc<dyn FrontendConnector>] {
        &self.frontends
    }

    pub fn processors(&self) -> &ProcessorChain {
        self.stages.processors()
    }

    pub fn backend_connectors(&self) -> &[Arc<dyn BackendConnector>] {
        self.stages.backends()
    }

    pub fn stages(&self) -> &Arc<PipelineStages> {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::AbTestProcessor;
    use esgate_kernel::ab_testing::{AbResult, ResultSender};
    use esgate_kernel::pipeline::Metadata;
    use async_trait::async_trait;

    struct Discard;

    #[async_trait]
    impl ResultSender for Discard {
        async fn send(&self, _result: AbResult) {}

        fn is_enabled(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn empty_stages_return_handler_result() {
        let stages = PipelineStages::new("p".into(), ProcessorChain::default(), Vec::new());
        let out = stages
            .process("r", ProcessResult::text("bulk\n").with_status(201))
            .await
            .unwrap();
        assert_eq!(out.payload, Payload::text("bulk\n"));
        assert_eq!(out.status, 201);
    }

    #[test]
    fn unprocessed_request_payloads_cannot_be_merged() {
        let req = esgate_kernel::pipeline::Request::new(
            "r",
            esgate_kernel::pipeline::HttpMethod::Get,
            "/",
        );
        let err = merge_outputs(vec![
            Payload::text("a"),
            Payload::Request(Box::new(req)),
        ])
        .unwrap_err();
        assert!(matches!(err, ProcessorError::Handler(_)));
    }

    #[tokio::test]
    async fn processor_errors_propagate_out_of_stages() {
        let chain = ProcessorChain::new(vec![ProcessorNode::new(AbTestProcessor::new(
            "ab",
            Arc::new(Discard),
        ))]);
        let stages = PipelineStages::new("p".into(), chain, Vec::new());
        // a single input is rejected by the comparator
        let err = stages
            .process("req-7", ProcessResult::new(Metadata::new(), Payload::text("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
    }
}
