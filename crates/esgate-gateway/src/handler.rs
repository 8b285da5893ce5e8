//! Built-in frontend handlers.

use esgate_kernel::pipeline::{
    BackendConnector, FrontendHandler, Metadata, Payload, ProcessResult, ProcessorError, Request,
    keys,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Header Elasticsearch clients use to tag their requests.
pub const OPAQUE_ID_HEADER: &str = "x-opaque-id";

/// Hands the matched request to the processor chain as
/// [`Payload::Request`], with its routing context copied into metadata.
pub struct RequestHandler;

impl RequestHandler {
    pub fn shared() -> Arc<dyn FrontendHandler> {
        Arc::new(RequestHandler)
    }
}

#[async_trait]
impl FrontendHandler for RequestHandler {
    async fn handle(&self, req: &Request) -> Result<ProcessResult, ProcessorError> {
        let mut metadata = Metadata::new();
        metadata.set(keys::REQUEST_ID, &req.id);
        metadata.set(keys::PATH, &req.path);
        if let Some(pattern) = &req.pattern {
            metadata.set(keys::PATTERN, pattern);
        }
        if let Some(index) = req.param("index") {
            metadata.set(keys::INDEX, &index);
        }
        if !req.body.is_empty() {
            metadata.set(keys::REQUEST_BODY, &String::from_utf8_lossy(&req.body));
        }
        if let Some(opaque_id) = req.header(OPAQUE_ID_HEADER) {
            metadata.set(keys::OPAQUE_ID, &opaque_id);
        }
        Ok(ProcessResult::new(metadata, Payload::Request(Box::new(req.clone()))))
    }
}

/// Relays every request it sees to a document backend unchanged.
///
/// Used as the router fallback, so paths the gateway does not handle itself
/// still reach Elasticsearch. It runs outside any pipeline's processors.
pub struct ElasticsearchFallback {
    backend: Arc<dyn BackendConnector>,
}

impl ElasticsearchFallback {
    pub fn new(backend: Arc<dyn BackendConnector>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl FrontendHandler for ElasticsearchFallback {
    async fn handle(&self, req: &Request) -> Result<ProcessResult, ProcessorError> {
        let document = self.backend.as_document().ok_or_else(|| {
            ProcessorError::unsupported_backend("fallback", "backend has no document capability")
        })?;
        debug!(request_id = %req.id, path = %req.path, "forwarding unrouted request");
        let resp = document
            .send(req.method, &req.path_and_query(), req.body.clone())
            .await?;

        let headers = resp.relayed_headers();
        let mut result = ProcessResult::new(Metadata::new(), Payload::Bytes(resp.body))
            .with_status(resp.status);
        result.headers = headers;
        Ok(result)
    }
}
