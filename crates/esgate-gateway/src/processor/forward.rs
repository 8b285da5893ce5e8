//! Forwards the inbound request to a document backend and relays the body.
//!
//! The first forward in a chain also decides the response status and headers.

use async_trait::async_trait;
use esgate_kernel::pipeline::{
    BackendConnectorKind, Metadata, Payload, Processor, ProcessorContext, ProcessorError, keys,
};
use serde_json::json;
use tracing::warn;

/// Metadata key holding the seconds a labelled backend call took.
pub fn timing_key(label: &str) -> String {
    format!("timing.{label}")
}

/// Metadata key holding the error of a labelled backend call.
pub fn error_key(label: &str) -> String {
    format!("error.{label}")
}

pub struct BackendForwardProcessor {
    id: String,
    label: String,
    /// Target backend endpoint; `None` picks the first document backend.
    endpoint: Option<String>,
    /// Turn backend failures into an error payload instead of failing the request.
    tolerate_errors: bool,
}

impl BackendForwardProcessor {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            endpoint: None,
            tolerate_errors: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn tolerate_errors(mut self) -> Self {
        self.tolerate_errors = true;
        self
    }
}

#[async_trait]
impl Processor for BackendForwardProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_backend_kinds(&self) -> &[BackendConnectorKind] {
        &[BackendConnectorKind::Document]
    }

    async fn handle(
        &self,
        ctx: &ProcessorContext<'_>,
        metadata: &mut Metadata,
        inputs: Vec<Payload>,
    ) -> Result<Payload, ProcessorError> {
        let request = inputs
            .into_iter()
            .find_map(|p| match p {
                Payload::Request(req) => Some(req),
                _ => None,
            })
            .ok_or_else(|| ProcessorError::invalid_input(&self.id, "expected the inbound request"))?;

        let backend = ctx
            .document_backend(self.endpoint.as_deref())
            .ok_or_else(|| {
                ProcessorError::unsupported_backend(
                    &self.id,
                    match &self.endpoint {
                        Some(e) => format!("no document backend at '{e}'"),
                        None => "no document backend attached".to_string(),
                    },
                )
            })?;

        match backend
            .send(request.method, &request.path_and_query(), request.body.clone())
            .await
        {
            Ok(resp) => {
                metadata.set(timing_key(&self.label), &resp.elapsed.as_secs_f64());
                if !metadata.contains(keys::STATUS) {
                    metadata.set(keys::STATUS, &resp.status);
                }
                if !metadata.contains(keys::RESPONSE_HEADERS) {
                    metadata.set(keys::RESPONSE_HEADERS, &resp.relayed_headers());
                }
                Ok(Payload::Bytes(resp.body))
            }
            Err(e) if self.tolerate_errors => {
                warn!(request_id = %ctx.request_id, backend = %self.label, error = %e, "backend call failed");
                metadata.set(error_key(&self.label), &e.to_string());
                Ok(Payload::Json(json!({ "error": e.to_string() })))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esgate_kernel::pipeline::{
        BackendConnector, BackendError, BackendResponse, DocumentBackend, HttpMethod, Request,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoBackend {
        endpoint: String,
        fail: bool,
    }

    #[async_trait]
    impl DocumentBackend for EchoBackend {
        async fn send(
            &self,
            method: HttpMethod,
            path_and_query: &str,
            _body: Vec<u8>,
        ) -> Result<BackendResponse, BackendError> {
            if self.fail {
                return Err(BackendError::Network {
                    endpoint: self.endpoint.clone(),
                    message: "connection refused".into(),
                });
            }
            Ok(BackendResponse {
                status: 201,
                headers: HashMap::new(),
                body: format!("{} {} {}", self.endpoint, method.as_str(), path_and_query).into_bytes(),
                elapsed: Duration::from_millis(500),
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
    impl BackendConnector for EchoBackend {
        fn kind(&self) -> BackendConnectorKind {
            BackendConnectorKind::Document
        }

        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        async fn close(&self) {}

        fn as_document(&self) -> Option<&dyn DocumentBackend> {
            Some(self)
        }
    }

    fn backend(endpoint: &str, fail: bool) -> Arc<dyn BackendConnector> {
        Arc::new(EchoBackend {
            endpoint: endpoint.into(),
            fail,
        })
    }

    fn search() -> Vec<Payload> {
        vec![Payload::Request(Box::new(
            Request::new("r", HttpMethod::Post, "/logs/_search").with_query("size=0"),
        ))]
    }

    #[tokio::test]
    async fn forwards_to_selected_endpoint() {
        let backends = [backend("http://a", false), backend("http://b", false)];
        let ctx = ProcessorContext::new("r", &backends);
        let p = BackendForwardProcessor::new("to-b")
            .with_endpoint("http://b")
            .with_label("shadow");

        let mut md = Metadata::new();
        let out = p.handle(&ctx, &mut md, search()).await.unwrap();
        assert_eq!(out, Payload::text("http://b POST /logs/_search?size=0"));
        assert_eq!(md.get::<f64>(&timing_key("shadow")), Some(0.5));
        assert_eq!(md.get::<u16>(keys::STATUS), Some(201));
    }

    #[tokio::test]
    async fn missing_backend_is_a_request_time_error() {
        let ctx = ProcessorContext::new("r", &[]);
        let err = BackendForwardProcessor::new("fwd")
            .handle(&ctx, &mut Metadata::new(), search())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn tolerant_forward_records_error() {
        let backends = [backend("http://down", true)];
        let ctx = ProcessorContext::new("r", &backends);
        let mut md = Metadata::new();

        let strict = BackendForwardProcessor::new("strict")
            .handle(&ctx, &mut md, search())
            .await
            .unwrap_err();
        assert_eq!(strict.status(), 502);

        let out = BackendForwardProcessor::new("lenient")
            .tolerate_errors()
            .handle(&ctx, &mut md, search())
            .await
            .unwrap();
        assert!(matches!(out, Payload::Json(_)));
        assert!(md.get::<String>(&error_key("lenient")).unwrap().contains("connection refused"));
    }
}
