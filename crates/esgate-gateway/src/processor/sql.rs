//! Runs `{"query": "..."}` bodies against the pipeline's SQL backend.

use async_trait::async_trait;
use esgate_kernel::pipeline::{
    BackendConnectorKind, Metadata, Payload, Processor, ProcessorContext, ProcessorError,
};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct SqlRequest {
    query: String,
}

pub struct SqlQueryProcessor {
    id: String,
}

impl SqlQueryProcessor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn statement(&self, inputs: Vec<Payload>) -> Result<String, ProcessorError> {
        let body = inputs
            .into_iter()
            .find_map(|p| match p {
                Payload::Request(req) => Some(req.body),
                _ => None,
            })
            .ok_or_else(|| ProcessorError::invalid_input(&self.id, "expected the inbound request"))?;
        let request: SqlRequest = serde_json::from_slice(&body)
            .map_err(|e| ProcessorError::invalid_input(&self.id, format!("malformed SQL request: {e}")))?;
        if request.query.trim().is_empty() {
            return Err(ProcessorError::invalid_input(&self.id, "query cannot be empty"));
        }
        Ok(request.query)
    }
}

#[async_trait]
impl Processor for SqlQueryProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_backend_kinds(&self) -> &[BackendConnectorKind] {
        &[BackendConnectorKind::Sql]
    }

    async fn handle(
        &self,
        ctx: &ProcessorContext<'_>,
        _metadata: &mut Metadata,
        inputs: Vec<Payload>,
    ) -> Result<Payload, ProcessorError> {
        let statement = self.statement(inputs)?;
        let backend = ctx
            .sql_backend()
            .ok_or_else(|| ProcessorError::unsupported_backend(&self.id, "no SQL backend attached"))?;
        let rows = backend.query(&statement).await?;
        debug!(request_id = %ctx.request_id, rows = rows.len(), "sql query answered");
        Ok(Payload::Rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esgate_kernel::pipeline::{
        BackendConnector, BackendError, HttpMethod, Request, SqlBackend,
    };
    use serde_json::json;
    use std::sync::Arc;

    struct FixedRows;

    #[async_trait]
    impl SqlBackend for FixedRows {
        async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>, BackendError> {
            Ok(vec![json!({ "sql": sql })])
        }

        async fn exec(&self, _sql: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BackendConnector for FixedRows {
        fn kind(&self) -> BackendConnectorKind {
            BackendConnectorKind::Sql
        }

        fn endpoint(&self) -> &str {
            "mem://rows"
        }

        async fn close(&self) {}

        fn as_sql(&self) -> Option<&dyn SqlBackend> {
            Some(self)
        }
    }

    fn sql_request(body: &str) -> Vec<Payload> {
        vec![Payload::Request(Box::new(
            Request::new("r", HttpMethod::Post, "/_sql").with_body(body),
        ))]
    }

    #[tokio::test]
    async fn query_runs_on_the_sql_backend() {
        let backends: Vec<Arc<dyn BackendConnector>> = vec![Arc::new(FixedRows)];
        let ctx = ProcessorContext::new("r", &backends);
        let out = SqlQueryProcessor::new("sql")
            .handle(&ctx, &mut Metadata::new(), sql_request(r#"{"query":"SELECT 1"}"#))
            .await
            .unwrap();
        assert_eq!(out, Payload::Rows(vec![json!({ "sql": "SELECT 1" })]));
    }

    #[tokio::test]
    async fn missing_backend_and_bad_bodies_fail() {
        let ctx = ProcessorContext::new("r", &[]);
        let p = SqlQueryProcessor::new("sql");
        let err = p
            .handle(&ctx, &mut Metadata::new(), sql_request(r#"{"query":"SELECT 1"}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::UnsupportedBackend { .. }));

        let err = p
            .handle(&ctx, &mut Metadata::new(), sql_request("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
    }
}
