//! Backend connector contract.
//!
//! Backends form a closed set of capabilities: a **document** store that speaks
//! the Elasticsearch REST protocol, and a **SQL** store. A connector exposes the
//! capability it has through [`BackendConnector::as_document`] or
//! [`BackendConnector::as_sql`]; processors ask for the capability they need
//! at request time.

use super::error::BackendError;
use super::types::HttpMethod;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Capability class of a backend connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendConnectorKind {
    Document,
    Sql,
}

impl fmt::Display for BackendConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConnectorKind::Document => f.write_str("document"),
            BackendConnectorKind::Sql => f.write_str("sql"),
        }
    }
}

/// Raw response returned by a document backend.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

/// Connection-level headers that describe one hop, not the response.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

impl BackendResponse {
    /// Response headers worth passing on to the client, e.g. `content-type`
    /// and `x-elastic-product`. Names are lowercased.
    pub fn relayed_headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }
}

/// Elasticsearch-compatible document store.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Send a raw request, e.g. `POST /logs/_search`, and relay the response.
    async fn send(
        &self,
        method: HttpMethod,
        path_and_query: &str,
        body: Vec<u8>,
    ) -> Result<BackendResponse, BackendError>;

    /// Index a single JSON document.
    async fn index_document(
        &self,
        index: &str,
        document: &serde_json::Value,
    ) -> Result<(), BackendError>;
}

/// SQL store returning rows as JSON objects.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>, BackendError>;

    async fn exec(&self, sql: &str) -> Result<(), BackendError>;
}

/// Thin transport client to one downstream datastore.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    fn kind(&self) -> BackendConnectorKind;

    /// Base URL or address, used as the connector's identity in logs.
    fn endpoint(&self) -> &str;

    /// Verify the backend is reachable.
    async fn open(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release the connector. Requests issued afterwards fail with
    /// [`BackendError::Closed`].
    async fn close(&self);

    fn as_document(&self) -> Option<&dyn DocumentBackend> {
        None
    }

    fn as_sql(&self) -> Option<&dyn SqlBackend> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_not_relayed() {
        let headers = [
            ("Content-Type", "application/json"),
            ("X-Elastic-Product", "Elasticsearch"),
            ("transfer-encoding", "chunked"),
            ("Connection", "keep-alive"),
            ("content-length", "42"),
        ];
        let resp = BackendResponse {
            status: 200,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
            elapsed: Duration::ZERO,
        };

        let relayed = resp.relayed_headers();
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed["content-type"], "application/json");
        assert_eq!(relayed["x-elastic-product"], "Elasticsearch");
    }
}
