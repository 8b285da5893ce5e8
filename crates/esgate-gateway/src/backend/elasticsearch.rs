//! Elasticsearch document backend.
//!
//! Forwards requests verbatim and relays the response body. 4xx answers are
//! relayed as-is so callers see Elasticsearch's own error document; 5xx
//! answers surface as [`BackendError::Upstream`].

use super::{build_client, network_error};
use crate::error::GatewayResult;
use async_trait::async_trait;
use esgate_kernel::config::BackendEndpointConfig;
use esgate_kernel::pipeline::{
    BackendConnector, BackendConnectorKind, BackendError, BackendResponse, DocumentBackend,
    HttpMethod,
};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, instrument};

pub struct ElasticsearchBackend {
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    client: Client,
    closed: AtomicBool,
}

impl ElasticsearchBackend {
    pub fn new(config: &BackendEndpointConfig) -> GatewayResult<Self> {
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            client: build_client()?,
            closed: AtomicBool::new(false),
        })
    }

    fn request(&self, method: Method, path_and_query: &str) -> Result<reqwest::RequestBuilder, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.base_url.clone()));
        }
        let url = format!("{}/{}", self.base_url, path_and_query.trim_start_matches('/'));
        let mut builder = self.client.request(method, url);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }
        Ok(builder)
    }
}

fn content_type(path_and_query: &str) -> &'static str {
    if path_and_query.contains("_bulk") || path_and_query.contains("_msearch") {
        "application/x-ndjson"
    } else {
        "application/json"
    }
}

#[async_trait]
impl DocumentBackend for ElasticsearchBackend {
    #[instrument(skip(self, body), fields(backend = %self.base_url, method = method.as_str()))]
    async fn send(
        &self,
        method: HttpMethod,
        path_and_query: &str,
        body: Vec<u8>,
    ) -> Result<BackendResponse, BackendError> {
        let method = Method::from_bytes(method.as_str().as_bytes()).unwrap_or(Method::GET);
        let mut builder = self.request(method, path_and_query)?;
        if !body.is_empty() {
            builder = builder
                .header("content-type", content_type(path_and_query))
                .body(body);
        }

        let start = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        let status = resp.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        let elapsed = start.elapsed();
        debug!(status, elapsed_ms = elapsed.as_millis() as u64, "elasticsearch answered");

        if status >= 500 {
            return Err(BackendError::Upstream {
                endpoint: self.base_url.clone(),
                status,
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(BackendResponse {
            status,
            headers,
            body: body.to_vec(),
            elapsed,
        })
    }

    async fn index_document(
        &self,
        index: &str,
        document: &serde_json::Value,
    ) -> Result<(), BackendError> {
        let resp = self
            .request(Method::POST, &format!("{index}/_doc"))?
            .json(document)
            .send()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = resp.text().await.unwrap_or_default();
        Err(BackendError::Upstream {
            endpoint: self.base_url.clone(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BackendConnector for ElasticsearchBackend {
    fn kind(&self) -> BackendConnectorKind {
        BackendConnectorKind::Document
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn open(&self) -> Result<(), BackendError> {
        let resp = self
            .request(Method::GET, "/")?
            .send()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Upstream {
                endpoint: self.base_url.clone(),
                status: resp.status().as_u16(),
                message: "cluster info request failed".into(),
            })
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn as_document(&self) -> Option<&dyn DocumentBackend> {
        Some(self)
    }
}
