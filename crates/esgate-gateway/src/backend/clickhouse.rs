//! ClickHouse SQL backend over the HTTP interface.

use super::{build_client, network_error};
use crate::error::GatewayResult;
use async_trait::async_trait;
use esgate_kernel::config::BackendEndpointConfig;
use esgate_kernel::pipeline::{BackendConnector, BackendConnectorKind, BackendError, SqlBackend};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct ClickHouseBackend {
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    client: Client,
    closed: AtomicBool,
}

impl ClickHouseBackend {
    pub fn new(config: &BackendEndpointConfig) -> GatewayResult<Self> {
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            client: build_client()?,
            closed: AtomicBool::new(false),
        })
    }

    async fn post(&self, sql: String) -> Result<String, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed(self.base_url.clone()));
        }
        let mut builder = self.client.post(format!("{}/", self.base_url)).body(sql);
        if let Some(user) = &self.user {
            builder = builder.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            builder = builder.header("X-ClickHouse-Key", password);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| network_error(&self.base_url, e))?;
        if !status.is_success() {
            return Err(BackendError::Upstream {
                endpoint: self.base_url.clone(),
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }
        Ok(text)
    }
}

/// Append `FORMAT JSONEachRow` unless the statement already names a format.
fn with_row_format(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.to_ascii_uppercase().contains(" FORMAT ") {
        trimmed.to_string()
    } else {
        format!("{trimmed} FORMAT JSONEachRow")
    }
}

fn parse_rows(endpoint: &str, body: &str) -> Result<Vec<serde_json::Value>, BackendError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| BackendError::Decode {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl SqlBackend for ClickHouseBackend {
    async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>, BackendError> {
        let body = self.post(with_row_format(sql)).await?;
        let rows = parse_rows(&self.base_url, &body)?;
        debug!(backend = %self.base_url, rows = rows.len(), "clickhouse query finished");
        Ok(rows)
    }

    async fn exec(&self, sql: &str) -> Result<(), BackendError> {
        self.post(sql.to_string()).await.map(|_| ())
    }
}

#[async_trait]
impl BackendConnector for ClickHouseBackend {
    fn kind(&self) -> BackendConnectorKind {
        BackendConnectorKind::Sql
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn open(&self) -> Result<(), BackendError> {
        self.exec("SELECT 1").await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn as_sql(&self) -> Option<&dyn SqlBackend> {
        Some(self)
    }
}
