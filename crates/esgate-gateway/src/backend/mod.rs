//! Backend connectors on `reqwest`.
//!
//! | Connector | Capability | Transport |
//! |-----------|------------|-----------|
//! | [`ElasticsearchBackend`] | [`DocumentBackend`] | Elasticsearch REST API |
//! | [`ClickHouseBackend`] | [`SqlBackend`] | ClickHouse HTTP interface, `JSONEachRow` |
//!
//! [`DocumentBackend`]: esgate_kernel::pipeline::DocumentBackend
//! [`SqlBackend`]: esgate_kernel::pipeline::SqlBackend

mod clickhouse;
mod elasticsearch;

pub use clickhouse::ClickHouseBackend;
pub use elasticsearch::ElasticsearchBackend;

use crate::error::{GatewayError, GatewayResult};
use esgate_kernel::pipeline::BackendError;
use std::time::Duration;

/// Per-request timeout applied by both connectors.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client() -> GatewayResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Client(e.to_string()))
}

fn network_error(endpoint: &str, e: reqwest::Error) -> BackendError {
    BackendError::Network {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
}
