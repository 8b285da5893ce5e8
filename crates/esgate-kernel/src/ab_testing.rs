//! A/B-testing contract.
//!
//! An A/B processor runs one request against two backends and hands the pair
//! of responses, as an [`AbResult`], to a [`ResultSender`]. The sender feeds
//! whichever [`Collector`] is currently healthy.
//!
//! ```text
//!  AbTestProcessor ──send──► ResultSender ──collect──► Collector ──► sinks
//!                                 ▲                        │
//!                                 │ UseCollector(..)       │ HealthMessage
//!                                 └────── Coordinator ◄────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Comparison records
// ─────────────────────────────────────────────────────────────────────────────

/// The request both sides answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbRequest {
    pub path: String,
    #[serde(rename = "index")]
    pub index_name: String,
    pub body: String,
}

/// One side of the comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbResponse {
    /// Label of the side, e.g. the backend name.
    pub name: String,
    pub body: String,
    /// Time taken by this side, in seconds.
    pub time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AbResponse {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            time: 0.0,
            error: None,
        }
    }
}

/// A complete A/B comparison record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbResult {
    pub request: AbRequest,
    pub a: AbResponse,
    pub b: AbResponse,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque_id: Option<String>,
}

/// Liveness signal from a collector to the coordinator.
///
/// `collector` identifies the collector generation that sent it, so that a
/// late report from an already-replaced collector can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMessage {
    pub is_healthy: bool,
    pub collector: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Publisher processors hand comparison records to.
///
/// `send` may wait when the underlying queue is full. Implementations never
/// report delivery failures to the caller.
#[async_trait]
pub trait ResultSender: Send + Sync {
    async fn send(&self, result: AbResult);

    /// `false` for senders that discard everything.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Health-monitored sink of comparison records.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Generation number assigned by whoever created the collector.
    fn id(&self) -> u64;

    /// Spawn the collector's background tasks.
    fn start(&self);

    /// Cancel the background tasks. Records collected afterwards are dropped.
    fn stop(&self);

    async fn collect(&self, result: AbResult);
}
