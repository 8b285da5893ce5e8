//! In-memory A/B result collector.
//!
//! Every collected [`AbResult`] is enriched and then passed through a fixed
//! sequence of stages before it is fanned out to the configured sinks:
//!
//! ```text
//!  AbResult ─► enrich ─► sampler ─► kibana ids ─► unify async ─► diff ─► redact OK ─► sinks
//!                           │                                                       │
//!                         drop                                              error ──► health loop
//! ```
//!
//! A stage or sink failure does not stop the collector. It is reported to the
//! health loop, which counts errors and tells the coordinator the collector
//! is unhealthy as soon as one has occurred.

use crate::processor::panic_message;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use esgate_kernel::ab_testing::{AbResult, Collector, HealthMessage};
use esgate_kernel::config::AbTestingConfig;
use esgate_kernel::pipeline::{BackendConnector, BackendError};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Replacement for response bodies of results whose sides agreed.
pub const REDACTED: &str = "<redacted>";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("stage '{stage}' failed: {message}")]
    Stage { stage: &'static str, message: String },

    #[error("sink '{sink}' failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: BackendError,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Enriched record
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of comparing the two response bodies.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMismatch {
    pub is_ok: bool,
    /// JSON array of [`Mismatch`]es.
    pub mismatches: String,
    /// One line per mismatch.
    pub message: String,
    /// Hex SHA-256 of `mismatches`; equal for identical sets of differences.
    pub sha256: String,
    pub count: usize,
    pub top_mismatch_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

/// The record written to sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedResult {
    #[serde(flatten)]
    pub result: AbResult,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub response_mismatch: ResponseMismatch,
    pub gateway_version: String,
    /// Problems noticed while processing that did not drop the record.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kibana_dashboard_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kibana_dashboard_panel_id: Option<String>,
}

impl EnrichedResult {
    pub fn new(result: AbResult) -> Self {
        Self {
            result,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            response_mismatch: ResponseMismatch::default(),
            gateway_version: env!("CARGO_PKG_VERSION").to_string(),
            errors: Vec::new(),
            kibana_dashboard_id: None,
            kibana_dashboard_panel_id: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// `Ok(None)` drops the record.
trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError>;
}

struct ProbabilisticSampler {
    ratio: f64,
}

impl Stage for ProbabilisticSampler {
    fn name(&self) -> &'static str {
        "sampler"
    }

    fn process(&self, record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError> {
        let keep = self.ratio >= 1.0 || (self.ratio > 0.0 && rand::random::<f64>() < self.ratio);
        Ok(keep.then_some(record))
    }
}

/// Attributes a record to the Kibana dashboard and panel that issued it.
///
/// Kibana sends its execution context in `x-opaque-id` as `;`-separated
/// segments, e.g. `unknownId;kibana:application:dashboards:<id>;agg_based:visualization:<panel>`.
/// The panel is the last component of the segment after the dashboard one.
struct ExtractKibanaIds;

impl Stage for ExtractKibanaIds {
    fn name(&self) -> &'static str {
        "kibana_ids"
    }

    fn process(&self, mut record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError> {
        if let Some(opaque_id) = record.result.opaque_id.as_deref() {
            let (dashboard, panel) = kibana_ids(opaque_id);
            record.kibana_dashboard_id = dashboard;
            record.kibana_dashboard_panel_id = panel;
        }
        Ok(Some(record))
    }
}

pub fn kibana_ids(opaque_id: &str) -> (Option<String>, Option<String>) {
    let segments: Vec<&str> = opaque_id.split(';').map(str::trim).collect();
    let Some((at, dashboard)) = segments.iter().enumerate().find_map(|(i, segment)| {
        let (_, rest) = segment.split_once("dashboards:")?;
        let id = rest.split(':').next().filter(|id| !id.is_empty())?;
        Some((i, id.to_string()))
    }) else {
        return (None, None);
    };
    let panel = segments
        .get(at + 1)
        .filter(|segment| segment.contains(':'))
        .and_then(|segment| segment.rsplit(':').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    (Some(dashboard), panel)
}

/// Replaces an async-search envelope (`{"id", "is_running", "response"}`)
/// with the search response it wraps, so an async answer on one side compares
/// equal to a plain `_search` answer on the other.
struct UnifySyncAsyncResponse;

impl Stage for UnifySyncAsyncResponse {
    fn name(&self) -> &'static str {
        "unify_async"
    }

    fn process(&self, mut record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError> {
        for side in [&mut record.result.a, &mut record.result.b] {
            let Ok(Value::Object(mut envelope)) = serde_json::from_str::<Value>(&side.body) else {
                continue;
            };
            if !envelope.contains_key("is_running") {
                continue;
            }
            match envelope.remove("response") {
                Some(response) => {
                    side.body = serde_json::to_string(&response).map_err(|e| CollectorError::Stage {
                        stage: self.name(),
                        message: e.to_string(),
                    })?;
                }
                None => record
                    .errors
                    .push(format!("{}: async search response has no result yet", side.name)),
            }
        }
        Ok(Some(record))
    }
}

struct DiffTransformer;

impl Stage for DiffTransformer {
    fn name(&self) -> &'static str {
        "diff"
    }

    fn process(&self, mut record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError> {
        let mismatches = compare_bodies(&record.result.a.body, &record.result.b.body);
        record.response_mismatch = summarize(&mismatches).map_err(|e| CollectorError::Stage {
            stage: self.name(),
            message: e.to_string(),
        })?;
        Ok(Some(record))
    }
}

struct RedactOkResults;

impl Stage for RedactOkResults {
    fn name(&self) -> &'static str {
        "redact"
    }

    fn process(&self, mut record: EnrichedResult) -> Result<Option<EnrichedResult>, CollectorError> {
        if record.response_mismatch.is_ok {
            record.result.a.body = REDACTED.to_string();
            record.result.b.body = REDACTED.to_string();
        }
        Ok(Some(record))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON diff
// ─────────────────────────────────────────────────────────────────────────────

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Structural differences between two bodies. Bodies that are not both JSON
/// are compared as text.
pub fn compare_bodies(a: &str, b: &str) -> Vec<Mismatch> {
    let mut out = Vec::new();
    match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
        (Ok(a), Ok(b)) => diff_json("$", &a, &b, &mut out),
        _ if a == b => {}
        _ => out.push(Mismatch {
            path: "$".into(),
            kind: "body_mismatch",
            message: "response bodies differ".into(),
        }),
    }
    out
}

fn diff_json(path: &str, a: &Value, b: &Value, out: &mut Vec<Mismatch>) {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            for (key, va) in x {
                let child = format!("{path}.{key}");
                match y.get(key) {
                    Some(vb) => diff_json(&child, va, vb, out),
                    None => out.push(Mismatch {
                        path: child,
                        kind: "missing_in_b",
                        message: "key is only present in A".into(),
                    }),
                }
            }
            for key in y.keys().filter(|k| !x.contains_key(*k)) {
                out.push(Mismatch {
                    path: format!("{path}.{key}"),
                    kind: "missing_in_a",
                    message: "key is only present in B".into(),
                });
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                out.push(Mismatch {
                    path: path.to_string(),
                    kind: "array_length_mismatch",
                    message: format!("A has {} elements, B has {}", x.len(), y.len()),
                });
            }
            for (i, (va, vb)) in x.iter().zip(y).enumerate() {
                diff_json(&format!("{path}[{i}]"), va, vb, out);
            }
        }
        _ if json_type(a) != json_type(b) => out.push(Mismatch {
            path: path.to_string(),
            kind: "invalid_type",
            message: format!("A is {}, B is {}", json_type(a), json_type(b)),
        }),
        _ if a != b => out.push(Mismatch {
            path: path.to_string(),
            kind: "invalid_value",
            message: format!("A is {a}, B is {b}"),
        }),
        _ => {}
    }
}

fn summarize(mismatches: &[Mismatch]) -> Result<ResponseMismatch, serde_json::Error> {
    let serialized = serde_json::to_string(mismatches)?;
    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for m in mismatches {
        *by_kind.entry(m.kind).or_insert(0) += 1;
    }
    // ties go to the alphabetically first kind
    let top = by_kind
        .iter()
        .max_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then_with(|| kb.cmp(ka)))
        .map(|(k, _)| (*k).to_string())
        .unwrap_or_default();

    Ok(ResponseMismatch {
        is_ok: mismatches.is_empty(),
        message: mismatches
            .iter()
            .map(|m| format!("{}: {}", m.path, m.message))
            .collect::<Vec<_>>()
            .join("\n"),
        sha256: hex::encode(Sha256::digest(serialized.as_bytes())),
        mismatches: serialized,
        count: mismatches.len(),
        top_mismatch_type: top,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Final destination of enriched records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, record: &EnrichedResult) -> Result<(), CollectorError>;
}

/// Logs a one-line summary per record.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn write(&self, record: &EnrichedResult) -> Result<(), CollectorError> {
        let m = &record.response_mismatch;
        info!(
            request_id = %record.result.request_id,
            index = %record.result.request.index_name,
            is_ok = m.is_ok,
            mismatches = m.count,
            top_mismatch_type = %m.top_mismatch_type,
            a_secs = record.result.a.time,
            b_secs = record.result.b.time,
            "A/B comparison"
        );
        Ok(())
    }
}

/// Indexes each record as a document.
pub struct DocumentSink {
    backend: Arc<dyn BackendConnector>,
    index: String,
}

impl DocumentSink {
    pub fn new(backend: Arc<dyn BackendConnector>, index: impl Into<String>) -> Self {
        Self {
            backend,
            index: index.into(),
        }
    }
}

#[async_trait]
impl ResultSink for DocumentSink {
    fn name(&self) -> &str {
        &self.index
    }

    async fn write(&self, record: &EnrichedResult) -> Result<(), CollectorError> {
        let sink_error = |source| CollectorError::Sink {
            sink: self.index.clone(),
            source,
        };
        let document = serde_json::to_value(record).map_err(|e| {
            sink_error(BackendError::Decode {
                endpoint: self.backend.endpoint().to_string(),
                message: e.to_string(),
            })
        })?;
        let backend = self.backend.as_document().ok_or_else(|| {
            sink_error(BackendError::Closed(format!(
                "{} has no document capability",
                self.backend.endpoint()
            )))
        })?;
        backend
            .index_document(&self.index, &document)
            .await
            .map_err(sink_error)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryCollector
// ─────────────────────────────────────────────────────────────────────────────

struct Processing {
    stages: Vec<Box<dyn Stage>>,
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl Processing {
    async fn run(&self, result: AbResult, errors: &mpsc::Sender<CollectorError>) {
        let mut record = EnrichedResult::new(result);
        for stage in &self.stages {
            match stage.process(record) {
                Ok(Some(next)) => record = next,
                Ok(None) => {
                    debug!(stage = stage.name(), "record dropped");
                    return;
                }
                Err(e) => {
                    let _ = errors.send(e).await;
                    return;
                }
            }
        }
        for sink in &self.sinks {
            if let Err(e) = sink.write(&record).await {
                let _ = errors.send(e).await;
            }
        }
    }
}

/// Receiving halves, taken by `start`.
struct Queues {
    results: mpsc::Receiver<AbResult>,
    errors: mpsc::Receiver<CollectorError>,
}

pub struct InMemoryCollector {
    id: u64,
    processing: Arc<Processing>,
    results: mpsc::Sender<AbResult>,
    errors: mpsc::Sender<CollectorError>,
    queues: Mutex<Option<Queues>>,
    health: mpsc::Sender<HealthMessage>,
    health_interval: Duration,
    token: CancellationToken,
}

impl InMemoryCollector {
    pub fn new(
        id: u64,
        config: &AbTestingConfig,
        sinks: Vec<Arc<dyn ResultSink>>,
        health: mpsc::Sender<HealthMessage>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(config.collector_queue_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(config.error_queue_capacity.max(1));
        Self {
            id,
            processing: Arc::new(Processing {
                stages: vec![
                    Box::new(ProbabilisticSampler {
                        ratio: config.sample_ratio,
                    }) as Box<dyn Stage>,
                    Box::new(ExtractKibanaIds),
                    Box::new(UnifySyncAsyncResponse),
                    Box::new(DiffTransformer),
                    Box::new(RedactOkResults),
                ],
                sinks,
            }),
            results: results_tx,
            errors: errors_tx,
            queues: Mutex::new(Some(Queues {
                results: results_rx,
                errors: errors_rx,
            })),
            health,
            health_interval: config.health_check_interval(),
            token: CancellationToken::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `fut`; a panic cancels the whole collector.
    fn spawn_guarded<F>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(collector = id, task, panic = %panic_message(panic.as_ref()), "collector task panicked");
                token.cancel();
            }
        });
    }
}

async fn receive_loop(
    mut results: mpsc::Receiver<AbResult>,
    processing: Arc<Processing>,
    errors: mpsc::Sender<CollectorError>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(result) = results.recv() => processing.run(result, &errors).await,
            else => break,
        }
    }
}

async fn health_loop(
    id: u64,
    mut errors: mpsc::Receiver<CollectorError>,
    health: mpsc::Sender<HealthMessage>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut error_count = 0u64;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(e) = errors.recv() => {
                error_count += 1;
                warn!(collector = id, error = %e, error_count, "collector stage failed");
            }
            _ = tokio::time::sleep(interval) => {}
        }
        debug!(collector = id, error_count, "collector health report");
        let message = HealthMessage {
            is_healthy: error_count == 0,
            collector: id,
        };
        tokio::select! {
            _ = token.cancelled() => break,
            sent = health.send(message) => if sent.is_err() { break },
        }
    }
    info!(collector = id, "collector health loop stopped");
}

#[async_trait]
impl Collector for InMemoryCollector {
    fn id(&self) -> u64 {
        self.id
    }

    fn start(&self) {
        let Some(queues) = self.queues.lock().take() else {
            warn!(collector = self.id, "collector already started");
            return;
        };
        info!(collector = self.id, "starting A/B results collector");
        self.spawn_guarded(
            "receive",
            receive_loop(
                queues.results,
                Arc::clone(&self.processing),
                self.errors.clone(),
                self.token.clone(),
            ),
        );
        self.spawn_guarded(
            "health",
            health_loop(
                self.id,
                queues.errors,
                self.health.clone(),
                self.health_interval,
                self.token.clone(),
            ),
        );
    }

    fn stop(&self) {
        info!(collector = self.id, "stopping A/B results collector");
        self.token.cancel();
    }

    async fn collect(&self, result: AbResult) {
        let request_id = result.request_id.clone();
        tokio::select! {
            _ = self.token.cancelled() => {
                debug!(collector = self.id, request_id = %request_id, "collector stopped, result dropped");
            }
            sent = self.results.send(result) => if sent.is_err() {
                debug!(collector = self.id, "collector queue closed, result dropped");
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Creates collectors for the coordinator, one generation at a time.
pub trait CollectorFactory: Send + Sync {
    fn create(&self, id: u64, health: mpsc::Sender<HealthMessage>) -> Arc<dyn Collector>;
}

pub struct InMemoryCollectorFactory {
    config: AbTestingConfig,
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl InMemoryCollectorFactory {
    pub fn new(config: AbTestingConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl CollectorFactory for InMemoryCollectorFactory {
    fn create(&self, id: u64, health: mpsc::Sender<HealthMessage>) -> Arc<dyn Collector> {
        Arc::new(InMemoryCollector::new(id, &self.config, self.sinks.clone(), health))
    }
}
