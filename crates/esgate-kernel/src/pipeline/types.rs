//! Core data types flowing through a pipeline.
//!
//! A [`Request`] is created once per inbound call. Handlers turn it into a
//! [`ProcessResult`], whose [`Metadata`] and [`Payload`] are then threaded
//! through the processor tree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP primitives
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP method understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Case-insensitive parse from a string slice.
    pub fn from_str_ci(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound call plus the routing context attached to it by the router.
///
/// `pattern` and `params` are empty until a route matched; the fallback
/// handler always sees them empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, also returned to the caller in `x-esgate-request-id`.
    pub id: String,
    pub method: HttpMethod,
    /// Path with any trailing `/` removed.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
    /// Route pattern that matched, e.g. `/:index/_search`.
    pub pattern: Option<String>,
    /// Values captured by `:name` segments of the matched pattern.
    pub params: HashMap<String, String>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            path: normalize_path(&path.into()),
            query: None,
            headers: HashMap::new(),
            body: Vec::new(),
            remote_addr: None,
            pattern: None,
            params: HashMap::new(),
        }
    }

    /// Builder helper: attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Builder helper: set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Path plus query string, as it should be forwarded upstream.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// Remove a single trailing `/` (the root path `/` is left alone).
pub fn normalize_path(path: &str) -> String {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path).to_string()
    } else {
        path.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────────────

/// Well-known metadata keys written by the runtime and built-in handlers.
pub mod keys {
    pub const REQUEST_ID: &str = "request_id";
    pub const OPAQUE_ID: &str = "opaque_id";
    pub const PATH: &str = "path";
    pub const INDEX: &str = "index";
    pub const PATTERN: &str = "pattern";
    pub const REQUEST_BODY: &str = "request_body";
    /// HTTP status a processor wants the response to carry.
    pub const STATUS: &str = "status";
    /// Headers a processor wants on the response, as a name → value map.
    pub const RESPONSE_HEADERS: &str = "response_headers";
}

/// Mutable bag threaded through one request's processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    values: HashMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a typed value, returning `None` if absent or of the wrong shape.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn get_raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Write a serializable value. Values that fail to serialize are skipped.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.values.insert(key.into(), v);
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.get_str(keys::REQUEST_ID)
    }

    /// Fold in the entries `branch` added or changed relative to `base`.
    ///
    /// Called once per sibling branch in declaration order. A key already
    /// changed by an earlier branch keeps that earlier value.
    pub fn merge_branch(&mut self, base: &Metadata, branch: Metadata) {
        for (key, value) in branch.values {
            let changed = base.values.get(&key) != Some(&value);
            let untouched = self.values.get(&key) == base.values.get(&key);
            if changed && untouched {
                self.values.insert(key, value);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload / ProcessResult
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque payload carried between handlers and processors.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// Result rows from a SQL backend.
    Rows(Vec<serde_json::Value>),
    /// The inbound request itself, for processors that forward it upstream.
    Request(Box<Request>),
}

impl Payload {
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Bytes(s.into().into_bytes())
    }

    /// Serialize the payload for the wire.
    ///
    /// Returns `None` for [`Payload::Request`]: a request left unprocessed at
    /// the end of the chain has no response representation.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Payload::Empty => Some(Vec::new()),
            Payload::Bytes(b) => Some(b.clone()),
            Payload::Json(v) => serde_json::to_vec(v).ok(),
            Payload::Rows(rows) => serde_json::to_vec(rows).ok(),
            Payload::Request(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v.clone()),
            Payload::Bytes(b) => serde_json::from_slice(b).ok(),
            Payload::Rows(rows) => Some(serde_json::Value::Array(rows.clone())),
            _ => None,
        }
    }
}

/// Output of a handler or processor chain.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub metadata: Metadata,
    pub payload: Payload,
    pub status: u16,
    /// Headers to attach to the HTTP response.
    pub headers: HashMap<String, String>,
}

impl ProcessResult {
    pub fn new(metadata: Metadata, payload: Payload) -> Self {
        Self {
            metadata,
            payload,
            status: 200,
            headers: HashMap::new(),
        }
    }

    /// Shorthand for a 200 text response with empty metadata.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Metadata::new(), Payload::text(body))
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }
}
