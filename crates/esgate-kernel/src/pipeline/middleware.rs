//! Middleware contract and the response writer middlewares commit to.
//!
//! ```text
//! Request ──► m1 ──► m2 ──► … ──► mN ──► handler / fallback
//!              │      │
//!              └──────┴── committed? stop: later middlewares and the
//!                          handler never run
//! ```

use super::types::Request;
use async_trait::async_trait;
use std::collections::HashMap;

// ─────────────────────────────────────────────────────────────────────────────
// ResponseWriter
// ─────────────────────────────────────────────────────────────────────────────

/// Response under construction for one request.
///
/// Writing a status or any body bytes **commits** the response. Setting a
/// header alone does not.
#[derive(Debug, Clone, Default)]
pub struct ResponseWriter {
    status: Option<u16>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    committed: bool,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the status code and commit. Later calls keep the first status.
    pub fn write_header(&mut self, status: u16) {
        if self.status.is_none() {
            self.status = Some(status);
        }
        self.committed = true;
    }

    /// Append body bytes and commit (status defaults to 200).
    pub fn write(&mut self, bytes: &[u8]) {
        self.write_header(200);
        self.body.extend_from_slice(bytes);
    }

    /// Commit a plain-text error response: `message` followed by a newline.
    pub fn error(&mut self, status: u16, message: &str) {
        self.set_header("content-type", "text/plain; charset=utf-8");
        self.write_header(status);
        self.body.extend_from_slice(message.as_bytes());
        self.body.push(b'\n');
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into().to_lowercase(), value.into());
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (u16, HashMap<String, String>, Vec<u8>) {
        (self.status.unwrap_or(200), self.headers, self.body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware trait
// ─────────────────────────────────────────────────────────────────────────────

/// Pre-handler attached to a frontend connector.
///
/// A middleware either passes through silently or commits `w` to answer the
/// request itself; there is no separate error channel.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, req: &Request, w: &mut ResponseWriter);
}
