//! Access-log middleware. Records every inbound request and never commits.

use async_trait::async_trait;
use esgate_kernel::pipeline::{Middleware, Request, ResponseWriter};
use tracing::info;

#[derive(Debug, Default)]
pub struct AccessLogMiddleware;

impl AccessLogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for AccessLogMiddleware {
    fn name(&self) -> &str {
        "access-log"
    }

    async fn handle(&self, req: &Request, _w: &mut ResponseWriter) {
        info!(
            request_id  = %req.id,
            method      = req.method.as_str(),
            path        = %req.path,
            query       = ?req.query,
            remote_addr = ?req.remote_addr,
            body_bytes  = req.body.len(),
            opaque_id   = ?req.header("x-opaque-id"),
            "inbound request"
        );
    }
}
