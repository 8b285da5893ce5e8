//! API-key authentication middleware.
//!
//! Accepts requests that carry a valid API key in either:
//! - `X-Api-Key: <key>` header
//! - `Authorization: Bearer <key>` header
//!
//! Requests without a valid key are answered with `401 Unauthorized`.

use async_trait::async_trait;
use esgate_kernel::pipeline::{Middleware, Request, ResponseWriter};
use std::collections::HashSet;
use tracing::warn;

pub struct ApiKeyMiddleware {
    valid_keys: HashSet<String>,
}

impl ApiKeyMiddleware {
    pub fn new(valid_keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            valid_keys: valid_keys.into_iter().map(Into::into).collect(),
        }
    }

    fn extract_key(req: &Request) -> Option<&str> {
        req.header("x-api-key").or_else(|| {
            req.header("authorization")
                .and_then(|auth| auth.strip_prefix("Bearer "))
        })
    }
}

#[async_trait]
impl Middleware for ApiKeyMiddleware {
    fn name(&self) -> &str {
        "api-key-auth"
    }

    async fn handle(&self, req: &Request, w: &mut ResponseWriter) {
        match Self::extract_key(req) {
            Some(key) if self.valid_keys.contains(key) => {}
            Some(_) => {
                warn!(request_id = %req.id, "rejected request: invalid API key");
                w.set_header("www-authenticate", "Bearer");
                w.error(401, "Invalid API key");
            }
            None => {
                warn!(request_id = %req.id, "rejected request: missing API key");
                w.set_header("www-authenticate", "Bearer");
                w.error(401, "Missing authentication credentials");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esgate_kernel::pipeline::HttpMethod;

    fn req(header: Option<(&str, &str)>) -> Request {
        let req = Request::new("req-1", HttpMethod::Get, "/_search");
        match header {
            Some((k, v)) => req.with_header(k, v),
            None => req,
        }
    }

    async fn run(mw: &ApiKeyMiddleware, req: Request) -> ResponseWriter {
        let mut w = ResponseWriter::new();
        mw.handle(&req, &mut w).await;
        w
    }

    #[tokio::test]
    async fn valid_keys_pass_through() {
        let mw = ApiKeyMiddleware::new(["sk-1"]);
        assert!(!run(&mw, req(Some(("X-Api-Key", "sk-1")))).await.is_committed());
        assert!(!run(&mw, req(Some(("Authorization", "Bearer sk-1")))).await.is_committed());
    }

    #[tokio::test]
    async fn missing_or_wrong_key_commits_401() {
        let mw = ApiKeyMiddleware::new(["sk-1"]);
        let w = run(&mw, req(None)).await;
        assert_eq!(w.status(), 401);
        assert_eq!(w.body(), b"Missing authentication credentials\n");

        let w = run(&mw, req(Some(("authorization", "Bearer nope")))).await;
        assert_eq!(w.status(), 401);
        assert_eq!(w.body(), b"Invalid API key\n");
    }
}
