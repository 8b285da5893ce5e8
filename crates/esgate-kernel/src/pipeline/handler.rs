//! Frontend handler contract.
//!
//! A handler is what a route (or the fallback) resolves to. It turns the
//! matched [`Request`] into the [`ProcessResult`] that seeds the pipeline's
//! processor chain.

use super::error::ProcessorError;
use super::types::{ProcessResult, Request};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait FrontendHandler: Send + Sync {
    async fn handle(&self, req: &Request) -> Result<ProcessResult, ProcessorError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> FrontendHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcessResult, ProcessorError>> + Send + 'static,
{
    async fn handle(&self, req: &Request) -> Result<ProcessResult, ProcessorError> {
        (self.0)(req.clone()).await
    }
}

/// Wrap an async closure as a shared [`FrontendHandler`].
///
/// ```rust
/// use esgate_kernel::pipeline::{handler_fn, ProcessResult};
///
/// let bulk = handler_fn(|_req| async { Ok(ProcessResult::text("bulk\n")) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FrontendHandler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcessResult, ProcessorError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{HttpMethod, Payload};

    #[tokio::test]
    async fn closure_handler_sees_request() {
        let h = handler_fn(|req: Request| async move {
            Ok(ProcessResult::text(format!("{} {}", req.method.as_str(), req.path)))
        });
        let out = h
            .handle(&Request::new("r", HttpMethod::Post, "/_bulk"))
            .await
            .unwrap();
        assert_eq!(out.payload, Payload::text("POST /_bulk"));
    }
}
