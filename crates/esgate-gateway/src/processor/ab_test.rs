//! A/B comparison processor.
//!
//! Placed after a node with exactly two children, it receives both children's
//! outputs, answers with a one-line verdict and publishes the pair to the
//! [`ResultSender`] from a spawned task, so delivery never delays the
//! response.

use super::forward::{error_key, timing_key};
use esgate_kernel::ab_testing::{AbRequest, AbResponse, AbResult, ResultSender};
use esgate_kernel::pipeline::{
    Metadata, Payload, Processor, ProcessorContext, ProcessorError, keys,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const EQUAL_VERDICT: &str = "Responses are equal";
pub const NOT_EQUAL_VERDICT: &str = "Responses are not equal";

/// Metadata key holding the verdict of the last comparison.
pub const VERDICT_KEY: &str = "ab_verdict";

pub struct AbTestProcessor {
    id: String,
    sender: Arc<dyn ResultSender>,
    /// Labels of the A and B sides, matching the forwarding processors' labels.
    names: (String, String),
    relay_a: bool,
}

impl AbTestProcessor {
    pub fn new(id: impl Into<String>, sender: Arc<dyn ResultSender>) -> Self {
        Self {
            id: id.into(),
            sender,
            names: ("A".to_string(), "B".to_string()),
            relay_a: false,
        }
    }

    /// Answer with side A's payload instead of the verdict. The verdict is
    /// still recorded under [`VERDICT_KEY`].
    pub fn relay_a(mut self) -> Self {
        self.relay_a = true;
        self
    }

    pub fn with_names(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.names = (a.into(), b.into());
        self
    }

    /// JSON payloads compare structurally (key order is irrelevant), anything
    /// else byte for byte.
    fn same(a: &Payload, b: &Payload) -> bool {
        match (a.as_json(), b.as_json()) {
            (Some(x), Some(y)) => x == y,
            _ => a.to_bytes() == b.to_bytes(),
        }
    }

    fn side(name: &str, payload: &Payload, metadata: &Metadata) -> AbResponse {
        let body = payload
            .to_bytes()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        AbResponse {
            name: name.to_string(),
            body,
            time: metadata.get::<f64>(&timing_key(name)).unwrap_or(0.0),
            error: metadata.get::<String>(&error_key(name)),
        }
    }
}

#[async_trait]
impl Processor for AbTestProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(
        &self,
        ctx: &ProcessorContext<'_>,
        metadata: &mut Metadata,
        inputs: Vec<Payload>,
    ) -> Result<Payload, ProcessorError> {
        let [a, b] = <[Payload; 2]>::try_from(inputs).map_err(|inputs| {
            ProcessorError::invalid_input(
                &self.id,
                format!("expected 2 results to compare, got {}", inputs.len()),
            )
        })?;

        let verdict = if Self::same(&a, &b) {
            EQUAL_VERDICT
        } else {
            NOT_EQUAL_VERDICT
        };
        debug!(request_id = %ctx.request_id, processor = %self.id, verdict, "A/B comparison");
        metadata.set(VERDICT_KEY, &verdict);

        if self.sender.is_enabled() {
            let result = AbResult {
                request: AbRequest {
                    path: metadata.get_str(keys::PATH).unwrap_or_default().to_string(),
                    index_name: metadata.get_str(keys::INDEX).unwrap_or_default().to_string(),
                    body: metadata
                        .get_str(keys::REQUEST_BODY)
                        .unwrap_or_default()
                        .to_string(),
                },
                a: Self::side(&self.names.0, &a, metadata),
                b: Self::side(&self.names.1, &b, metadata),
                request_id: ctx.request_id.to_string(),
                opaque_id: metadata.get::<String>(keys::OPAQUE_ID),
            };
            let sender = Arc::clone(&self.sender);
            tokio::spawn(async move { sender.send(result).await });
        }

        if self.relay_a {
            return Ok(a);
        }
        Ok(Payload::text(format!("{} processor: {}\n", self.id, verdict)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelSender(mpsc::UnboundedSender<AbResult>);

    #[async_trait]
    impl ResultSender for ChannelSender {
        async fn send(&self, result: AbResult) {
            let _ = self.0.send(result);
        }
    }

    struct DisabledSender(Mutex<usize>);

    #[async_trait]
    impl ResultSender for DisabledSender {
        async fn send(&self, _result: AbResult) {
            *self.0.lock() += 1;
        }

        fn is_enabled(&self) -> bool {
            false
        }
    }

    fn ctx() -> ProcessorContext<'static> {
        ProcessorContext::new("req-42", &[])
    }

    #[tokio::test]
    async fn equal_json_ignores_key_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = AbTestProcessor::new("ABTestProcessor", Arc::new(ChannelSender(tx)))
            .with_names("elastic", "shadow");
        let mut md = Metadata::new();
        md.set(keys::PATH, &"/logs/_search");
        md.set(keys::INDEX, &"logs");
        md.set(&timing_key("elastic"), &0.25f64);

        let out = p
            .handle(
                &ctx(),
                &mut md,
                vec![Payload::text(r#"{"a":1,"b":2}"#), Payload::text(r#"{"b":2,"a":1}"#)],
            )
            .await
            .unwrap();
        assert_eq!(out, Payload::text("ABTestProcessor processor: Responses are equal\n"));

        let sent = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.request_id, "req-42");
        assert_eq!(sent.request.index_name, "logs");
        assert_eq!(sent.a.name, "elastic");
        assert_eq!(sent.a.time, 0.25);
        assert_eq!(sent.b.name, "shadow");
    }

    #[tokio::test]
    async fn different_bodies_are_not_equal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let p = AbTestProcessor::new("ab", Arc::new(ChannelSender(tx)));
        let out = p
            .handle(
                &ctx(),
                &mut Metadata::new(),
                vec![Payload::text("response1"), Payload::text("response2")],
            )
            .await
            .unwrap();
        assert_eq!(out, Payload::text("ab processor: Responses are not equal\n"));
    }

    #[tokio::test]
    async fn relay_mode_answers_with_side_a() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let p = AbTestProcessor::new("ab", Arc::new(ChannelSender(tx))).relay_a();
        let mut md = Metadata::new();
        let out = p
            .handle(
                &ctx(),
                &mut md,
                vec![Payload::text("primary"), Payload::text("shadow")],
            )
            .await
            .unwrap();
        assert_eq!(out, Payload::text("primary"));
        assert_eq!(md.get_str(VERDICT_KEY), Some(NOT_EQUAL_VERDICT));
    }

    #[tokio::test]
    async fn wrong_arity_is_invalid_input() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let p = AbTestProcessor::new("ab", Arc::new(ChannelSender(tx)));
        let err = p
            .handle(&ctx(), &mut Metadata::new(), vec![Payload::text("only one")])
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn disabled_sender_is_never_called() {
        let sender = Arc::new(DisabledSender(Mutex::new(0)));
        let p = AbTestProcessor::new("ab", sender.clone());
        p.handle(
            &ctx(),
            &mut Metadata::new(),
            vec![Payload::text("x"), Payload::text("x")],
        )
        .await
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*sender.0.lock(), 0);
    }
}
