//! Processor trees and request-time dispatch.
//!
//! A pipeline's processors form a linear chain of roots; each root may own
//! children. A node runs its own [`Processor::handle`] on its inputs, then
//! every child runs independently against that node's output and the child
//! outputs are concatenated in declaration order:
//!
//! ```text
//!  handler payload
//!        │
//!        ▼
//!    ┌───────┐      ┌──────────┐
//!    │ root1 │─────►│ child 1a │──► out 1a ┐
//!    └───────┘  └──►│ child 1b │──► out 1b ┴─► [1a, 1b] ──► root2 ──► …
//!                   └──────────┘
//! ```
//!
//! A leaf node contributes its own output. Siblings run concurrently, each on
//! its own copy of the metadata; their changes are merged back in declaration
//! order and the first sibling to change a key keeps it. Panics anywhere in
//! the tree are caught by [`catch_panic`] and turned into
//! [`ProcessorError::Panicked`].

mod ab_test;
mod fan_out;
mod forward;
mod sql;

pub use ab_test::{AbTestProcessor, EQUAL_VERDICT, NOT_EQUAL_VERDICT, VERDICT_KEY};
pub use fan_out::FanOutProcessor;
pub use forward::{BackendForwardProcessor, error_key, timing_key};
pub use sql::SqlQueryProcessor;

use esgate_kernel::pipeline::{
    Metadata, Payload, PipelineError, Processor, ProcessorContext, ProcessorError,
};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

// ─────────────────────────────────────────────────────────────────────────────
// ProcessorNode
// ─────────────────────────────────────────────────────────────────────────────

/// One node of a processor tree. Owns its children.
pub struct ProcessorNode {
    processor: Box<dyn Processor>,
    children: Vec<ProcessorNode>,
}

impl ProcessorNode {
    pub fn new(processor: impl Processor + 'static) -> Self {
        Self {
            processor: Box::new(processor),
            children: Vec::new(),
        }
    }

    /// Append a child that runs against this node's output.
    pub fn add_processor(&mut self, child: impl Into<ProcessorNode>) -> &mut Self {
        self.children.push(child.into());
        self
    }

    /// Builder form of [`add_processor`](Self::add_processor).
    pub fn with_child(mut self, child: impl Into<ProcessorNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn id(&self) -> &str {
        self.processor.id()
    }

    pub fn children(&self) -> &[ProcessorNode] {
        &self.children
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }

    /// Initialise this node, then its children depth-first.
    pub(crate) fn init(&mut self) -> Result<(), PipelineError> {
        let id = self.processor.id().to_string();
        self.processor
            .init()
            .map_err(|e| PipelineError::ProcessorInit(id, e.to_string()))?;
        self.children.iter_mut().try_for_each(ProcessorNode::init)
    }

    fn run<'a>(
        &'a self,
        ctx: &'a ProcessorContext<'a>,
        metadata: &'a mut Metadata,
        inputs: Vec<Payload>,
    ) -> BoxFuture<'a, Result<Vec<Payload>, ProcessorError>> {
        async move {
            let output = self.processor.handle(ctx, metadata, inputs).await?;
            if self.children.is_empty() {
                return Ok(vec![output]);
            }
            let base = metadata.clone();
            let branches = self.children.iter().map(|child| {
                let mut branch = base.clone();
                let input = output.clone();
                async move {
                    let outputs = child.run(ctx, &mut branch, vec![input]).await?;
                    Ok::<_, ProcessorError>((outputs, branch))
                }
            });
            let results = try_join_all(branches).await?;

            let mut outputs = Vec::with_capacity(results.len());
            for (branch_outputs, branch) in results {
                outputs.extend(branch_outputs);
                metadata.merge_branch(&base, branch);
            }
            Ok(outputs)
        }
        .boxed()
    }
}

impl<P: Processor + 'static> From<P> for ProcessorNode {
    fn from(processor: P) -> Self {
        ProcessorNode::new(processor)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProcessorChain
// ─────────────────────────────────────────────────────────────────────────────

/// The ordered root nodes of one pipeline.
#[derive(Default)]
pub struct ProcessorChain {
    roots: Vec<ProcessorNode>,
}

impl ProcessorChain {
    pub fn new(roots: Vec<ProcessorNode>) -> Self {
        Self { roots }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> &[ProcessorNode] {
        &self.roots
    }

    pub(crate) fn init(&mut self) -> Result<(), PipelineError> {
        self.roots.iter_mut().try_for_each(ProcessorNode::init)
    }

    /// Run `input` through every root in order. Each root receives the full
    /// output list of the previous one.
    pub async fn dispatch(
        &self,
        ctx: &ProcessorContext<'_>,
        metadata: &mut Metadata,
        input: Payload,
    ) -> Result<Vec<Payload>, ProcessorError> {
        let mut current = vec![input];
        for root in &self.roots {
            current = root.run(ctx, metadata, current).await?;
        }
        Ok(current)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Panic boundary
// ─────────────────────────────────────────────────────────────────────────────

/// Await `fut`, converting a panic into [`ProcessorError::Panicked`].
pub async fn catch_panic<T, F>(fut: F) -> Result<T, ProcessorError>
where
    F: Future<Output = Result<T, ProcessorError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ProcessorError::Panicked(panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Appends `{id}\n` to every byte input and concatenates them.
    struct Tag(&'static str);

    #[async_trait]
    impl Processor for Tag {
        fn id(&self) -> &str {
            self.0
        }

        async fn handle(
            &self,
            _ctx: &ProcessorContext<'_>,
            metadata: &mut Metadata,
            inputs: Vec<Payload>,
        ) -> Result<Payload, ProcessorError> {
            let mut seen: Vec<String> = metadata.get("seen").unwrap_or_default();
            seen.push(self.0.to_string());
            metadata.set("seen", &seen);

            let mut out = Vec::new();
            for input in inputs {
                out.extend(input.to_bytes().unwrap_or_default());
                out.extend(format!("{}\n", self.0).into_bytes());
            }
            Ok(Payload::Bytes(out))
        }
    }

    struct Boom;

    #[async_trait]
    impl Processor for Boom {
        fn id(&self) -> &str {
            "boom"
        }

        async fn handle(
            &self,
            _ctx: &ProcessorContext<'_>,
            _metadata: &mut Metadata,
            _inputs: Vec<Payload>,
        ) -> Result<Payload, ProcessorError> {
            panic!("processor exploded");
        }
    }

    struct FailingInit;

    #[async_trait]
    impl Processor for FailingInit {
        fn id(&self) -> &str {
            "failing-init"
        }

        fn init(&mut self) -> Result<(), ProcessorError> {
            Err(ProcessorError::Init("no schema".into()))
        }

        async fn handle(
            &self,
            _ctx: &ProcessorContext<'_>,
            _metadata: &mut Metadata,
            inputs: Vec<Payload>,
        ) -> Result<Payload, ProcessorError> {
            Ok(inputs.into_iter().next().unwrap_or(Payload::Empty))
        }
    }

    fn ctx() -> ProcessorContext<'static> {
        ProcessorContext::new("req-1", &[])
    }

    fn text(p: &Payload) -> String {
        String::from_utf8(p.to_bytes().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn children_fan_out_from_parent_output() {
        let chain = ProcessorChain::new(vec![
            ProcessorNode::new(Tag("ingest"))
                .with_child(Tag("inner1"))
                .with_child(Tag("inner2")),
        ]);
        let mut md = Metadata::new();
        let out = chain
            .dispatch(&ctx(), &mut md, Payload::text("bulk\n"))
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(text(&out[0]), "bulk\ningest\ninner1\n");
        assert_eq!(text(&out[1]), "bulk\ningest\ninner2\n");
        // each sibling starts from the parent's metadata; the first one to
        // change a key keeps it
        assert_eq!(
            md.get::<Vec<String>>("seen").unwrap(),
            vec!["ingest", "inner1"]
        );
    }

    /// Waits `ms` milliseconds, then records its id under `done.{id}`.
    struct Slow(&'static str, u64);

    #[async_trait]
    impl Processor for Slow {
        fn id(&self) -> &str {
            self.0
        }

        async fn handle(
            &self,
            _ctx: &ProcessorContext<'_>,
            metadata: &mut Metadata,
            _inputs: Vec<Payload>,
        ) -> Result<Payload, ProcessorError> {
            tokio::time::sleep(std::time::Duration::from_millis(self.1)).await;
            metadata.set(format!("done.{}", self.0), &true);
            Ok(Payload::text(self.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn siblings_run_concurrently() {
        let chain = ProcessorChain::new(vec![
            ProcessorNode::new(Tag("fan"))
                .with_child(Slow("primary", 300))
                .with_child(Slow("shadow", 300)),
        ]);
        let mut md = Metadata::new();
        let started = tokio::time::Instant::now();
        let out = chain
            .dispatch(&ctx(), &mut md, Payload::Empty)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < std::time::Duration::from_millis(600), "took {elapsed:?}");
        assert_eq!(out, vec![Payload::text("primary"), Payload::text("shadow")]);
        assert_eq!(md.get::<bool>("done.primary"), Some(true));
        assert_eq!(md.get::<bool>("done.shadow"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn output_order_follows_declaration_not_completion() {
        let chain = ProcessorChain::new(vec![
            ProcessorNode::new(Tag("fan"))
                .with_child(Slow("slow", 200))
                .with_child(Slow("fast", 10)),
        ]);
        let out = chain
            .dispatch(&ctx(), &mut Metadata::new(), Payload::Empty)
            .await
            .unwrap();
        assert_eq!(out, vec![Payload::text("slow"), Payload::text("fast")]);
    }

    #[tokio::test]
    async fn roots_chain_with_full_output_list() {
        let chain = ProcessorChain::new(vec![
            ProcessorNode::new(Tag("a")).with_child(Tag("b")).with_child(Tag("c")),
            ProcessorNode::new(Tag("join")),
        ]);
        let out = chain
            .dispatch(&ctx(), &mut Metadata::new(), Payload::text(""))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(text(&out[0]), "a\nb\njoin\na\nc\njoin\n");
    }

    #[tokio::test]
    async fn empty_chain_passes_input_through() {
        let out = ProcessorChain::default()
            .dispatch(&ctx(), &mut Metadata::new(), Payload::text("x"))
            .await
            .unwrap();
        assert_eq!(out, vec![Payload::text("x")]);
    }

    #[tokio::test]
    async fn panic_becomes_processor_error() {
        let chain = ProcessorChain::new(vec![ProcessorNode::new(Tag("a")).with_child(Boom)]);
        let mut md = Metadata::new();
        let err = catch_panic(chain.dispatch(&ctx(), &mut md, Payload::Empty))
            .await
            .unwrap_err();
        match err {
            ProcessorError::Panicked(msg) => assert_eq!(msg, "processor exploded"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn init_failure_names_the_processor() {
        let mut chain = ProcessorChain::new(vec![
            ProcessorNode::new(Tag("root")).with_child(FailingInit),
        ]);
        assert_eq!(
            chain.init(),
            Err(PipelineError::ProcessorInit(
                "failing-init".into(),
                "processor initialisation failed: no schema".into()
            ))
        );
    }
}
