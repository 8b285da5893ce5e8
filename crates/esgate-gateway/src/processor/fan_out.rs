//! Identity node used as the parent of sibling branches.

use async_trait::async_trait;
use esgate_kernel::pipeline::{Metadata, Payload, Processor, ProcessorContext, ProcessorError};

/// Passes its single input through unchanged, so that each child runs
/// against the same upstream payload.
pub struct FanOutProcessor {
    id: String,
}

impl FanOutProcessor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Processor for FanOutProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(
        &self,
        _ctx: &ProcessorContext<'_>,
        _metadata: &mut Metadata,
        inputs: Vec<Payload>,
    ) -> Result<Payload, ProcessorError> {
        let [input] = <[Payload; 1]>::try_from(inputs).map_err(|inputs| {
            ProcessorError::invalid_input(
                &self.id,
                format!("expected a single input, got {}", inputs.len()),
            )
        })?;
        Ok(input)
    }
}
