use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use ube_api::{Acker, Context, Entity, ErrorKind, Message};

use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::result::ProcessingResult;

/// Queue-facing entry point: runs a batch, logs failures and
/// acknowledges the inbound messages.
///
/// Records re-routed by Republish have no ack handle left and are not
/// acknowledged a second time. A copy rejected because the record is
/// already in flight stays unacknowledged, so the source redelivers it.
pub struct EventHandler<E: Entity> {
    pipeline: Arc<Pipeline<E>>,
    acker: Arc<dyn Acker>,
}

impl<E: Entity> EventHandler<E> {
    pub fn new(pipeline: Arc<Pipeline<E>>, acker: Arc<dyn Acker>) -> Self {
        Self { pipeline, acker }
    }

    /// Handle one inbound batch.
    ///
    /// The combined record error is available through
    /// [`ProcessingResult::error`]; `Err` is reserved for orchestrator and
    /// acknowledgment failures.
    pub async fn handle(&self, token: CancellationToken, inputs: &[Message]) -> Result<ProcessingResult<E>, EngineError> {
        let result = self.pipeline.invoke(token.clone(), inputs).await?;

        for record in result.records.iter() {
            if let Some(err) = &record.error {
                tracing::error!(record = %record.id, event = record.event_name(), error = %err, "record failed");
            }
        }

        let acks: Vec<Message> = result
            .records
            .iter()
            .filter(|r| !r.error.as_ref().is_some_and(|e| e.kind == ErrorKind::InFlight))
            .filter_map(|r| r.ack_message())
            .collect();
        if !acks.is_empty() {
            let ctx = Context::new(token, self.pipeline.clock());
            self.acker
                .ack_messages(&ctx, &acks)
                .await
                .map_err(|e| EngineError::Ack(e).with_context(format!("{} messages", acks.len())))?;
            tracing::debug!(acked = acks.len(), "acknowledged inbound messages");
        }

        if let Some(err) = result.error() {
            tracing::warn!(status = ?result.status, "batch finished with failures:\n{err}");
        }
        Ok(result)
    }
}
