use std::slice;
use std::sync::Arc;

use futures::future::BoxFuture;
use ube_api::envelope;
use ube_api::{Context, Entity, Error, Mandate, Record, Republisher};

use super::publish::PUBLISH_EVENTS;
use super::{Action, ActionBase, Configure};

const REPUBLISH_BATCH_SIZE: usize = 100;

pub const ACK_MESSAGES: &str = "AckMessages";

/// Redelivers records that failed under `StopAndRetry`.
///
/// Registered as an after-each action: it sees every record after every
/// action and only touches those whose last mandate was `StopAndRetry`.
pub struct Republish {
    base: ActionBase,
    republisher: Arc<dyn Republisher>,
    max_attempts: u32,
}

impl Republish {
    pub fn new(republisher: Arc<dyn Republisher>, max_attempts: u32) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopFurtherProcessing, REPUBLISH_BATCH_SIZE),
            republisher,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Publish the redelivery, then acknowledge the original.
    async fn republish<E: Entity>(&self, ctx: &Context, record: &mut Record<E>) -> Result<(), Error> {
        record.increment_republish_attempt();
        record.previous_action_mandate = None;

        let message = envelope::to_message(record, true)?;
        self.republisher
            .publish_events(ctx, slice::from_ref(&message))
            .await
            .map_err(|e| e.with_context(format!("re-publish record '{}'", record.id)))?;

        if let Some(ack) = record.ack_message() {
            self.republisher
                .ack_messages(ctx, slice::from_ref(&ack))
                .await
                .map_err(|e| e.with_context(format!("ack original message of record '{}'", record.id)))?;
        }
        record.event.id.clear();
        record.event.reference.clear();
        record.previous_action_mandate = Some(Mandate::StopFurtherProcessing);
        Ok(())
    }
}

impl Configure for Republish {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Republish {
    fn name(&self) -> &str {
        "Republisher"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![PUBLISH_EVENTS, ACK_MESSAGES]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for record in records.iter_mut() {
                if record.previous_action_mandate != Some(Mandate::StopAndRetry) {
                    continue;
                }
                match record.republish_attempt {
                    None => continue,
                    Some(attempt) if attempt >= self.max_attempts => {
                        tracing::warn!(
                            record = %record.id,
                            attempt,
                            max_attempts = self.max_attempts,
                            "retry attempts exhausted, dropping record"
                        );
                        continue;
                    }
                    Some(_) => {}
                }

                match self.republish(ctx, record).await {
                    Ok(()) => tracing::info!(
                        record = %record.id,
                        attempt = record.republish_attempt,
                        resume_at = record.previous_action,
                        "record republished"
                    ),
                    Err(e) => {
                        tracing::error!(record = %record.id, error = %e, "republish failed");
                        record.set_error(e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use ube_memory::MemoryQueue;

    use super::*;
    use crate::action::testing::{Product, product, record, run};

    fn failed(id: &str, attempt: Option<u32>) -> Record<Product> {
        let mut r = record(id, vec![product(id)]);
        r.set_error(Error::io("downstream unavailable"));
        r.previous_action = 2;
        r.previous_action_mandate = Some(Mandate::StopAndRetry);
        r.republish_attempt = attempt;
        r
    }

    #[tokio::test]
    async fn test_republish_embeds_previous_action_and_acks_original() {
        let queue = Arc::new(MemoryQueue::new());
        let republish = Republish::new(queue.clone(), 3);
        let mut records = vec![failed("a", Some(1)), record("ok", vec![product("ok")])];
        run(&republish, &mut records).await;

        let published = queue.published();
        assert_eq!(published.len(), 1);
        let redelivered: Record<Product> = envelope::decode(published[0].body.as_bytes()).unwrap().unwrap();
        assert_eq!(redelivered.previous_action, 2);
        assert_eq!(redelivered.republish_attempt, Some(2));

        assert_eq!(queue.acked(), vec![ube_api::Message::ack("msg-a", "r")]);
        assert_eq!(records[0].event_id(), "");
        assert_eq!(records[0].event_reference(), "");
        assert_eq!(records[0].previous_action_mandate, Some(Mandate::StopFurtherProcessing));
    }

    #[tokio::test]
    async fn test_exhausted_or_unset_attempts_are_dropped() {
        let queue = Arc::new(MemoryQueue::new());
        let republish = Republish::new(queue.clone(), 3);
        let mut records = vec![failed("a", Some(3)), failed("b", Some(4)), failed("c", None)];
        run(&republish, &mut records).await;

        assert_eq!(queue.publish_failures.calls(), 0);
        assert_eq!(queue.ack_failures.calls(), 0);
        assert_eq!(records[0].event_id(), "msg-a");
    }

    #[tokio::test]
    async fn test_publish_failure_becomes_record_error_without_ack() {
        let queue = Arc::new(MemoryQueue::new());
        queue.publish_failures.fail_always();
        let republish = Republish::new(queue.clone(), 3);
        let mut records = vec![failed("a", Some(1))];
        run(&republish, &mut records).await;

        assert!(records[0].error.as_ref().is_some_and(|e| e.message.contains("re-publish record 'a'")));
        assert_eq!(queue.ack_failures.calls(), 0);
        assert_eq!(records[0].previous_action_mandate, None);
        assert_eq!(records[0].event_id(), "msg-a");
    }

    #[tokio::test]
    async fn test_ack_failure_becomes_record_error() {
        let queue = Arc::new(MemoryQueue::new());
        queue.ack_failures.fail_always();
        let republish = Republish::new(queue.clone(), 3);
        let mut records = vec![failed("a", Some(1))];
        run(&republish, &mut records).await;

        assert_eq!(queue.published().len(), 1);
        assert!(records[0].error.as_ref().is_some_and(|e| e.message.contains("ack original message")));
    }

    #[test]
    fn test_dep_call_names_are_collaborator_operations() {
        let republish = Republish::new(Arc::new(MemoryQueue::new()), 3);
        assert_eq!(Action::<Product>::dep_call_names(&republish), vec!["PublishEvents", "AckMessages"]);
    }
}
