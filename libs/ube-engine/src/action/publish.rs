use std::sync::Arc;

use futures::future::BoxFuture;
use ube_api::envelope;
use ube_api::{Context, Entity, Error, Mandate, Publisher, Record};

use super::{Action, ActionBase, Configure};

const PUBLISH_BATCH_SIZE: usize = 100;

pub const PUBLISH_EVENTS: &str = "PublishEvents";

/// Publishes every record of a sub-batch as one outbound call.
///
/// A failed call marks every record that contributed to it.
pub struct Publish {
    base: ActionBase,
    publisher: Arc<dyn Publisher>,
}

impl Publish {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopFurtherProcessing, PUBLISH_BATCH_SIZE),
            publisher,
        }
    }
}

impl Configure for Publish {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Publish {
    fn name(&self) -> &str {
        "Publisher"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![PUBLISH_EVENTS]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut messages = Vec::new();
            let mut participants = Vec::new();
            for (i, record) in records.iter_mut().enumerate() {
                if record.id.is_empty() {
                    record.set_error(Error::logic("publish can't handle a record without id"));
                    continue;
                }
                if self.base.skips(record.event_name()) {
                    continue;
                }
                match envelope::to_message(record, false) {
                    Ok(message) => {
                        messages.push(message);
                        participants.push(i);
                    }
                    Err(e) => record.set_error(e.with_context("serialize record for publishing")),
                }
            }
            if messages.is_empty() {
                return;
            }

            if let Err(e) = self.publisher.publish_events(ctx, &messages).await {
                tracing::error!(records = participants.len(), error = %e, "publish sub-batch failed");
                let err = e.with_context("publish events");
                for i in participants {
                    records[i].set_error(err.clone());
                }
                return;
            }
            tracing::info!(action = "Publisher", published = messages.len(), "published records");
        })
    }
}
