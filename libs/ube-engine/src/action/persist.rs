use std::sync::Arc;

use futures::future::BoxFuture;
use ube_api::{Context, Entity, Error, Mandate, Record, Repository};

use super::{Action, ActionBase, Configure};

const PERSIST_BATCH_SIZE: usize = 100;

pub const SAVE_ENTITIES: &str = "SaveEntities";

/// Upserts the entities of a whole sub-batch in one repository call.
///
/// A failed call marks every record that contributed to it.
pub struct Persist<E: Entity> {
    base: ActionBase,
    repo: Arc<dyn Repository<E>>,
}

impl<E: Entity> Persist<E> {
    pub fn new(repo: Arc<dyn Repository<E>>) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopAndRaiseError, PERSIST_BATCH_SIZE).critical(),
            repo,
        }
    }
}

impl<E: Entity> Configure for Persist<E> {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Persist<E> {
    fn name(&self) -> &str {
        "Persister"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![SAVE_ENTITIES]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut entities = Vec::new();
            let mut participants = Vec::new();
            for (i, record) in records.iter_mut().enumerate() {
                if record.id.is_empty() {
                    record.set_error(Error::logic("persist can't handle a record without id"));
                    continue;
                }
                if self.base.skips(record.event_name()) {
                    continue;
                }
                entities.extend(record.entities.iter().cloned());
                participants.push(i);
            }
            if participants.is_empty() {
                return;
            }

            if let Err(e) = self.repo.save_entities(ctx, &entities).await {
                tracing::error!(records = participants.len(), error = %e, "persist sub-batch failed");
                let err = e.with_context("persist records");
                for i in participants {
                    records[i].set_error(err.clone());
                }
                return;
            }
            tracing::info!(action = self.name(), persisted = entities.len(), "persisted entities");
        })
    }
}
