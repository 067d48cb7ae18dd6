use std::sync::Arc;

use futures::future::BoxFuture;
use ube_api::{Context, Entity, Mandate, Record, Service};

use super::{Action, ActionBase, Configure};

const SERVICE_BATCH_SIZE: usize = 100;

pub const EXECUTE: &str = "Execute";

/// Hands each sub-batch to an injected domain executor.
pub struct ServiceAction<E: Entity> {
    base: ActionBase,
    service: Arc<dyn Service<E>>,
}

impl<E: Entity> ServiceAction<E> {
    pub fn new(service: Arc<dyn Service<E>>) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopFurtherProcessing, SERVICE_BATCH_SIZE).critical(),
            service,
        }
    }
}

impl<E: Entity> Configure for ServiceAction<E> {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for ServiceAction<E> {
    fn name(&self) -> &str {
        "Service"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![EXECUTE]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut batch: Vec<&mut Record<E>> = records
                .iter_mut()
                .filter(|r| !self.base.skips(r.event_name()))
                .map(|r| &mut **r)
                .collect();
            if batch.is_empty() {
                return;
            }

            if let Err(e) = self.service.execute(ctx, &mut batch).await {
                tracing::error!(records = batch.len(), error = %e, "service execution failed");
                let err = e.with_context("execute service");
                for record in batch.iter_mut() {
                    record.set_error(err.clone());
                }
            }
        })
    }
}
