//! In-memory collaborators and the catalogue pipeline wired over them.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use ube_api::Message;
use ube_engine::action::{
    EnrichChain, Enricher, EnricherMapping, RecordsFromKey, TransformFn, WithDedupe, WithPatchOriginal, WithSubEntity,
};
use ube_engine::{
    Action, Configure, EngineError, Enrich, EventHandler, Persist, Pipeline, PipelineConfig, Publish, Republish, Status,
    Transform, Upload,
};
use ube_memory::{FailureSwitch, MemoryBlobStore, MemoryQueue, MemoryRepository};

use crate::config::ReplayConfig;
use crate::model::{Product, Store, store_field};

pub struct Rig {
    pub products: Arc<MemoryRepository<Product>>,
    pub stores: Arc<MemoryRepository<Store>>,
    pub blobs: Arc<MemoryBlobStore>,
    /// Inbound queue: acknowledgments and redeliveries.
    pub inbound: Arc<MemoryQueue>,
    /// Downstream topic for processed events.
    pub outbound: Arc<MemoryQueue>,
}

/// Totals of one replay, printed as JSON.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub rounds: usize,
    pub batches: usize,
    pub records: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub redelivered: usize,
    pub published: usize,
    pub stored: usize,
    /// Redeliveries still queued when the round limit was reached.
    pub pending: usize,
}

fn arm(switch: &FailureSwitch, calls: &[usize]) {
    for &n in calls {
        switch.fail_on_call(n);
    }
}

/// Apply the `[pipeline.actions.<name>]` overrides to `action`.
fn configured<A: Action<Product> + Configure>(action: A, config: &PipelineConfig) -> A {
    let options = config.options_for(action.name());
    action.with_options(options)
}

impl Rig {
    pub fn new(config: &ReplayConfig) -> Self {
        let rig = Self {
            products: Arc::new(MemoryRepository::with_entities(config.products.clone())),
            stores: Arc::new(MemoryRepository::with_entities(config.stores.clone())),
            blobs: Arc::new(MemoryBlobStore::new(config.blob.clone())),
            inbound: Arc::new(MemoryQueue::new()),
            outbound: Arc::new(MemoryQueue::new()),
        };
        arm(&rig.products.save_failures, &config.faults.save_calls);
        arm(&rig.outbound.publish_failures, &config.faults.publish_calls);
        for key in &config.faults.upload_keys {
            rig.blobs.fail_uploads_of(key.clone());
        }
        rig
    }

    /// Transform, Enrich, Upload, Persist, Publish; Republish after each
    /// action when `[pipeline.republish]` is present.
    pub fn pipeline(&self, config: &PipelineConfig) -> Result<Pipeline<Product>, EngineError> {
        let sub_entity: Arc<dyn Enricher<Product>> = Arc::new(WithSubEntity::new(store_field(), self.stores.clone()));
        let create: Vec<Arc<dyn Enricher<Product>>> =
            vec![Arc::new(WithDedupe::new(self.products.clone())), sub_entity.clone()];
        let update: Vec<Arc<dyn Enricher<Product>>> =
            vec![Arc::new(WithPatchOriginal::new(self.products.clone(), Vec::new())), sub_entity];
        let mapping = EnricherMapping::<Product>::new()
            .on("CreateProduct", Arc::new(EnrichChain(create)))
            .on("UpdateProduct", Arc::new(EnrichChain(update)));
        let transforms: Vec<Arc<dyn TransformFn<Product>>> = vec![Arc::new(RecordsFromKey::new("product", "replay"))];

        let mut builder = Pipeline::builder()
            .action(configured(Transform::new(transforms), config))
            .action(configured(Enrich::<Product>::new(vec![Arc::new(mapping)]), config))
            .action(configured(Upload::new(self.blobs.clone()), config))
            .action(configured(Persist::new(self.products.clone()), config))
            .action(configured(Publish::new(self.outbound.clone()), config));

        if let Some(republish) = &config.republish {
            builder = builder.after_each(configured(Republish::new(self.inbound.clone(), republish.max_attempts), config));
        }
        builder.build()
    }

    /// Run `inputs` in batches, then feed redeliveries back until the
    /// inbound queue is quiet or `max_rounds` is spent.
    pub async fn replay(
        &self,
        handler: &EventHandler<Product>,
        token: CancellationToken,
        inputs: Vec<Message>,
        batch_size: usize,
        max_rounds: usize,
    ) -> Result<Summary, EngineError> {
        let mut summary = Summary::default();
        let mut pending = inputs;
        let mut round = 0;

        while !pending.is_empty() {
            if token.is_cancelled() {
                tracing::warn!(round, "replay cancelled");
                break;
            }
            if round > max_rounds {
                summary.pending = pending.len();
                tracing::warn!(pending = summary.pending, "round limit reached, redeliveries left queued");
                break;
            }

            for batch in pending.chunks(batch_size.max(1)) {
                let result = handler.handle(token.clone(), batch).await?;
                summary.batches += 1;
                summary.records += result.records.len();
                let failed = result.records.iter().filter(|r| !r.is_ok()).count();
                summary.failed += failed;
                summary.succeeded += result.records.len() - failed;
                if result.status != Status::Succeeded {
                    tracing::info!(round, status = ?result.status, failed, "batch settled");
                }
            }
            summary.rounds = round + 1;

            // Redeliveries are acknowledged under a fresh queue reference.
            pending = self
                .inbound
                .drain_published()
                .into_iter()
                .enumerate()
                .map(|(i, m)| m.with_reference(format!("redelivery-{}-{i}", round + 1)))
                .collect();
            summary.redelivered += pending.len();
            round += 1;
        }

        summary.published = self.outbound.published().len();
        summary.stored = self.products.len().await;
        Ok(summary)
    }
}
