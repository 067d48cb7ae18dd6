//! Pipeline orchestrator.
//!
//! Runs the configured actions strictly in order over the whole record
//! set. Each action sees its records in sub-batches of `batch_size()`;
//! async actions run their sub-batches concurrently over disjoint slices
//! and are joined before anything else happens. After every action the
//! after-each actions (Republish) see the entire record set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use ube_api::envelope;
use ube_api::{Clock, Context, Entity, Error, IdGenerator, Message, Record, SystemClock, UuidGenerator};

use crate::action::Action;
use crate::error::EngineError;
use crate::mandate;
use crate::result::ProcessingResult;

// ═══════════════════════════════════════════════════════════════
//  Pipeline
// ═══════════════════════════════════════════════════════════════

pub struct Pipeline<E: Entity> {
    actions: Vec<Arc<dyn Action<E>>>,
    after_each: Vec<Arc<dyn Action<E>>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    in_flight: InFlight,
}

impl<E: Entity> Pipeline<E> {
    pub fn builder() -> PipelineBuilder<E> {
        PipelineBuilder::default()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// External operation names of every action, for dependency wiring.
    pub fn dep_call_names(&self) -> Vec<(String, Vec<&'static str>)> {
        self.actions
            .iter()
            .chain(&self.after_each)
            .map(|a| (a.name().to_string(), a.dep_call_names()))
            .collect()
    }

    /// Run `inputs` through every action and classify the outcome.
    ///
    /// Record failures never surface as `Err`: they are carried by the
    /// records of the returned result.
    pub async fn invoke(&self, token: CancellationToken, inputs: &[Message]) -> Result<ProcessingResult<E>, EngineError> {
        if inputs.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let ctx = Context::new(token, Arc::clone(&self.clock));

        let mut records = self.ingest(inputs, &ctx);
        let mut claim = self.in_flight.claim(&mut records);
        tracing::info!(records = records.len(), actions = self.actions.len(), "invoking pipeline");

        for (index, action) in self.actions.iter().enumerate() {
            tracing::debug!(action = action.name(), index, batch_size = action.batch_size(), "starting action");
            run_action(&ctx, &mut records, action.as_ref(), index).await;

            if !self.after_each.is_empty() {
                let acked_before: Vec<bool> = records.iter().map(|r| r.ack_message().is_some()).collect();
                for after in &self.after_each {
                    let mut all: Vec<&mut Record<E>> = records.iter_mut().collect();
                    after.process(&ctx, &mut all).await;
                }
                // A record that lost its ack handle was handed back to the
                // source; its redelivered copy must be free to run.
                for (record, had_handle) in records.iter().zip(acked_before) {
                    if had_handle && record.ack_message().is_none() {
                        claim.release(&record.id);
                    }
                }
            }
            tracing::debug!(action = action.name(), index, "finished action");
        }

        let result = ProcessingResult::classify(records);
        tracing::info!(status = ?result.status, failed = result.errors.len(), "pipeline finished");
        Ok(result)
    }

    /// One record per input: a serialized record resumes, anything else
    /// starts fresh.
    fn ingest(&self, inputs: &[Message], ctx: &Context) -> Vec<Record<E>> {
        let now = ctx.now();
        inputs
            .iter()
            .map(|input| match envelope::decode::<E>(input.body.as_bytes()) {
                Ok(Some(mut record)) => {
                    record.event.id = input.id.clone();
                    record.event.reference = input.reference.clone();
                    if record.event.event_source.is_empty() {
                        record.event.event_source = input.source_uri.clone();
                    }
                    record.event.received_at = Some(now);
                    record
                }
                Ok(None) => Record::from_input(self.ids.next_id(), input, now),
                Err(e) => {
                    tracing::warn!(message = %input.id, error = %e, "ingestion failed");
                    let mut record = Record::from_input(self.ids.next_id(), input, now);
                    record.set_error(e.with_context("ingest input"));
                    record
                }
            })
            .collect()
    }
}

/// Partition, filter, process and settle one action over every record.
async fn run_action<E: Entity>(ctx: &Context, records: &mut [Record<E>], action: &dyn Action<E>, index: usize) {
    let size = action.batch_size().max(1);
    if action.is_async() {
        join_all(records.chunks_mut(size).map(|chunk| run_sub_batch(ctx, chunk, action, index))).await;
    } else {
        for chunk in records.chunks_mut(size) {
            run_sub_batch(ctx, chunk, action, index).await;
        }
    }
}

async fn run_sub_batch<E: Entity>(ctx: &Context, chunk: &mut [Record<E>], action: &dyn Action<E>, index: usize) {
    let mut batch: Vec<&mut Record<E>> = Vec::with_capacity(chunk.len());
    for record in chunk.iter_mut() {
        if mandate::is_processable(record, action, index) {
            batch.push(record);
        }
    }
    if batch.is_empty() {
        tracing::debug!(action = action.name(), "no processable records in sub-batch");
        return;
    }

    action.process(ctx, &mut batch).await;

    let now = ctx.now();
    for record in batch.iter_mut() {
        mandate::settle(record, action, index, now);
    }
}

// ═══════════════════════════════════════════════════════════════
//  In-flight registry
// ═══════════════════════════════════════════════════════════════

/// Record ids currently inside an `invoke`, shared by every invocation of
/// one pipeline.
#[derive(Default)]
struct InFlight {
    ids: Mutex<HashSet<String>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("in-flight registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Claim every record id. A record whose id is already claimed gets
    /// an `InFlight` error instead and is never acknowledged.
    fn claim<E>(&self, records: &mut [Record<E>]) -> Claim<'_> {
        let mut ids = self.lock();
        let mut claimed = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            if ids.insert(record.id.clone()) {
                claimed.push(record.id.clone());
            } else {
                tracing::warn!(record = %record.id, "another copy of the record is in flight");
                record.set_error(Error::in_flight(format!("record '{}' is already in flight", record.id)));
            }
        }
        Claim { registry: self, ids: claimed }
    }
}

/// Releases its claimed ids on drop.
struct Claim<'a> {
    registry: &'a InFlight,
    ids: Vec<String>,
}

impl Claim<'_> {
    /// Release `id` before the invocation ends.
    fn release(&mut self, id: &str) {
        if let Some(pos) = self.ids.iter().position(|claimed| claimed == id) {
            self.ids.swap_remove(pos);
            self.registry.lock().remove(id);
            tracing::debug!(record = %id, "released in-flight claim");
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut ids = self.registry.lock();
        for id in &self.ids {
            ids.remove(id);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════

pub struct PipelineBuilder<E: Entity> {
    actions: Vec<Arc<dyn Action<E>>>,
    after_each: Vec<Arc<dyn Action<E>>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl<E: Entity> Default for PipelineBuilder<E> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            after_each: Vec::new(),
            clock: None,
            ids: None,
        }
    }
}

impl<E: Entity> PipelineBuilder<E> {
    pub fn action(mut self, action: impl Action<E> + 'static) -> Self {
        self.actions.push(Arc::new(action));
        self
    }

    pub fn shared_action(mut self, action: Arc<dyn Action<E>>) -> Self {
        self.actions.push(action);
        self
    }

    /// Run `action` over the entire record set after every action.
    pub fn after_each(mut self, action: impl Action<E> + 'static) -> Self {
        self.after_each.push(Arc::new(action));
        self
    }

    pub fn shared_after_each(mut self, action: Arc<dyn Action<E>>) -> Self {
        self.after_each.push(action);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Pipeline<E>, EngineError> {
        if self.actions.is_empty() {
            return Err(EngineError::NoActions);
        }
        Ok(Pipeline {
            actions: self.actions,
            after_each: self.after_each,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            in_flight: InFlight::default(),
        })
    }
}
