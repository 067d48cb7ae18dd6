use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use ube_api::{Context, Entity, Error, Key, Mandate, Record, Repository};

use super::{Action, ActionBase, Configure};

const ENRICH_BATCH_SIZE: usize = 1000;

pub const GET_ENTITY: &str = "GetEntity";
pub const ENTITY_EXISTS: &str = "EntityExists";

/// One enrichment step over a record's entities.
///
/// Returns how many entities it enriched. An `Err` stops the remaining
/// steps for that record.
pub trait Enricher<E: Entity>: Send + Sync {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>>;
}

/// Runs the configured enrichers in order over every record.
pub struct Enrich<E: Entity> {
    base: ActionBase,
    enrichers: Vec<Arc<dyn Enricher<E>>>,
}

impl<E: Entity> Enrich<E> {
    pub fn new(enrichers: Vec<Arc<dyn Enricher<E>>>) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopAndRaiseError, ENRICH_BATCH_SIZE),
            enrichers,
        }
    }
}

impl<E: Entity> Configure for Enrich<E> {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Enrich<E> {
    fn name(&self) -> &str {
        "Enricher"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![GET_ENTITY, ENTITY_EXISTS]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut enriched = 0;
            for record in records.iter_mut() {
                if self.base.skips(record.event_name()) {
                    continue;
                }
                for enricher in &self.enrichers {
                    match enricher.enrich(ctx, record).await {
                        Ok(n) => enriched += n,
                        Err(e) => {
                            tracing::warn!(record = %record.id, error = %e, "enrich failed");
                            let err = e.with_context(format!("enrich record '{}'", record.id));
                            record.set_error(err);
                            break;
                        }
                    }
                }
            }
            tracing::info!(action = self.name(), enriched, "enriched entities");
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Composition
// ═══════════════════════════════════════════════════════════════

/// Enrichers applied in sequence; the first failure stops the chain.
pub struct EnrichChain<E: Entity>(pub Vec<Arc<dyn Enricher<E>>>);

impl<E: Entity> Enricher<E> for EnrichChain<E> {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let mut enriched = 0;
            for enricher in &self.0 {
                enriched += enricher.enrich(ctx, record).await?;
            }
            Ok(enriched)
        })
    }
}

/// Dispatch by event name. A record whose event has no mapping fails.
pub struct EnricherMapping<E: Entity> {
    by_event: HashMap<String, Arc<dyn Enricher<E>>>,
}

impl<E: Entity> EnricherMapping<E> {
    pub fn new() -> Self {
        Self { by_event: HashMap::new() }
    }

    pub fn on(mut self, event_name: impl Into<String>, enricher: Arc<dyn Enricher<E>>) -> Self {
        self.by_event.insert(event_name.into(), enricher);
        self
    }
}

impl<E: Entity> Default for EnricherMapping<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Enricher<E> for EnricherMapping<E> {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let enricher = self
                .by_event
                .get(record.event_name())
                .cloned()
                .ok_or_else(|| Error::config(format!("no enricher for event '{}'", record.event_name())))?;
            enricher.enrich(ctx, record).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  WithSubEntity
// ═══════════════════════════════════════════════════════════════

/// Typed accessor for a sub-entity slot of `E`: where its key lives and
/// how the fetched value is written back.
pub struct SubEntityField<E, S> {
    pub name: &'static str,
    pub key: fn(&E) -> Option<Key>,
    pub set: fn(&mut E, S),
}

impl<E, S> Clone for SubEntityField<E, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, S> Copy for SubEntityField<E, S> {}

impl<E, S> fmt::Debug for SubEntityField<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubEntityField").field("name", &self.name).finish()
    }
}

/// Attach a related entity fetched by key from its repository.
///
/// Entities are replaced only when every fetch succeeds; on failure the
/// record keeps its original entities.
pub struct WithSubEntity<E, S: Entity> {
    field: SubEntityField<E, S>,
    repo: Arc<dyn Repository<S>>,
}

impl<E: Entity, S: Entity> WithSubEntity<E, S> {
    pub fn new(field: SubEntityField<E, S>, repo: Arc<dyn Repository<S>>) -> Self {
        Self { field, repo }
    }

    async fn attach(&self, ctx: &Context, entity: &E) -> Result<E, Error> {
        let name = self.field.name;
        let key = (self.field.key)(entity).ok_or_else(|| Error::validation(format!("sub-entity '{name}' key is not set")))?;
        let sub = self
            .repo
            .get_entity(ctx, &key)
            .await
            .map_err(|e| e.with_context(format!("get sub-entity '{name}' with key '{key}'")))?;

        let mut updated = entity.clone();
        (self.field.set)(&mut updated, sub);
        Ok(updated)
    }
}

impl<E: Entity, S: Entity> Enricher<E> for WithSubEntity<E, S> {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let mut updated = Vec::with_capacity(record.entities.len());
            for entity in &record.entities {
                updated.push(self.attach(ctx, entity).await?);
            }
            let enriched = updated.len();
            record.entities = updated;
            record.update_metadata(ctx.now());
            Ok(enriched)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  WithPatchOriginal
// ═══════════════════════════════════════════════════════════════

/// Explicit field override applied to a patch before merging.
///
/// The value type is fixed by the setter, so a mismatched override does
/// not compile.
pub struct Override<E> {
    field: &'static str,
    apply: Arc<dyn Fn(&mut E) + Send + Sync>,
}

impl<E: 'static> Override<E> {
    pub fn new<T>(field: &'static str, setter: fn(&mut E, T), value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            field,
            apply: Arc::new(move |entity: &mut E| setter(entity, value.clone())),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }
}

impl<E> Clone for Override<E> {
    fn clone(&self) -> Self {
        Self { field: self.field, apply: Arc::clone(&self.apply) }
    }
}

impl<E> fmt::Debug for Override<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Override").field("field", &self.field).finish()
    }
}

/// Treat each entity as a patch of the stored original: apply overrides
/// to the patch, then merge it over the original with non-empty patch
/// fields winning.
pub struct WithPatchOriginal<E: Entity> {
    repo: Arc<dyn Repository<E>>,
    overrides: Vec<Override<E>>,
}

impl<E: Entity> WithPatchOriginal<E> {
    pub fn new(repo: Arc<dyn Repository<E>>, overrides: Vec<Override<E>>) -> Self {
        Self { repo, overrides }
    }

    async fn patch(&self, ctx: &Context, entity: &E) -> Result<E, Error> {
        let key = entity.key();
        let original = self
            .repo
            .get_entity(ctx, &key)
            .await
            .map_err(|e| e.with_context(format!("get original with key '{key}'")))?;

        let mut patch = entity.clone();
        for field in &self.overrides {
            tracing::debug!(field = field.field(), key = %key, "override patch field");
            (field.apply)(&mut patch);
        }

        let mut merged = serde_json::to_value(&original)?;
        merge_non_empty(&mut merged, serde_json::to_value(&patch)?);
        serde_json::from_value(merged).map_err(|e| Error::from(e).with_context(format!("merge patch for key '{key}'")))
    }
}

impl<E: Entity> Enricher<E> for WithPatchOriginal<E> {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let mut merged = Vec::with_capacity(record.entities.len());
            for entity in &record.entities {
                merged.push(self.patch(ctx, entity).await?);
            }
            let enriched = merged.len();
            record.entities = merged;
            record.update_metadata(ctx.now());
            Ok(enriched)
        })
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Deep merge: objects merge per key, any other non-empty patch value
/// replaces the original.
fn merge_non_empty(original: &mut Value, patch: Value) {
    match (original, patch) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(slot) => merge_non_empty(slot, value),
                    None if !is_empty_value(&value) => {
                        dst.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (dst, src) => {
            if !is_empty_value(&src) {
                *dst = src;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  WithDedupe
// ═══════════════════════════════════════════════════════════════

/// Fail the record when any of its entities already exists.
pub struct WithDedupe<E: Entity> {
    repo: Arc<dyn Repository<E>>,
}

impl<E: Entity> WithDedupe<E> {
    pub fn new(repo: Arc<dyn Repository<E>>) -> Self {
        Self { repo }
    }
}

impl<E: Entity> Enricher<E> for WithDedupe<E> {
    fn enrich<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            for entity in &record.entities {
                let key = entity.key();
                let exists = self
                    .repo
                    .entity_exists(ctx, &key)
                    .await
                    .map_err(|e| e.with_context(format!("check existence of key '{key}'")))?;
                if exists {
                    return Err(Error::duplicate(format!("attempt to create a duplicate for key '{key}'")));
                }
            }
            tracing::debug!(record = %record.id, "de-duplicated");
            Ok(record.entities.len())
        })
    }
}
