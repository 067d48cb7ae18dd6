use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use ube_api::{Context, Downloader, Entity, Error, Mandate, Record};

use super::{Action, ActionBase, Configure};

const TRANSFORM_BATCH_SIZE: usize = 100;

/// Dependency name declared when a transform downloads from a bucket.
pub const DOWNLOAD_FILE_FROM_BUCKET: &str = "DownloadFileFromBucket";

/// One step of the Transform chain: rewrites a record's classification
/// and working body before the body is decoded into entities.
///
/// Returns how many records it transformed (0 when the input shape did
/// not apply).
pub trait TransformFn<E: Entity>: Send + Sync {
    fn transform<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>>;

    fn dep_call_names(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Classifies raw inputs and decodes them into entities.
pub struct Transform<E: Entity> {
    base: ActionBase,
    transforms: Vec<Arc<dyn TransformFn<E>>>,
}

impl<E: Entity> Transform<E> {
    pub fn new(transforms: Vec<Arc<dyn TransformFn<E>>>) -> Self {
        Self {
            base: ActionBase::new(Mandate::StopAndRaiseError, TRANSFORM_BATCH_SIZE).critical(),
            transforms,
        }
    }

    async fn transform_record(&self, ctx: &Context, record: &mut Record<E>) -> Result<usize, Error> {
        let mut transformed = 0;
        for transform in &self.transforms {
            transformed += transform
                .transform(ctx, record)
                .await
                .map_err(|e| e.with_context(format!("transform event '{}'", record.id)))?;
        }

        record.entities = decode_entities(record)?;
        record.body = None;
        Ok(transformed)
    }
}

impl<E: Entity> Configure for Transform<E> {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Transform<E> {
    fn name(&self) -> &str {
        "InputTransformer"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for transform in &self.transforms {
            for name in transform.dep_call_names() {
                if !names.contains(name) {
                    names.push(*name);
                }
            }
        }
        names
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut transformed = 0;
            for record in records.iter_mut() {
                // Already decoded: a redelivered record past this stage.
                if record.body.is_none() {
                    if !record.entities.is_empty() {
                        continue;
                    }
                    record.body = record.raw_data.first().cloned();
                }

                match self.transform_record(ctx, record).await {
                    Ok(n) => transformed += n,
                    Err(e) => {
                        tracing::warn!(record = %record.id, error = %e, "transform failed");
                        record.set_error(e);
                    }
                }
            }
            tracing::info!(action = self.name(), transformed, "transformed records");
        })
    }
}

/// Decode the working body: a single entity first, then a homogeneous
/// list. Every decoded entity is validated.
fn decode_entities<E: Entity>(record: &Record<E>) -> Result<Vec<E>, Error> {
    let body = record
        .body
        .as_deref()
        .ok_or_else(|| Error::decode(format!("record '{}' has no body to decode", record.id)))?;

    let entities = match serde_json::from_slice::<E>(body) {
        Ok(entity) => vec![entity],
        Err(single) => {
            tracing::debug!(record = %record.id, error = %single, "body is not a single entity, trying a list");
            serde_json::from_slice::<Vec<E>>(body)
                .map_err(|e| Error::from(e).with_context(format!("unmarshal input body of record '{}'", record.id)))?
        }
    };

    for entity in &entities {
        entity
            .validate()
            .map_err(|e| e.with_context(format!("invalid input event '{}'", record.id)))?;
    }
    Ok(entities)
}

// ---------------------------------------------------------------------------
// Transform functions
// ---------------------------------------------------------------------------

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn classify<E>(record: &mut Record<E>, category: &str, source: &str) {
    record.event.event_category = category.to_string();
    record.source = source.to_string();
}

/// Name every record `"Create" + TitleCase(category)`.
#[derive(Debug, Clone)]
pub struct CreateEvent {
    category: String,
    source: String,
}

impl CreateEvent {
    pub fn new(category: impl Into<String>, source: impl Into<String>) -> Self {
        Self { category: category.into(), source: source.into() }
    }
}

impl<E: Entity> TransformFn<E> for CreateEvent {
    fn transform<'a>(&'a self, _ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            classify(record, &self.category, &self.source);
            record.event.event_name = format!("Create{}", title_case(&self.category));
            Ok(1)
        })
    }
}

/// Name records by the source URI of their inbound input.
#[derive(Debug, Clone)]
pub struct EventFromQueueSource {
    category: String,
    source: String,
    names: HashMap<String, String>,
}

impl EventFromQueueSource {
    pub fn new(category: impl Into<String>, source: impl Into<String>, names: HashMap<String, String>) -> Self {
        Self { category: category.into(), source: source.into(), names }
    }
}

impl<E: Entity> TransformFn<E> for EventFromQueueSource {
    fn transform<'a>(&'a self, _ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let name = self.names.get(&record.event.event_source).ok_or_else(|| {
                Error::config(format!("no event name for source '{}'", record.event.event_source))
            })?;
            record.event.event_name = name.clone();
            classify(record, &self.category, &self.source);
            Ok(1)
        })
    }
}

/// Body `{"<EventName>": payload}` with exactly one key: the key names the
/// event, the payload becomes the body. Other shapes are left untouched.
#[derive(Debug, Clone)]
pub struct RecordsFromKey {
    category: String,
    source: String,
}

impl RecordsFromKey {
    pub fn new(category: impl Into<String>, source: impl Into<String>) -> Self {
        Self { category: category.into(), source: source.into() }
    }
}

impl<E: Entity> TransformFn<E> for RecordsFromKey {
    fn transform<'a>(&'a self, _ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let Some(body) = record.body.as_deref() else {
                return Ok(0);
            };
            let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) else {
                return Ok(0);
            };
            if map.len() != 1 {
                return Ok(0);
            }
            let Some((name, payload)) = map.into_iter().next() else {
                return Ok(0);
            };

            record.body = Some(serde_json::to_vec(&payload)?);
            record.event.event_name = name;
            classify(record, &self.category, &self.source);
            Ok(1)
        })
    }
}

/// Body `{"<file_key>": {"bucket": .., "key": ..}}`: download the file and
/// make it the body. Other shapes are left untouched.
pub struct RecordsFromFilePointer {
    file_key: String,
    category: String,
    source: String,
    event_name: String,
    downloader: Arc<dyn Downloader>,
}

impl RecordsFromFilePointer {
    pub fn new(
        file_key: impl Into<String>,
        category: impl Into<String>,
        source: impl Into<String>,
        event_name: impl Into<String>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            file_key: file_key.into(),
            category: category.into(),
            source: source.into(),
            event_name: event_name.into(),
            downloader,
        }
    }
}

impl fmt::Debug for RecordsFromFilePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordsFromFilePointer")
            .field("file_key", &self.file_key)
            .field("event_name", &self.event_name)
            .finish()
    }
}

impl<E: Entity> TransformFn<E> for RecordsFromFilePointer {
    fn transform<'a>(&'a self, ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            classify(record, &self.category, &self.source);
            record.event.event_name = self.event_name.clone();

            let Some(body) = record.body.as_deref() else {
                return Ok(0);
            };
            let pointer: serde_json::Map<String, serde_json::Value> =
                serde_json::from_slice(body).map_err(|e| Error::from(e).with_context("decode file pointer"))?;
            if pointer.len() > 1 {
                return Ok(0);
            }
            let Some(location) = pointer.get(&self.file_key).and_then(|v| v.as_object()) else {
                return Ok(0);
            };
            let (Some(bucket), Some(key)) = (
                location.get("bucket").and_then(|v| v.as_str()),
                location.get("key").and_then(|v| v.as_str()),
            ) else {
                return Ok(0);
            };

            let file = self
                .downloader
                .download_file_from_bucket(ctx, bucket, key)
                .await
                .map_err(|e| e.with_context(format!("download '{bucket}/{key}'")))?;
            record.body = Some(file);
            Ok(1)
        })
    }

    fn dep_call_names(&self) -> &'static [&'static str] {
        &[DOWNLOAD_FILE_FROM_BUCKET]
    }
}

/// Decode the body as feed type `F` (single or list), convert each item
/// into the entity type and re-encode the body.
pub struct FeedToModel<F> {
    _feed: PhantomData<fn() -> F>,
}

impl<F> FeedToModel<F> {
    pub fn new() -> Self {
        Self { _feed: PhantomData }
    }
}

impl<F> Default for FeedToModel<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F, E> TransformFn<E> for FeedToModel<F>
where
    F: DeserializeOwned + 'static,
    E: Entity + TryFrom<F>,
    <E as TryFrom<F>>::Error: fmt::Display,
{
    fn transform<'a>(&'a self, _ctx: &'a Context, record: &'a mut Record<E>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let Some(body) = record.body.as_deref() else {
                return Ok(0);
            };
            let convert = |feed: F| E::try_from(feed).map_err(|e| Error::validation(format!("convert feed: {e}")));

            let (encoded, count) = match serde_json::from_slice::<F>(body) {
                Ok(feed) => (serde_json::to_vec(&convert(feed)?)?, 1),
                Err(_) => {
                    let feeds: Vec<F> =
                        serde_json::from_slice(body).map_err(|e| Error::from(e).with_context("decode feed"))?;
                    let count = feeds.len();
                    let entities = feeds.into_iter().map(convert).collect::<Result<Vec<E>, Error>>()?;
                    (serde_json::to_vec(&entities)?, count)
                }
            };
            record.body = Some(encoded);
            Ok(count)
        })
    }
}
