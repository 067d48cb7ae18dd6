//! End-to-end scenarios over the in-memory adapters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ube_api::{Context, Entity, Error, ErrorKind, FixedClock, Key, Mandate, Message, Record, SequentialIds};
use ube_engine::action::{
    CreateEvent, EnricherMapping, RecordsFromKey, SubEntityField, WithDedupe, WithSubEntity, ALERTING_ACTION_NAME,
};
use ube_engine::{
    Action, ActionBase, ActionOption, Configure, Enrich, EventHandler, Persist, Pipeline, PipelineBuilder, Publish,
    Republish, Status, Transform, Upload,
};
use ube_memory::{MemoryBlobStore, MemoryQueue, MemoryRepository};

// ═══════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Product {
    id: String,
    #[serde(default)]
    price: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    store_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    store: Option<Store>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Store {
    id: String,
    city: String,
}

impl Entity for Product {
    fn key(&self) -> Key {
        Key::new(self.id.clone())
    }
}

impl Entity for Store {
    fn key(&self) -> Key {
        Key::new(self.id.clone())
    }
}

fn at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn product(id: &str) -> Product {
    Product { id: id.into(), price: 10, ..Product::default() }
}

/// Inputs `{"id":"p1"}`, `{"id":"p2"}`, ... with ack handles.
fn inputs(n: usize) -> Vec<Message> {
    (1..=n)
        .map(|i| Message::new(format!("m{i}"), format!(r#"{{"id":"p{i}"}}"#)).with_reference(format!("ref{i}")))
        .collect()
}

fn builder() -> PipelineBuilder<Product> {
    Pipeline::builder()
        .action(Transform::new(vec![Arc::new(CreateEvent::new("product", "test"))]))
        .clock(Arc::new(FixedClock(at())))
        .id_generator(Arc::new(SequentialIds::new("rec")))
}

async fn invoke(pipeline: &Pipeline<Product>, inputs: &[Message]) -> ube_engine::ProcessingResult<Product> {
    pipeline.invoke(CancellationToken::new(), inputs).await.unwrap()
}

/// Records the ids of every record it receives, in order.
struct Spy {
    name: &'static str,
    base: ActionBase,
    seen: Mutex<Vec<String>>,
}

impl Spy {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            base: ActionBase::new(Mandate::StopFurtherProcessing, 100),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn critical(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            base: ActionBase::new(Mandate::StopFurtherProcessing, 100).critical(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Action<Product> for Spy {
    fn name(&self) -> &str {
        self.name
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn process<'a, 'r>(&'a self, _ctx: &'a Context, records: &'a mut [&'r mut Record<Product>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut seen = self.seen.lock().unwrap();
            for record in records.iter() {
                assert!(record.error.is_none() || self.is_alerting() || self.is_critical());
                seen.push(record.id.clone());
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Mandates
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_log_and_continue_record_enters_next_action_clean() {
    let blobs = Arc::new(MemoryBlobStore::default());
    blobs.fail_uploads_of("rec-1_0");
    let next = Spy::new("Next");
    let pipeline = builder()
        .action(Upload::new(blobs.clone()))
        .shared_action(next.clone())
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(2)).await;

    assert_eq!(next.seen(), vec!["rec-1", "rec-2"]);
    assert_eq!(result.status, Status::Succeeded);
    assert_eq!(blobs.keys().await, vec!["rec-2_0"]);
}

#[tokio::test]
async fn test_failing_publish_sub_batch_stops_every_record_in_it() {
    let queue = Arc::new(MemoryQueue::new());
    queue.publish_failures.fail_on_call(1);
    let later = Spy::new("Later");
    let pipeline = builder()
        .action(Publish::new(queue.clone()).with_options([ActionOption::BatchSize(2)]))
        .shared_action(later.clone())
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(3)).await;

    let first = result.records[0].error.as_ref().map(|e| e.to_string());
    assert!(first.is_some());
    assert_eq!(first, result.records[1].error.as_ref().map(|e| e.to_string()));
    assert!(result.records[2].is_ok());
    assert_eq!(later.seen(), vec!["rec-3"]);
    assert_eq!(result.status, Status::PartiallyFailed);
}

#[tokio::test]
async fn test_raise_error_reaches_only_the_alerting_action() {
    let existing = Arc::new(MemoryRepository::with_entities([product("p1")]));
    let target = Arc::new(MemoryRepository::<Product>::new());
    let alerter = Spy::new(ALERTING_ACTION_NAME);
    let critical = Spy::critical("Critical");
    let pipeline = builder()
        .action(Enrich::new(vec![Arc::new(WithDedupe::new(existing))]))
        .shared_action(critical.clone())
        .action(Persist::new(target.clone()))
        .shared_action(alerter.clone())
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(2)).await;

    assert_eq!(critical.seen(), vec!["rec-2"]);
    assert_eq!(alerter.seen(), vec!["rec-1", "rec-2"]);
    assert_eq!(target.saved_batches(), vec![vec![product_with_defaults("p2")]]);
    assert_eq!(result.records[0].error.as_ref().map(|e| e.kind), Some(ube_api::ErrorKind::Duplicate));
}

/// Entity as decoded from `{"id": ".."}`.
fn product_with_defaults(id: &str) -> Product {
    Product { id: id.into(), ..Product::default() }
}

#[tokio::test]
async fn test_process_only_critical_actions() {
    let blobs = Arc::new(MemoryBlobStore::default());
    blobs.upload_failures.fail_always();
    let ordinary = Spy::new("Ordinary");
    let critical = Spy::critical("Critical");
    let pipeline = builder()
        .action(Upload::new(blobs).with_options([ActionOption::FailureMandate(Mandate::ProcessOnlyCriticalActions)]))
        .shared_action(ordinary.clone())
        .shared_action(critical.clone())
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(1)).await;

    assert!(ordinary.seen().is_empty());
    assert_eq!(critical.seen(), vec!["rec-1"]);
    assert_eq!(result.status, Status::Failed);
}

// ═══════════════════════════════════════════════════════════════
//  Batching scenarios
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_persist_second_sub_batch_failure_marks_only_its_record() {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    repo.save_failures.fail_on_call(2);
    let pipeline = builder()
        .action(Persist::new(repo.clone()).with_options([ActionOption::BatchSize(2)]))
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(3)).await;

    assert!(result.records[0].is_ok());
    assert!(result.records[1].is_ok());
    assert!(result.records[2].error.is_some());
    assert_eq!(result.status, Status::PartiallyFailed);
    assert_eq!(repo.save_failures.calls(), 2);
    assert_eq!(repo.saved_batches().iter().map(Vec::len).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn test_async_persist_matches_sync_outcome() {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    let pipeline = builder()
        .action(Persist::new(repo.clone()).with_options([ActionOption::BatchSize(2), ActionOption::Async]))
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(5)).await;

    assert!(result.is_success());
    assert_eq!(repo.save_failures.calls(), 3);
    assert_eq!(repo.len().await, 5);
}

#[tokio::test]
async fn test_dedupe_keeps_existing_entity_out_of_persist() {
    let existing = Arc::new(MemoryRepository::with_entities([product("p1")]));
    let target = Arc::new(MemoryRepository::<Product>::new());
    let pipeline = builder()
        .action(Enrich::new(vec![Arc::new(WithDedupe::new(existing))]))
        .action(Persist::new(target.clone()))
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(2)).await;

    assert!(result.records[0].error.is_some());
    assert!(target.get(&Key::new("p1")).await.is_none());
    assert!(target.get(&Key::new("p2")).await.is_some());
}

// ═══════════════════════════════════════════════════════════════
//  Retry protocol
// ═══════════════════════════════════════════════════════════════

struct RetryRig {
    pipeline: Pipeline<Product>,
    repo: Arc<MemoryRepository<Product>>,
    queue: Arc<MemoryQueue>,
    before: Arc<Spy>,
    after: Arc<Spy>,
}

/// `[0] Transform, [1] Before, [2] Persist (StopAndRetry), [3] After`
/// with Republish (max 3) after each action.
fn retry_rig() -> RetryRig {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    let queue = Arc::new(MemoryQueue::new());
    let before = Spy::new("Before");
    let after = Spy::new("After");
    let pipeline = builder()
        .shared_action(before.clone())
        .action(Persist::new(repo.clone()).with_options([ActionOption::FailureMandate(Mandate::StopAndRetry)]))
        .shared_action(after.clone())
        .after_each(Republish::new(queue.clone(), 3))
        .build()
        .unwrap();
    RetryRig { pipeline, repo, queue, before, after }
}

/// Take the single redelivery off the queue, as the consumer would.
fn redeliver(queue: &MemoryQueue, reference: &str) -> Vec<Message> {
    let published = queue.drain_published();
    assert_eq!(published.len(), 1, "expected one redelivery");
    published.into_iter().map(|m| m.with_reference(reference)).collect()
}

#[tokio::test]
async fn test_first_retry_failure_republishes_and_acks_original() {
    let rig = retry_rig();
    rig.repo.save_failures.fail_always();

    let result = invoke(&rig.pipeline, &inputs(1)).await;

    let record = &result.records[0];
    assert_eq!(record.republish_attempt, Some(2));
    assert_eq!(record.event_id(), "");
    assert_eq!(rig.queue.acked(), vec![Message::ack("m1", "ref1")]);

    let published = rig.queue.published();
    let redelivered: Record<Product> = ube_api::envelope::decode(published[0].body.as_bytes()).unwrap().unwrap();
    assert_eq!(redelivered.previous_action, 2);
    assert_eq!(redelivered.republish_attempt, Some(2));
    assert!(rig.after.seen().is_empty());
}

#[tokio::test]
async fn test_redelivered_record_resumes_at_failed_action() {
    let rig = retry_rig();
    rig.repo.save_failures.fail_on_call(1);

    invoke(&rig.pipeline, &inputs(1)).await;
    assert_eq!(rig.before.seen(), vec!["rec-1"]);

    let result = invoke(&rig.pipeline, &redeliver(&rig.queue, "ref-redelivery")).await;

    // Transform and Before are not run again.
    assert_eq!(rig.before.seen(), vec!["rec-1"]);
    assert_eq!(rig.after.seen(), vec!["rec-1"]);
    assert!(result.is_success());
    let record = &result.records[0];
    assert_eq!(record.republish_attempt, None);
    assert_eq!(record.event.processed_at, Some(at()));
    assert!(rig.repo.get(&Key::new("p1")).await.is_some());
    assert!(rig.queue.published().is_empty());
}

#[tokio::test]
async fn test_exhausted_record_is_never_republished_again() {
    let rig = retry_rig();
    rig.repo.save_failures.fail_always();

    // Failures 1 and 2 republish.
    invoke(&rig.pipeline, &inputs(1)).await;
    invoke(&rig.pipeline, &redeliver(&rig.queue, "ref-2")).await;
    let last = redeliver(&rig.queue, "ref-3");
    assert_eq!(rig.queue.acked().len(), 2);

    // Failure 3 reaches the ceiling and is dropped.
    let result = invoke(&rig.pipeline, &last).await;
    assert_eq!(result.records[0].republish_attempt, Some(3));
    assert_eq!(result.status, Status::Failed);
    assert!(rig.queue.published().is_empty());
    assert_eq!(rig.queue.acked().len(), 2);

    // A further copy (failure 4) issues neither publish nor ack.
    let publishes = rig.queue.publish_failures.calls();
    let acks = rig.queue.ack_failures.calls();
    invoke(&rig.pipeline, &last).await;
    assert_eq!(rig.queue.publish_failures.calls(), publishes);
    assert_eq!(rig.queue.ack_failures.calls(), acks);
}

// ═══════════════════════════════════════════════════════════════
//  Overlapping invocations
// ═══════════════════════════════════════════════════════════════

/// Holds its first call until `open` is notified; later calls pass.
struct Gate {
    base: ActionBase,
    open: tokio::sync::Notify,
    calls: AtomicUsize,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            base: ActionBase::new(Mandate::StopFurtherProcessing, 100),
            open: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Action<Product> for Gate {
    fn name(&self) -> &str {
        "Gate"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn process<'a, 'r>(&'a self, _ctx: &'a Context, _records: &'a mut [&'r mut Record<Product>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.open.notified().await;
            }
        })
    }
}

#[tokio::test]
async fn test_redelivery_runs_while_first_invocation_is_still_in_flight() {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    repo.save_failures.fail_on_call(1);
    let queue = Arc::new(MemoryQueue::new());
    let gate = Gate::new();
    let pipeline = builder()
        .action(Persist::new(repo.clone()).with_options([
            ActionOption::BatchSize(1),
            ActionOption::FailureMandate(Mandate::StopAndRetry),
        ]))
        .shared_action(gate.clone())
        .after_each(Republish::new(queue.clone(), 3))
        .build()
        .unwrap();
    let handler = EventHandler::new(Arc::new(pipeline), queue.clone());

    // The first batch republishes rec-1, then parks in the gate with rec-2.
    let batch = inputs(2);
    let first = handler.handle(CancellationToken::new(), &batch);
    let second = async {
        while queue.published().is_empty() {
            tokio::task::yield_now().await;
        }
        let redelivery = redeliver(&queue, "ref-redelivery");
        let result = handler.handle(CancellationToken::new(), &redelivery).await.unwrap();
        gate.open.notify_one();
        result
    };
    let (first, second) = tokio::join!(first, second);
    let first = first.unwrap();

    assert_eq!(first.records[0].republish_attempt, Some(2));
    assert!(first.records[1].is_ok());
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(second.records[0].id, "rec-1");
    assert!(repo.get(&Key::new("p1")).await.is_some());
    assert_eq!(
        queue.acked(),
        vec![
            Message::ack("m1", "ref1"),
            Message::ack("rec-1", "ref-redelivery"),
            Message::ack("m2", "ref2"),
        ]
    );
    assert!(queue.published().is_empty());
}

#[tokio::test]
async fn test_copy_rejected_while_in_flight_is_left_for_redelivery() {
    let queue = Arc::new(MemoryQueue::new());
    let gate = Gate::new();
    let pipeline = builder().shared_action(gate.clone()).build().unwrap();
    let handler = EventHandler::new(Arc::new(pipeline), queue.clone());

    let mut record = Record::from_input("dup", &Message::default(), at());
    record.event.event_category = "product".into();
    record.entities = vec![product("p1")];
    record.body = None;
    let body = ube_api::envelope::encode(&record, false).unwrap();
    let original = [Message::new("m1", body.clone()).with_reference("r1")];
    let copy = [Message::new("m2", body).with_reference("r2")];

    let first = handler.handle(CancellationToken::new(), &original);
    let second = async {
        let result = handler.handle(CancellationToken::new(), &copy).await.unwrap();
        gate.open.notify_one();
        result
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.unwrap().is_success());
    assert_eq!(second.records[0].error.as_ref().map(|e| e.kind), Some(ErrorKind::InFlight));
    assert_eq!(queue.acked(), vec![Message::ack("m1", "r1")]);

    // The source delivers the copy again once the original has finished.
    let again = handler.handle(CancellationToken::new(), &copy).await.unwrap();
    assert!(again.is_success());
    assert_eq!(queue.acked(), vec![Message::ack("m1", "r1"), Message::ack("m2", "r2")]);
}

// ═══════════════════════════════════════════════════════════════
//  End to end
// ═══════════════════════════════════════════════════════════════

fn store_field() -> SubEntityField<Product, Store> {
    SubEntityField {
        name: "store",
        key: |p| p.store_id.clone().map(Key::new),
        set: |p, s| p.store = Some(s),
    }
}

#[tokio::test]
async fn test_handler_runs_full_pipeline_and_acks() {
    let stores = Arc::new(MemoryRepository::with_entities([Store { id: "s1".into(), city: "Oslo".into() }]));
    let products = Arc::new(MemoryRepository::<Product>::new());
    let blobs = Arc::new(MemoryBlobStore::default());
    let outbound = Arc::new(MemoryQueue::new());
    let inbound = Arc::new(MemoryQueue::new());

    let mapping = EnricherMapping::new()
        .on("CreateProduct", Arc::new(WithSubEntity::new(store_field(), stores)))
        .on("UpdateProduct", Arc::new(WithSubEntity::new(store_field(), stores_for_update())));
    let pipeline = Pipeline::builder()
        .action(Transform::new(vec![Arc::new(RecordsFromKey::new("product", "shop"))]))
        .action(Enrich::new(vec![Arc::new(mapping)]))
        .action(Upload::new(blobs.clone()))
        .action(Persist::new(products.clone()))
        .action(Publish::new(outbound.clone()))
        .clock(Arc::new(FixedClock(at())))
        .id_generator(Arc::new(SequentialIds::new("rec")))
        .build()
        .unwrap();
    let names: Vec<String> = pipeline.dep_call_names().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, ["InputTransformer", "Enricher", "Uploader", "Persister", "Publisher"]);

    let handler = EventHandler::new(Arc::new(pipeline), inbound.clone());
    let batch = [
        Message::new("m1", r#"{"CreateProduct":{"id":"p1","price":5,"store_id":"s1"}}"#).with_reference("r1"),
        Message::new("m2", r#"{"CreateProduct":{"id":"p2","store_id":"nowhere"}}"#).with_reference("r2"),
    ];
    let result = handler.handle(CancellationToken::new(), &batch).await.unwrap();

    assert_eq!(result.status, Status::PartiallyFailed);
    let saved = products.get(&Key::new("p1")).await.unwrap();
    assert_eq!(saved.store.map(|s| s.city), Some("Oslo".to_string()));
    assert!(products.get(&Key::new("p2")).await.is_none());
    assert_eq!(blobs.keys().await, vec!["rec-1_0"]);
    assert_eq!(outbound.published().len(), 1);
    assert_eq!(inbound.acked(), vec![Message::ack("m1", "r1"), Message::ack("m2", "r2")]);

    let err = result.error().unwrap().to_string();
    assert!(err.starts_with("ID: 'rec-2'; err: NotFound:"), "{err}");
}

fn stores_for_update() -> Arc<MemoryRepository<Store>> {
    Arc::new(MemoryRepository::new())
}

#[tokio::test]
async fn test_retry_disabled_leaves_record_failed() {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    repo.save_failures.fail_always();
    let pipeline = builder()
        .action(Persist::new(repo).with_options([ActionOption::FailureMandate(Mandate::StopAndRetry)]))
        .build()
        .unwrap();

    let result = invoke(&pipeline, &inputs(1)).await;

    assert_eq!(result.records[0].republish_attempt, Some(1));
    assert_eq!(result.records[0].previous_action_mandate, Some(Mandate::StopAndRetry));
    assert_eq!(result.status, Status::Failed);
}

#[tokio::test]
async fn test_cancellation_does_not_preempt_dispatched_work() {
    let repo = Arc::new(MemoryRepository::<Product>::new());
    let pipeline = builder().action(Persist::new(repo.clone())).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let result = pipeline.invoke(token, &inputs(2)).await.unwrap();
    assert!(result.is_success());
    assert_eq!(repo.len().await, 2);
}

#[test]
fn test_error_is_cloneable_across_records() {
    let err = Error::io("x").with_context("persist records");
    assert_eq!(err.clone().to_string(), "Io: persist records: x");
}
