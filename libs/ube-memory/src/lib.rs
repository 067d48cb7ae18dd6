//! In-memory adapters for every collaborator trait of `ube-api`.
//!
//! Each adapter records the calls it receives and can be told to fail on
//! chosen calls, so pipelines can be exercised end to end without
//! external services.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use ube_api::{Acker, Context, Downloader, Entity, Error, Key, Message, Publisher, Repository, Uploader};

// ═══════════════════════════════════════════════════════════════
//  FailureSwitch
// ═══════════════════════════════════════════════════════════════

/// Decides which calls of one operation fail.
///
/// Calls are numbered from 1 in arrival order.
#[derive(Debug, Default)]
pub struct FailureSwitch {
    calls: AtomicUsize,
    always: AtomicBool,
    on_calls: Mutex<HashSet<usize>>,
}

impl FailureSwitch {
    pub fn fail_always(&self) {
        self.always.store(true, Ordering::SeqCst);
    }

    pub fn fail_on_call(&self, n: usize) {
        lock(&self.on_calls).insert(n);
    }

    pub fn reset(&self) {
        self.always.store(false, Ordering::SeqCst);
        lock(&self.on_calls).clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Count one call; `Err` when it is scheduled to fail.
    fn check(&self, op: &str) -> Result<(), Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.always.load(Ordering::SeqCst) || lock(&self.on_calls).contains(&n) {
            return Err(Error::io(format!("{op} failed (call {n})")));
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryRepository
// ═══════════════════════════════════════════════════════════════

/// Table store keyed by the entity key's string form.
pub struct MemoryRepository<E> {
    entities: RwLock<BTreeMap<String, E>>,
    saved_batches: Mutex<Vec<Vec<E>>>,
    pub get_failures: FailureSwitch,
    pub exists_failures: FailureSwitch,
    pub save_failures: FailureSwitch,
}

impl<E: Entity> Default for MemoryRepository<E> {
    fn default() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            saved_batches: Mutex::new(Vec::new()),
            get_failures: FailureSwitch::default(),
            exists_failures: FailureSwitch::default(),
            save_failures: FailureSwitch::default(),
        }
    }
}

impl<E: Entity> MemoryRepository<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository pre-seeded with `entities`.
    pub fn with_entities(entities: impl IntoIterator<Item = E>) -> Self {
        let map = entities.into_iter().map(|e| (e.key().to_string(), e)).collect();
        Self {
            entities: RwLock::new(map),
            ..Self::default()
        }
    }

    pub async fn get(&self, key: &Key) -> Option<E> {
        self.entities.read().await.get(&key.to_string()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    /// Entities of every successful `save_entities` call, in call order.
    pub fn saved_batches(&self) -> Vec<Vec<E>> {
        lock(&self.saved_batches).clone()
    }
}

impl<E: Entity> Repository<E> for MemoryRepository<E> {
    fn get_entity<'a>(&'a self, _ctx: &'a Context, key: &'a Key) -> BoxFuture<'a, Result<E, Error>> {
        Box::pin(async move {
            self.get_failures.check("get entity")?;
            self.get(key)
                .await
                .ok_or_else(|| Error::not_found(format!("entity with key '{key}' not found")))
        })
    }

    fn entity_exists<'a>(&'a self, _ctx: &'a Context, key: &'a Key) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            self.exists_failures.check("entity exists")?;
            Ok(self.entities.read().await.contains_key(&key.to_string()))
        })
    }

    fn save_entities<'a>(&'a self, _ctx: &'a Context, entities: &'a [E]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.save_failures.check("save entities")?;
            let mut map = self.entities.write().await;
            for entity in entities {
                map.insert(entity.key().to_string(), entity.clone());
            }
            lock(&self.saved_batches).push(entities.to_vec());
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBlobStore
// ═══════════════════════════════════════════════════════════════

fn default_bucket() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryBlobConfig {
    /// Bucket used by `upload_file` and `download_file`.
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for MemoryBlobConfig {
    fn default() -> Self {
        Self { bucket: default_bucket() }
    }
}

/// Blob storage: `Uploader` + `Downloader` over `(bucket, key)`.
pub struct MemoryBlobStore {
    bucket: String,
    blobs: RwLock<HashMap<(String, String), Vec<u8>>>,
    failing_keys: Mutex<HashSet<String>>,
    pub upload_failures: FailureSwitch,
    pub download_failures: FailureSwitch,
}

impl MemoryBlobStore {
    pub fn new(config: MemoryBlobConfig) -> Self {
        Self {
            bucket: config.bucket,
            blobs: RwLock::new(HashMap::new()),
            failing_keys: Mutex::new(HashSet::new()),
            upload_failures: FailureSwitch::default(),
            download_failures: FailureSwitch::default(),
        }
    }

    /// Every upload of `key` fails.
    pub fn fail_uploads_of(&self, key: impl Into<String>) {
        lock(&self.failing_keys).insert(key.into());
    }

    pub async fn put(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.blobs
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in the default bucket, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .await
            .keys()
            .filter(|(bucket, _)| *bucket == self.bucket)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, Error> {
        self.download_failures.check("download file")?;
        self.get(bucket, key)
            .await
            .ok_or_else(|| Error::not_found(format!("file '{bucket}/{key}' not found")))
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new(MemoryBlobConfig::default())
    }
}

impl Uploader for MemoryBlobStore {
    fn upload_file<'a>(&'a self, _ctx: &'a Context, key: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.upload_failures.check("upload file")?;
            if lock(&self.failing_keys).contains(key) {
                return Err(Error::io(format!("upload of '{key}' rejected")));
            }
            self.put(&self.bucket, key, body).await;
            Ok(())
        })
    }
}

impl Downloader for MemoryBlobStore {
    fn download_file<'a>(&'a self, _ctx: &'a Context, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, Error>> {
        Box::pin(self.download(&self.bucket, key))
    }

    fn download_file_from_bucket<'a>(
        &'a self,
        _ctx: &'a Context,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, Error>> {
        Box::pin(self.download(bucket, key))
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryQueue
// ═══════════════════════════════════════════════════════════════

/// Queue: `Publisher` + `Acker` (and therefore `Republisher`).
///
/// Published messages can be drained and fed back as inbound inputs to
/// simulate redelivery.
#[derive(Default)]
pub struct MemoryQueue {
    published: Mutex<Vec<Message>>,
    acked: Mutex<Vec<Message>>,
    pub publish_failures: FailureSwitch,
    pub ack_failures: FailureSwitch,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Message> {
        lock(&self.published).clone()
    }

    /// Take every published message, as a consumer would.
    pub fn drain_published(&self) -> Vec<Message> {
        std::mem::take(&mut *lock(&self.published))
    }

    pub fn acked(&self) -> Vec<Message> {
        lock(&self.acked).clone()
    }
}

impl Publisher for MemoryQueue {
    fn publish_events<'a>(&'a self, _ctx: &'a Context, messages: &'a [Message]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.publish_failures.check("publish events")?;
            lock(&self.published).extend_from_slice(messages);
            Ok(())
        })
    }
}

impl Acker for MemoryQueue {
    fn ack_messages<'a>(&'a self, _ctx: &'a Context, messages: &'a [Message]) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.ack_failures.check("ack messages")?;
            lock(&self.acked).extend_from_slice(messages);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Item {
        id: String,
    }

    impl Entity for Item {
        fn key(&self) -> Key {
            Key::new(self.id.clone())
        }
    }

    fn item(id: &str) -> Item {
        Item { id: id.into() }
    }

    #[tokio::test]
    async fn test_repository_roundtrip_and_not_found() {
        let ctx = Context::background();
        let repo = MemoryRepository::with_entities([item("a")]);
        repo.save_entities(&ctx, &[item("b")]).await.unwrap();

        assert!(repo.entity_exists(&ctx, &Key::new("b")).await.unwrap());
        assert_eq!(repo.get_entity(&ctx, &Key::new("a")).await.unwrap(), item("a"));
        let err = repo.get_entity(&ctx, &Key::new("zz")).await.unwrap_err();
        assert_eq!(err.kind, ube_api::ErrorKind::NotFound);
        assert_eq!(repo.saved_batches(), vec![vec![item("b")]]);
    }

    #[tokio::test]
    async fn test_failure_switch_fails_chosen_call_only() {
        let ctx = Context::background();
        let repo = MemoryRepository::new();
        repo.save_failures.fail_on_call(2);

        assert!(repo.save_entities(&ctx, &[item("a")]).await.is_ok());
        assert!(repo.save_entities(&ctx, &[item("b")]).await.is_err());
        assert!(repo.save_entities(&ctx, &[item("c")]).await.is_ok());
        assert_eq!(repo.save_failures.calls(), 3);
        assert_eq!(repo.len().await, 2);
    }

    #[tokio::test]
    async fn test_blob_store_buckets() {
        let ctx = Context::background();
        let blobs = MemoryBlobStore::default();
        blobs.upload_file(&ctx, "k", b"v").await.unwrap();
        blobs.put("feeds", "f.json", "[]").await;

        assert_eq!(blobs.download_file(&ctx, "k").await.unwrap(), b"v");
        assert_eq!(blobs.download_file_from_bucket(&ctx, "feeds", "f.json").await.unwrap(), b"[]");
        assert!(blobs.download_file(&ctx, "f.json").await.is_err());

        blobs.fail_uploads_of("bad");
        assert!(blobs.upload_file(&ctx, "bad", b"x").await.is_err());
        assert_eq!(blobs.keys().await, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_records_and_drains() {
        let ctx = Context::background();
        let queue = MemoryQueue::new();
        queue.publish_events(&ctx, &[Message::new("1", "a")]).await.unwrap();
        queue.ack_messages(&ctx, &[Message::ack("m", "r")]).await.unwrap();

        assert_eq!(queue.drain_published(), vec![Message::new("1", "a")]);
        assert!(queue.published().is_empty());
        assert_eq!(queue.acked(), vec![Message::ack("m", "r")]);

        queue.ack_failures.fail_always();
        assert!(queue.ack_messages(&ctx, &[Message::ack("m", "r")]).await.is_err());
    }
}
