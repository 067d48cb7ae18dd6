use futures::future::BoxFuture;

use crate::context::Context;
use crate::entity::{Entity, Key};
use crate::error::Error;

/// Blob storage write side.
pub trait Uploader: Send + Sync {
    fn upload_file<'a>(
        &'a self,
        ctx: &'a Context,
        key: &'a str,
        body: &'a [u8],
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Blob storage read side.
pub trait Downloader: Send + Sync {
    /// Download from the adapter's default bucket.
    fn download_file<'a>(&'a self, ctx: &'a Context, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, Error>>;

    fn download_file_from_bucket<'a>(
        &'a self,
        ctx: &'a Context,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, Error>>;
}

/// Table store for one entity type.
///
/// The engine holds no transactions: every call is independent and
/// context-scoped.
pub trait Repository<E: Entity>: Send + Sync {
    /// Fetch by key. A missing entity is an `ErrorKind::NotFound` error.
    fn get_entity<'a>(&'a self, ctx: &'a Context, key: &'a Key) -> BoxFuture<'a, Result<E, Error>>;

    fn entity_exists<'a>(&'a self, ctx: &'a Context, key: &'a Key) -> BoxFuture<'a, Result<bool, Error>>;

    /// Upsert.
    fn save_entities<'a>(&'a self, ctx: &'a Context, entities: &'a [E]) -> BoxFuture<'a, Result<(), Error>>;
}
