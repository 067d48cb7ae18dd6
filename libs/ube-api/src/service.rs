use futures::future::BoxFuture;

use crate::context::Context;
use crate::entity::Entity;
use crate::error::Error;
use crate::record::Record;

/// Domain executor injected into the Service action.
///
/// Receives the whole processable sub-batch and may mutate the records.
/// An `Err` marks every record of the sub-batch.
pub trait Service<E: Entity>: Send + Sync {
    fn execute<'a, 'r>(
        &'a self,
        ctx: &'a Context,
        records: &'a mut [&'r mut Record<E>],
    ) -> BoxFuture<'a, Result<(), Error>>;
}
