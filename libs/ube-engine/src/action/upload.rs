use std::sync::Arc;

use futures::future::BoxFuture;
use ube_api::{Context, Entity, Error, Mandate, Record, Uploader};

use super::{Action, ActionBase, Configure};

const UPLOAD_BATCH_SIZE: usize = 100;

pub const UPLOAD_FILE: &str = "UploadFile";

/// Stores every raw payload segment of a record under `"{id}_{j}"`.
pub struct Upload {
    base: ActionBase,
    uploader: Arc<dyn Uploader>,
}

impl Upload {
    pub fn new(uploader: Arc<dyn Uploader>) -> Self {
        Self {
            base: ActionBase::new(Mandate::LogFailureAndContinue, UPLOAD_BATCH_SIZE),
            uploader,
        }
    }

    /// Upload segments in order; stops at the first failing one.
    async fn upload_segments<E>(&self, ctx: &Context, record: &Record<E>) -> Result<usize, Error> {
        for (j, segment) in record.raw_data.iter().enumerate() {
            let key = format!("{}_{j}", record.id);
            self.uploader
                .upload_file(ctx, &key, segment)
                .await
                .map_err(|e| e.with_context(format!("upload segment '{key}'")))?;
        }
        Ok(record.raw_data.len())
    }
}

impl Configure for Upload {
    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }
}

impl<E: Entity> Action<E> for Upload {
    fn name(&self) -> &str {
        "Uploader"
    }

    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn dep_call_names(&self) -> Vec<&'static str> {
        vec![UPLOAD_FILE]
    }

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut uploaded = 0;
            for record in records.iter_mut() {
                if self.base.skips(record.event_name()) {
                    continue;
                }
                match self.upload_segments(ctx, record).await {
                    Ok(n) => uploaded += n,
                    Err(e) => {
                        tracing::warn!(record = %record.id, error = %e, "upload failed");
                        record.set_error(e);
                    }
                }
            }
            tracing::info!(action = "Uploader", uploaded, "uploaded segments");
        })
    }
}
