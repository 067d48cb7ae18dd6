use serde::Serialize;
use ube_api::Record;

use crate::error::{BatchError, RecordFailure};

/// Outcome of one `invoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Succeeded,
    PartiallyFailed,
    Failed,
}

/// Classified records of one invocation.
#[derive(Debug, Clone)]
pub struct ProcessingResult<E> {
    pub status: Status,
    /// One entry per failed record, in record order.
    pub errors: Vec<String>,
    pub records: Vec<Record<E>>,
}

impl<E> ProcessingResult<E> {
    pub fn classify(records: Vec<Record<E>>) -> Self {
        let errors: Vec<String> = records
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("ID: '{}'; err: {e}", r.id)))
            .collect();

        let status = match errors.len() {
            0 => Status::Succeeded,
            n if n == records.len() => Status::Failed,
            _ => Status::PartiallyFailed,
        };
        Self { status, errors, records }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }

    /// Combined error of every failed record.
    pub fn error(&self) -> Option<BatchError> {
        let failures: Vec<RecordFailure> = self
            .records
            .iter()
            .filter_map(|r| {
                r.error.clone().map(|error| RecordFailure { id: r.id.clone(), error })
            })
            .collect();
        (!failures.is_empty()).then_some(BatchError { failures })
    }
}
