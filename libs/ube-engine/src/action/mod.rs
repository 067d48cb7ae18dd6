//! Action contract and the shared option set.
//!
//! An action is one named stage of a pipeline. It mutates the records it
//! receives in place and reports failures on each record's error slot;
//! the orchestrator owns everything else (batching, bookkeeping, mandate
//! policy).

mod enrich;
mod persist;
mod publish;
mod republish;
mod service;
mod transform;
mod upload;

use std::collections::HashSet;

use futures::future::BoxFuture;
use ube_api::{Context, Entity, Mandate, Record};

pub use enrich::{
    Enrich, EnrichChain, Enricher, EnricherMapping, Override, SubEntityField, WithDedupe, WithPatchOriginal,
    WithSubEntity,
};
pub use persist::Persist;
pub use publish::Publish;
pub use republish::Republish;
pub use service::ServiceAction;
pub use transform::{
    CreateEvent, EventFromQueueSource, FeedToModel, RecordsFromFilePointer, RecordsFromKey, Transform, TransformFn,
};
pub use upload::Upload;

/// Name an action reports to be treated as the alerting action under
/// `StopAndRaiseError`.
pub const ALERTING_ACTION_NAME: &str = "EventAlerter";

/// Processing stage.
///
/// `process` receives only the processable records of one sub-batch.
/// Capability getters default to the action's [`ActionBase`].
pub trait Action<E: Entity>: Send + Sync {
    fn name(&self) -> &str;

    fn base(&self) -> &ActionBase;

    fn process<'a, 'r>(&'a self, ctx: &'a Context, records: &'a mut [&'r mut Record<E>]) -> BoxFuture<'a, ()>;

    /// External operation names this action may invoke.
    fn dep_call_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn is_critical(&self) -> bool {
        self.base().critical
    }

    fn failure_mandate(&self) -> Mandate {
        self.base().failure_mandate
    }

    /// 0 means one record at a time.
    fn batch_size(&self) -> usize {
        self.base().batch_size
    }

    fn is_async(&self) -> bool {
        self.base().is_async
    }

    /// Whether the action still receives records stopped by a
    /// `StopAndRaiseError` failure.
    fn is_alerting(&self) -> bool {
        self.name() == ALERTING_ACTION_NAME
    }
}

/// Override of an action default.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOption {
    /// Do not run the action for records with these event names.
    Skip(Vec<String>),
    Critical,
    BatchSize(usize),
    Async,
    FailureMandate(Mandate),
}

impl ActionOption {
    pub fn skip<I, S>(event_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ActionOption::Skip(event_names.into_iter().map(Into::into).collect())
    }
}

/// Configuration shared by every concrete action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBase {
    pub critical: bool,
    pub failure_mandate: Mandate,
    pub is_async: bool,
    pub batch_size: usize,
    skip: HashSet<String>,
}

impl ActionBase {
    pub fn new(failure_mandate: Mandate, batch_size: usize) -> Self {
        Self {
            critical: false,
            failure_mandate,
            is_async: false,
            batch_size,
            skip: HashSet::new(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn apply(&mut self, option: ActionOption) {
        match option {
            ActionOption::Skip(names) => self.skip = names.into_iter().collect(),
            ActionOption::Critical => self.critical = true,
            ActionOption::BatchSize(n) => self.batch_size = n,
            ActionOption::Async => self.is_async = true,
            ActionOption::FailureMandate(m) => self.failure_mandate = m,
        }
    }

    pub fn skips(&self, event_name: &str) -> bool {
        self.skip.contains(event_name)
    }
}

/// Builder-style option application for concrete actions.
pub trait Configure: Sized {
    fn base_mut(&mut self) -> &mut ActionBase;

    fn with_options(mut self, options: impl IntoIterator<Item = ActionOption>) -> Self {
        for option in options {
            self.base_mut().apply(option);
        }
        self
    }
}
