//! Event-processing pipeline engine.
//!
//! A [`Pipeline`] runs batches of inbound messages through an ordered list
//! of [`Action`]s. Failures are recorded on the records themselves and
//! steered by each action's [`Mandate`](ube_api::Mandate); records failing
//! under `StopAndRetry` are redelivered by the [`Republish`] after-each
//! action.

pub mod action;
pub mod config;
pub mod error;
pub mod handler;
mod mandate;
pub mod pipeline;
pub mod result;

pub use action::{Action, ActionBase, ActionOption, Configure};
pub use action::{Enrich, Persist, Publish, Republish, ServiceAction, Transform, Upload};
pub use config::{ActionSettings, PipelineConfig, RepublishConfig};
pub use error::{BatchError, EngineError, RecordFailure};
pub use handler::EventHandler;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use result::{ProcessingResult, Status};
