//! Per-record failure-mandate state machine.
//!
//! `is_processable` runs before an action sees a record, `settle` right
//! after. Both act on the record's current state and on the mandate of
//! the action that last processed it.

use chrono::{DateTime, Utc};
use ube_api::{Entity, Mandate, Record};

use crate::action::Action;

/// Whether `action` at `index` may receive `record`.
///
/// An error left by a `LogFailureAndContinue` action is cleared here, so
/// every record entering the next action is clean while a failure of the
/// last action still shows up in the result.
pub(crate) fn is_processable<E: Entity>(record: &mut Record<E>, action: &dyn Action<E>, index: usize) -> bool {
    if record.error.is_none() {
        // A redelivered record resumes exactly at the action that failed.
        return record.republish_attempt.is_none() || index == record.previous_action;
    }

    match record.previous_action_mandate {
        Some(Mandate::LogFailureAndContinue) => {
            tracing::debug!(record = %record.id, action = action.name(), "clearing logged failure");
            record.error = None;
            true
        }
        Some(Mandate::StopAndRaiseError) => action.is_alerting(),
        Some(Mandate::ProcessOnlyCriticalActions) => action.is_critical(),
        _ => false,
    }
}

/// Bookkeeping after `action` at `index` processed `record`.
pub(crate) fn settle<E: Entity>(record: &mut Record<E>, action: &dyn Action<E>, index: usize, now: DateTime<Utc>) {
    let mandate = action.failure_mandate();
    record.previous_action = index;
    record.previous_action_mandate = Some(mandate);

    let Some(err) = &record.error else {
        record.event.processed_at = Some(now);
        record.republish_attempt = None;
        return;
    };

    match mandate {
        Mandate::LogFailureAndContinue => {
            tracing::warn!(record = %record.id, action = action.name(), error = %err, "action failed, continuing")
        }
        Mandate::StopFurtherProcessing => {
            tracing::error!(record = %record.id, action = action.name(), error = %err, "action failed, record stopped")
        }
        Mandate::StopAndRaiseError => {
            tracing::error!(record = %record.id, action = action.name(), error = %err, "action failed, raising alert")
        }
        Mandate::ProcessOnlyCriticalActions => tracing::warn!(
            record = %record.id,
            action = action.name(),
            error = %err,
            "action failed, only critical actions follow"
        ),
        Mandate::StopAndRetry => {
            tracing::warn!(record = %record.id, action = action.name(), error = %err, "action failed, scheduling retry");
            record.republish_attempt.get_or_insert(1);
        }
    }
}
