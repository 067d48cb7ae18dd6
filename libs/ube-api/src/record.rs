use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::Message;

/// What the orchestrator does with a record after its action errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mandate {
    /// Keep the error, exclude the record from every later ordinary action.
    StopFurtherProcessing,
    /// Only critical actions still receive the record.
    ProcessOnlyCriticalActions,
    /// Log, clear the error, keep processing.
    LogFailureAndContinue,
    /// Keep the error; only the alerting action still receives the record.
    StopAndRaiseError,
    /// Hand the record to Republish for redelivery.
    StopAndRetry,
}

/// Classification and provenance of the inbound event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_category: String,
    /// Source URI of the inbound input.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_source: String,
    /// Id of the inbound message (acknowledgment handle).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Reference of the inbound message (acknowledgment handle).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_update_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_event_occurred: Option<DateTime<Utc>>,
}

/// One event occurrence flowing through the pipeline (the "medium").
///
/// Created once per inbound input, mutated in place by every action it is
/// eligible for. Bookkeeping fields (`previous_action`,
/// `previous_action_mandate`, `republish_attempt`) are owned by the
/// orchestrator and the Republish action; other actions only touch the
/// data fields and `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<E> {
    pub id: String,
    pub event: EventHeader,
    pub metadata: Metadata,
    /// Origin system tag set by transforms.
    pub source: String,
    /// Raw payload segments as received.
    pub raw_data: Vec<Vec<u8>>,
    /// Working payload consumed by Transform; `None` once decoded.
    pub body: Option<Vec<u8>>,
    /// Ingestion timestamp.
    pub pt: Option<DateTime<Utc>>,
    pub entities: Vec<E>,
    pub error: Option<Error>,

    /// Index of the last action that processed this record.
    pub previous_action: usize,
    /// Mandate of the last action that processed this record.
    pub previous_action_mandate: Option<Mandate>,
    /// `None` until the first `StopAndRetry` failure.
    pub republish_attempt: Option<u32>,
}

impl<E> Record<E> {
    /// Fresh record for an inbound input that is not a serialized record.
    pub fn from_input(id: impl Into<String>, input: &Message, now: DateTime<Utc>) -> Self {
        let id = id.into();
        let body = input.body.as_bytes().to_vec();
        Self {
            event: EventHeader {
                event_source: input.source_uri.clone(),
                id: input.id.clone(),
                reference: input.reference.clone(),
                occurred_at: Some(now),
                received_at: Some(now),
                ..EventHeader::default()
            },
            metadata: Metadata {
                created: Some(now),
                created_event_id: id.clone(),
                last_updated: Some(now),
                last_update_event_id: id.clone(),
                last_update_event_occurred: Some(now),
            },
            id,
            source: String::new(),
            raw_data: vec![body.clone()],
            body: Some(body),
            pt: Some(now),
            entities: Vec::new(),
            error: None,
            previous_action: 0,
            previous_action_mandate: None,
            republish_attempt: None,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event.event_name
    }

    pub fn event_category(&self) -> &str {
        &self.event.event_category
    }

    pub fn event_id(&self) -> &str {
        &self.event.id
    }

    pub fn event_reference(&self) -> &str {
        &self.event.reference
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn set_error(&mut self, err: Error) {
        self.error = Some(err);
    }

    /// Refresh `last_updated*` after the entities were rewritten.
    pub fn update_metadata(&mut self, now: DateTime<Utc>) {
        self.metadata.last_updated = Some(now);
        self.metadata.last_update_event_id = self.id.clone();
        self.metadata.last_update_event_occurred = self.event.occurred_at;
    }

    pub fn increment_republish_attempt(&mut self) {
        *self.republish_attempt.get_or_insert(0) += 1;
    }

    /// Ack handle of the originating inbound message, if it still has one.
    pub fn ack_message(&self) -> Option<Message> {
        if self.event.id.is_empty() || self.event.reference.is_empty() {
            return None;
        }
        Some(Message::ack(self.event.id.clone(), self.event.reference.clone()))
    }
}
