//! Serialized form of a record: a discriminated envelope.
//!
//! ```json
//! {"id": "...", "category": "product", "payload": [{...}, {...}],
//!  "event": {...}, "metadata": {...}, "raw_data": ["base64..."],
//!  "republish_attempt": 2, "previous_action": 3}
//! ```
//!
//! Decoding runs in two passes: peek the discriminator and bookkeeping
//! (payload kept as an untyped JSON value), then decode the payload into
//! the concrete entity type.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::entity::Entity;
use crate::error::Error;
use crate::message::Message;
use crate::record::{EventHeader, Metadata, Record};

#[derive(Serialize)]
struct EnvelopeOut<'a, E> {
    id: &'a str,
    category: &'a str,
    payload: &'a [E],
    event: &'a EventHeader,
    metadata: &'a Metadata,
    #[serde(skip_serializing_if = "is_blank")]
    source: &'a str,
    #[serde(serialize_with = "serialize_segments", skip_serializing_if = "no_segments")]
    raw_data: &'a Vec<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    republish_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_action: Option<usize>,
}

/// Envelope head: bookkeeping with the payload still untyped.
#[derive(Deserialize)]
struct EnvelopeHead {
    id: String,
    category: String,
    payload: serde_json::Value,
    #[serde(default)]
    event: EventHeader,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    source: String,
    #[serde(default, deserialize_with = "deserialize_segments")]
    raw_data: Vec<Vec<u8>>,
    #[serde(default)]
    pt: Option<DateTime<Utc>>,
    #[serde(default)]
    republish_attempt: Option<u32>,
    #[serde(default)]
    previous_action: Option<usize>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

fn no_segments(segments: &&Vec<Vec<u8>>) -> bool {
    segments.is_empty()
}

fn serialize_segments<S: Serializer>(segments: &&Vec<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    let engine = base64::engine::general_purpose::STANDARD;
    s.collect_seq(segments.iter().map(|seg| engine.encode(seg)))
}

fn deserialize_segments<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
    let encoded = Vec::<String>::deserialize(d)?;
    encoded
        .iter()
        .map(|seg| {
            base64::engine::general_purpose::STANDARD
                .decode(seg)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// Serialize a record into its envelope.
///
/// `with_previous_action` embeds the index of the last executed action so
/// that a redelivered copy resumes exactly there.
pub fn encode<E: Entity>(record: &Record<E>, with_previous_action: bool) -> Result<String, Error> {
    let out = EnvelopeOut {
        id: &record.id,
        category: &record.event.event_category,
        payload: &record.entities,
        event: &record.event,
        metadata: &record.metadata,
        source: &record.source,
        raw_data: &record.raw_data,
        pt: record.pt,
        republish_attempt: record.republish_attempt,
        previous_action: with_previous_action.then_some(record.previous_action),
    };
    serde_json::to_string(&out)
        .map_err(|e| Error::decode(e.to_string()).with_context(format!("encode record '{}'", record.id)))
}

/// Outbound message for a record: id = record id, body = envelope.
pub fn to_message<E: Entity>(record: &Record<E>, with_previous_action: bool) -> Result<Message, Error> {
    Ok(Message::new(record.id.clone(), encode(record, with_previous_action)?))
}

/// Decode a body that may be a serialized record.
///
/// - `Ok(None)`: not an envelope (fresh input).
/// - `Ok(Some(record))`: envelope; bookkeeping restored, error cleared.
/// - `Err(_)`: envelope whose head or payload does not decode.
pub fn decode<E: Entity>(body: &[u8]) -> Result<Option<Record<E>>, Error> {
    // Pass 1: peek the discriminator.
    let raw: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let is_envelope = matches!(
        &raw,
        serde_json::Value::Object(map) if map.contains_key("category") && map.contains_key("payload")
    );
    if !is_envelope {
        return Ok(None);
    }

    // Pass 2: head, then the typed payload.
    let head: EnvelopeHead = serde_json::from_value(raw)
        .map_err(|e| Error::decode(e.to_string()).with_context("decode record envelope"))?;

    let entities: Vec<E> = serde_json::from_value(head.payload).map_err(|e| {
        Error::decode(e.to_string())
            .with_context(format!("decode '{}' payload of record '{}'", head.category, head.id))
    })?;

    let mut event = head.event;
    event.event_category = head.category;

    Ok(Some(Record {
        id: head.id,
        event,
        metadata: head.metadata,
        source: head.source,
        raw_data: head.raw_data,
        body: None,
        pt: head.pt,
        entities,
        error: None,
        previous_action: head.previous_action.unwrap_or(0),
        previous_action_mandate: None,
        republish_attempt: head.republish_attempt,
    }))
}
