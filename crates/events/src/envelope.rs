use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use horizon_core::{CorrelationId, EventId, UserId};

use crate::event::Event;

fn default_schema_version() -> u32 {
    1
}

/// Envelope for an event, carrying correlation and schema metadata.
///
/// This is the unit that travels over both buses.
///
/// Notes:
/// - Every event of one causal chain shares `correlation_id`.
/// - `schema_version` defaults to 1 when absent on the wire.
/// - `idempotency_key`, `parent_event_id` and `tags` are omitted from the wire when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P = JsonValue> {
    event_id: EventId,
    event_type: String,
    timestamp: DateTime<Utc>,
    correlation_id: CorrelationId,
    user_id: UserId,
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    payload: P,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

impl<P> EventEnvelope<P> {
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: CorrelationId,
        user_id: UserId,
        payload: P,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id,
            user_id,
            schema_version: default_schema_version(),
            payload,
            idempotency_key: None,
            parent_event_id: None,
            tags: Vec::new(),
        }
    }

    /// Start a new envelope caused by `parent`: same correlation chain, linked parent.
    pub fn caused_by<Q>(parent: &EventEnvelope<Q>, event_type: impl Into<String>, payload: P) -> Self {
        let mut envelope = Self::new(
            event_type,
            parent.correlation_id,
            parent.user_id.clone(),
            payload,
        );
        envelope.parent_event_id = Some(parent.event_id);
        envelope
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn parent_event_id(&self) -> Option<EventId> {
        self.parent_event_id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<E: Event + Serialize> EventEnvelope<E> {
    /// Wrap a typed event, taking its type name and schema version.
    pub fn for_event(correlation_id: CorrelationId, user_id: UserId, event: E) -> Self {
        let event_type = event.event_type();
        let version = event.schema_version();
        Self::new(event_type, correlation_id, user_id, event).with_schema_version(version)
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Convert to the wire form with an untyped JSON payload.
    pub fn to_json(&self) -> Result<EventEnvelope<JsonValue>, serde_json::Error> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            user_id: self.user_id.clone(),
            schema_version: self.schema_version,
            payload: serde_json::to_value(&self.payload)?,
            idempotency_key: self.idempotency_key.clone(),
            parent_event_id: self.parent_event_id,
            tags: self.tags.clone(),
        })
    }
}

impl EventEnvelope<JsonValue> {
    /// Decode the JSON payload into a typed event.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Read a string field of the payload (e.g. a partition key).
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_round_trip_keeps_correlation_and_payload() {
        let correlation = CorrelationId::new();
        let envelope = EventEnvelope::new(
            "job.submitted",
            correlation,
            UserId::new("user-1"),
            json!({"job_id": "abc", "agent": "AlphaCal"}),
        )
        .with_idempotency_key("submit-abc");

        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: EventEnvelope = serde_json::from_str(&wire).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.correlation_id(), correlation);
        assert_eq!(decoded.payload_str("agent"), Some("AlphaCal"));
    }

    #[test]
    fn optional_fields_are_omitted_and_version_defaults() {
        let envelope = EventEnvelope::new(
            "job.cancelled",
            CorrelationId::new(),
            UserId::new("user-1"),
            json!({}),
        );
        let mut wire = serde_json::to_value(&envelope).unwrap();
        let object = wire.as_object_mut().unwrap();
        assert!(!object.contains_key("idempotency_key"));
        assert!(!object.contains_key("parent_event_id"));
        assert!(!object.contains_key("tags"));

        object.remove("schema_version");
        let decoded: EventEnvelope = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.schema_version(), 1);
    }

    #[test]
    fn caused_by_propagates_the_chain() {
        let root = EventEnvelope::new(
            "job.submitted",
            CorrelationId::new(),
            UserId::new("user-7"),
            json!({"job_id": "j"}),
        );
        let child = EventEnvelope::caused_by(&root, "job.status.changed", json!({"job_id": "j"}));

        assert_eq!(child.correlation_id(), root.correlation_id());
        assert_eq!(child.parent_event_id(), Some(root.event_id()));
        assert_eq!(child.user_id(), root.user_id());
        assert_ne!(child.event_id(), root.event_id());
    }
}
