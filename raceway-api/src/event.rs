use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::ClockVector;

/// Whether a tracked state access read or wrote the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
}

/// A single captured instrumentation event.
///
/// Events are immutable once constructed. Within one execution context they
/// form a chain: each event's `parent_id` is the id of the previous event
/// captured in the same context, and the first event of the chain has no
/// parent. `causality_vector` is the full snapshot of the context's vector
/// clock taken *after* the pre-capture increment of the own component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub parent_id: Option<Uuid>,
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub metadata: EventMetadata,
    pub causality_vector: ClockVector,
    /// Reserved for held-lock tracking; empty in this revision.
    pub lock_set: Vec<String>,
}

/// What happened, with the kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    StateChange {
        variable: String,
        old_value: Value,
        new_value: Value,
        location: String,
        access_type: AccessType,
    },
    FunctionCall {
        function_name: String,
        module: String,
        args: Value,
        file: String,
        line: u32,
    },
    FunctionReturn {
        function_name: String,
        return_value: Value,
        file: String,
        line: u32,
    },
    HttpRequest {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
        body: Option<Value>,
    },
    HttpResponse {
        status: u16,
        headers: BTreeMap<String, String>,
        body: Option<Value>,
        duration_ms: u64,
    },
    LockAcquire {
        lock_id: String,
        lock_type: String,
        location: String,
    },
    LockRelease {
        lock_id: String,
        lock_type: String,
        location: String,
    },
    AsyncSpawn {
        task_id: String,
        task_name: String,
        spawned_at: String,
    },
    AsyncAwait {
        future_id: String,
        awaited_at: String,
    },
    Error {
        error_type: String,
        message: String,
        stack_trace: Vec<String>,
    },
}

impl EventKind {
    /// The variant name as it appears as the wire tag.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StateChange { .. } => "StateChange",
            EventKind::FunctionCall { .. } => "FunctionCall",
            EventKind::FunctionReturn { .. } => "FunctionReturn",
            EventKind::HttpRequest { .. } => "HttpRequest",
            EventKind::HttpResponse { .. } => "HttpResponse",
            EventKind::LockAcquire { .. } => "LockAcquire",
            EventKind::LockRelease { .. } => "LockRelease",
            EventKind::AsyncSpawn { .. } => "AsyncSpawn",
            EventKind::AsyncAwait { .. } => "AsyncAwait",
            EventKind::Error { .. } => "Error",
        }
    }
}

/// Process- and service-level context attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The execution unit that captured the event.
    pub thread_id: String,
    pub process_id: u32,
    pub service_name: String,
    pub environment: String,
    pub tags: BTreeMap<String, String>,
    pub duration_ns: Option<u64>,
    pub instance_id: String,
    /// The capturing context's own span id.
    pub distributed_span_id: String,
    /// The immediately upstream span, if the context was ingested.
    pub upstream_span_id: Option<String>,
}

/// The body of a collector POST: `{"events": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
}

// RFC 3339 with fixed nanosecond precision. Chrono's default serialization
// varies the subsecond width with the value; the collector expects nine
// digits.
mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            parent_id: None,
            timestamp: Utc::now(),
            kind: EventKind::StateChange {
                variable: "counter".into(),
                old_value: Value::from(5),
                new_value: Value::from(6),
                location: "app.rs:12".into(),
                access_type: AccessType::Write,
            },
            metadata: EventMetadata {
                thread_id: "rust-100-deadbeef".into(),
                process_id: 100,
                service_name: "svc-a".into(),
                environment: "development".into(),
                tags: BTreeMap::new(),
                duration_ns: None,
                instance_id: "a1".into(),
                distributed_span_id: "b7ad6b7169203331".into(),
                upstream_span_id: None,
            },
            causality_vector: ClockVector::from_entries([("svc-a#a1".into(), 1)]),
            lock_set: Vec::new(),
        }
    }

    #[test]
    fn kind_is_externally_tagged() {
        let json = serde_json::to_value(sample_event()).unwrap();
        let state_change = &json["kind"]["StateChange"];
        assert_eq!(state_change["variable"], "counter");
        assert_eq!(state_change["old_value"], 5);
        assert_eq!(state_change["new_value"], 6);
        assert_eq!(state_change["access_type"], "Write");
    }

    #[test]
    fn timestamp_has_nanosecond_precision_and_utc_suffix() {
        let json = serde_json::to_value(sample_event()).unwrap();
        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'), "not UTC: {timestamp}");
        let fractional = timestamp
            .rsplit_once('.')
            .map(|(_, rest)| rest.trim_end_matches('Z'))
            .unwrap();
        assert_eq!(fractional.len(), 9, "expected nine digits: {timestamp}");
    }

    #[test]
    fn causality_vector_serializes_as_pairs() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(
            json["causality_vector"],
            serde_json::json!([["svc-a#a1", 1]])
        );
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn batch_wire_shape() {
        let json = serde_json::to_value(EventBatch {
            events: vec![sample_event()],
        })
        .unwrap();
        assert!(json["events"].as_array().is_some());
    }
}
