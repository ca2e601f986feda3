//! Replay event model and its JSON wire shape.
//!
//! A delta snapshot decodes into an ordered list of [`Event`]s with
//! non-decreasing `mod_revision`. The wire shape is fixed by the snapshot
//! producer and must round-trip exactly:
//!
//! ```json
//! { "etcdEvent": { "type": "PUT",
//!                  "kv": { "key": "<b64>", "value": "<b64>", "mod_revision": 7 } },
//!   "time": "2024-03-01T10:00:00Z" }
//! ```
//!
//! Byte fields are base64-encoded; `value` and `mod_revision` are omitted
//! defaults for DELETE events and tombstone encodings.

use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of mutation an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// Key written with a value.
    Put,
    /// Key removed.
    Delete,
}

/// Base64 codec for byte fields inside the JSON wire shape.
mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::STANDARD;
    use base64::Engine as _;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// The key-value payload of a mutation event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key the mutation applies to.
    #[serde(with = "b64")]
    pub key: Vec<u8>,
    /// Value written; empty for DELETE events.
    #[serde(with = "b64", default)]
    pub value: Vec<u8>,
    /// Revision at which the mutation was committed.
    #[serde(default)]
    pub mod_revision: i64,
}

/// The etcd-side portion of a replay event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdEvent {
    /// PUT or DELETE.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Key, value, and commit revision.
    pub kv: KeyValue,
}

/// One replayable mutation, stamped with the time it was observed by the
/// snapshot producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The mutation itself.
    #[serde(rename = "etcdEvent")]
    pub etcd_event: EtcdEvent,
    /// Ingestion timestamp (RFC 3339).
    pub time: DateTime<Utc>,
}

impl Event {
    /// Creates a PUT event.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, mod_revision: i64) -> Self {
        Self {
            etcd_event: EtcdEvent {
                kind: EventKind::Put,
                kv: KeyValue { key: key.into(), value: value.into(), mod_revision },
            },
            time: Utc::now(),
        }
    }

    /// Creates a DELETE event.
    pub fn delete(key: impl Into<Vec<u8>>, mod_revision: i64) -> Self {
        Self {
            etcd_event: EtcdEvent {
                kind: EventKind::Delete,
                kv: KeyValue { key: key.into(), value: Vec::new(), mod_revision },
            },
            time: Utc::now(),
        }
    }

    /// Revision at which the wrapped mutation was committed.
    pub fn mod_revision(&self) -> i64 {
        self.etcd_event.kv.mod_revision
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use base64::Engine as _;

    use super::*;

    #[test]
    fn test_put_event_wire_shape() {
        let event = Event::put(b"foo".to_vec(), b"bar".to_vec(), 7);
        let json = serde_json::to_value(&event).expect("serialize");

        assert_eq!(json["etcdEvent"]["type"], "PUT");
        assert_eq!(json["etcdEvent"]["kv"]["key"], STANDARD.encode(b"foo"));
        assert_eq!(json["etcdEvent"]["kv"]["value"], STANDARD.encode(b"bar"));
        assert_eq!(json["etcdEvent"]["kv"]["mod_revision"], 7);
        assert!(json["time"].is_string());
    }

    #[test]
    fn test_delete_event_round_trip() {
        let event = Event::delete(b"gone".to_vec(), 12);
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.etcd_event.kind, EventKind::Delete);
        assert_eq!(back.etcd_event.kv.key, b"gone");
        assert!(back.etcd_event.kv.value.is_empty());
        assert_eq!(back.mod_revision(), 12);
    }

    #[test]
    fn test_producer_may_omit_value_and_revision() {
        // DELETE events from the producer omit the value; tombstones for
        // revision 0 omit mod_revision entirely.
        let json = r#"{
            "etcdEvent": { "type": "DELETE", "kv": { "key": "Zm9v" } },
            "time": "2024-03-01T10:00:00Z"
        }"#;
        let event: Event = serde_json::from_str(json).expect("deserialize");
        assert_eq!(event.etcd_event.kind, EventKind::Delete);
        assert_eq!(event.etcd_event.kv.key, b"foo");
        assert_eq!(event.mod_revision(), 0);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let json = r#"{
            "etcdEvent": { "type": "COMPACT", "kv": { "key": "Zm9v" } },
            "time": "2024-03-01T10:00:00Z"
        }"#;
        assert!(serde_json::from_str::<Event>(json).is_err());
    }

    #[test]
    fn test_event_list_preserves_order() {
        let events = vec![
            Event::put(b"a".to_vec(), b"1".to_vec(), 6),
            Event::put(b"b".to_vec(), b"2".to_vec(), 6),
            Event::delete(b"a".to_vec(), 7),
        ];
        let json = serde_json::to_string(&events).expect("serialize");
        let back: Vec<Event> = serde_json::from_str(&json).expect("deserialize");
        let revisions: Vec<i64> = back.iter().map(Event::mod_revision).collect();
        assert_eq!(revisions, vec![6, 6, 7]);
    }
}
