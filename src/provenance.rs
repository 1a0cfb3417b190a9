// ABOUTME: Provenance tags attached to replicated writes for loop suppression
// ABOUTME: Envelope pairs a payload with the tag stored alongside it

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_queue::StoreSide;

use crate::codec;

/// Column or field name under which both stores persist the tag.
pub const PROVENANCE_FIELD: &str = "_provenance";

/// Marks a write as produced by replication out of one store.
///
/// `digest` is the canonical hash of the payload as it was written. A change
/// event is only treated as an echo when the tag names the opposite store
/// and the digest still matches the event's payload, so a later independent
/// edit of the same row is never mistaken for an echo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceTag {
    #[serde(default)]
    pub originated_from_a: bool,
    #[serde(default)]
    pub originated_from_b: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ProvenanceTag {
    pub fn from_origin(origin: StoreSide, digest: String) -> Self {
        Self {
            originated_from_a: origin == StoreSide::A,
            originated_from_b: origin == StoreSide::B,
            digest: Some(digest),
        }
    }

    pub fn originated_from(&self, side: StoreSide) -> bool {
        match side {
            StoreSide::A => self.originated_from_a,
            StoreSide::B => self.originated_from_b,
        }
    }

    pub fn is_tagged(&self) -> bool {
        self.originated_from_a || self.originated_from_b
    }
}

/// A payload together with its provenance, as read from or written to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Value,
    pub provenance: ProvenanceTag,
}

impl Envelope {
    /// An application write with no replication history.
    pub fn untagged(payload: Value) -> Self {
        Self {
            payload,
            provenance: ProvenanceTag::default(),
        }
    }

    /// A write produced by replicating `payload` out of `origin`.
    pub fn tagged(payload: Value, origin: StoreSide) -> Self {
        let digest = codec::hash(&payload);
        Self {
            payload,
            provenance: ProvenanceTag::from_origin(origin, digest),
        }
    }

    pub fn digest(&self) -> String {
        codec::hash(&self.payload)
    }

    /// True when this envelope is exactly the replica of a write made on `origin`.
    pub fn is_replica_from(&self, origin: StoreSide) -> bool {
        self.provenance.originated_from(origin)
            && self.provenance.digest.as_deref() == Some(self.digest().as_str())
    }

    /// Decode the tag stored next to a payload. Missing or unreadable tags
    /// count as untagged.
    pub fn from_parts(payload: Value, provenance: Option<Value>) -> Self {
        let provenance = provenance
            .filter(|value| !value.is_null())
            .and_then(|value| match serde_json::from_value(value) {
                Ok(tag) => Some(tag),
                Err(e) => {
                    tracing::warn!("ignoring unreadable provenance tag: {}", e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            payload,
            provenance,
        }
    }

    pub fn provenance_value(&self) -> Value {
        serde_json::to_value(&self.provenance).unwrap_or(Value::Null)
    }
}
