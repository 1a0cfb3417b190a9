use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown record status: {0}")]
    UnknownStatus(String),
    #[error("unknown store side: {0}")]
    UnknownSide(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Synced,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Synced => "synced",
            RecordStatus::Failed => "failed",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(RecordStatus::Pending),
            "synced" => Ok(RecordStatus::Synced),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two replicated stores. `A` is the document store, `B` the
/// relational one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreSide {
    A,
    B,
}

impl StoreSide {
    pub fn other(self) -> Self {
        match self {
            StoreSide::A => StoreSide::B,
            StoreSide::B => StoreSide::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreSide::A => "A",
            StoreSide::B => "B",
        }
    }
}

impl FromStr for StoreSide {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "A" | "a" => Ok(StoreSide::A),
            "B" | "b" => Ok(StoreSide::B),
            other => Err(RecordError::UnknownSide(other.to_string())),
        }
    }
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue address of a record: the `(entity_type, id)` pair. The
/// `{entity_type}_{id}` rendering is for display only and may be ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_type: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub entity_type: String,
    pub id: String,
    pub payload: Vec<u8>,
    pub encrypted: bool,
    pub max_retries: u32,
    pub origin: Option<StoreSide>,
}

impl NewRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.entity_type, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub entity_type: String,
    pub id: String,
    pub payload: Vec<u8>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub encrypted: bool,
    pub last_error: Option<String>,
    pub origin: Option<StoreSide>,
    /// Bumped by every enqueue of the same key; transitions are guarded by it.
    pub revision: i64,
    /// Position in drain order.
    pub seq: i64,
}

impl SyncRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.entity_type, &self.id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }
}

/// Result of a guarded status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        status: RecordStatus,
        retry_count: u32,
    },
    /// The record was re-enqueued, resolved, or purged since it was read.
    Stale,
}

impl Transition {
    pub fn status(&self) -> Option<RecordStatus> {
        match self {
            Transition::Applied { status, .. } => Some(*status),
            Transition::Stale => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total: u64,
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

impl SyncStats {
    pub fn add(&mut self, status: RecordStatus, count: u64) {
        match status {
            RecordStatus::Pending => self.pending += count,
            RecordStatus::Synced => self.synced += count,
            RecordStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_renders_entity_and_id() {
        let key = RecordKey::new("motos", "m1");
        assert_eq!(key.to_string(), "motos_m1");
    }

    #[test]
    fn status_parses_its_own_rendering() {
        for status in [
            RecordStatus::Pending,
            RecordStatus::Synced,
            RecordStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert_eq!(
            "queued".parse::<RecordStatus>(),
            Err(RecordError::UnknownStatus("queued".into()))
        );
    }

    #[test]
    fn stats_accumulate_totals() {
        let mut stats = SyncStats::default();
        stats.add(RecordStatus::Pending, 2);
        stats.add(RecordStatus::Failed, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.synced, 0);
    }

    #[test]
    fn other_side_flips() {
        assert_eq!(StoreSide::A.other(), StoreSide::B);
        assert_eq!(StoreSide::B.other(), StoreSide::A);
    }
}
