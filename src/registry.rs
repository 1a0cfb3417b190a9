// ABOUTME: Static registry mapping entity types to store locations and sync policy
// ABOUTME: Validated once at startup and shared read-only afterwards

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sync_queue::record::DEFAULT_MAX_RETRIES;
use sync_queue::StoreSide;
use thiserror::Error;

use crate::error::{SyncError, SyncResult};
use crate::provenance::PROVENANCE_FIELD;
use crate::store::StoreTarget;
use crate::utils::{sanitize_identifier, validate_identifier};

/// Columns the relational store reserves next to the key column.
const RESERVED_KEY_FIELDS: &[&str] = &["data", PROVENANCE_FIELD, "_updated_at"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no entity types configured")]
    Empty,
    #[error("entity type '{0}' is configured more than once")]
    Duplicate(String),
    #[error("entity type '{entity_type}': invalid {field}: {reason}")]
    InvalidIdentifier {
        entity_type: String,
        field: &'static str,
        reason: String,
    },
    #[error("entity type '{entity_type}': max_retries must be at least 1")]
    ZeroRetries { entity_type: String },
}

/// Which way changes of an entity type may flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "both")]
    Both,
    #[serde(rename = "AtoB", alias = "a-to-b")]
    AtoB,
    #[serde(rename = "BtoA", alias = "b-to-a")]
    BtoA,
}

impl Direction {
    /// Whether a change originating on `source` may be mirrored to the other store.
    pub fn allows(self, source: StoreSide) -> bool {
        matches!(
            (self, source),
            (Direction::Both, _) | (Direction::AtoB, StoreSide::A) | (Direction::BtoA, StoreSide::B)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Both => "both",
            Direction::AtoB => "AtoB",
            Direction::BtoA => "BtoA",
        }
    }
}

/// A one-way copy used by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Flow {
    #[value(name = "a-to-b")]
    AtoB,
    #[value(name = "b-to-a")]
    BtoA,
}

impl Flow {
    pub fn source(self) -> StoreSide {
        match self {
            Flow::AtoB => StoreSide::A,
            Flow::BtoA => StoreSide::B,
        }
    }

    pub fn destination(self) -> StoreSide {
        self.source().other()
    }
}

impl std::fmt::Display for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source(), self.destination())
    }
}

fn default_key_field() -> String {
    "id".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_primary() -> StoreSide {
    StoreSide::A
}

/// Replication policy for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub entity_type: String,
    pub store_a_collection: String,
    pub store_b_table: String,
    #[serde(default = "default_key_field")]
    pub unique_key_field: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Store that receives queued writes of unknown origin when `direction` is `both`.
    #[serde(default = "default_primary")]
    pub primary: StoreSide,
}

impl SyncConfig {
    pub fn new(
        entity_type: impl Into<String>,
        store_a_collection: impl Into<String>,
        store_b_table: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            store_a_collection: store_a_collection.into(),
            store_b_table: store_b_table.into(),
            unique_key_field: default_key_field(),
            encrypted: false,
            direction: Direction::Both,
            max_retries: DEFAULT_MAX_RETRIES,
            primary: StoreSide::A,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_encryption(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.unique_key_field = field.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_primary(mut self, primary: StoreSide) -> Self {
        self.primary = primary;
        self
    }

    /// Collection or table holding this entity type on `side`.
    pub fn location(&self, side: StoreSide) -> &str {
        match side {
            StoreSide::A => &self.store_a_collection,
            StoreSide::B => &self.store_b_table,
        }
    }

    pub fn target(&self, side: StoreSide) -> StoreTarget<'_> {
        StoreTarget {
            name: self.location(side),
            key_field: &self.unique_key_field,
        }
    }

    /// Store a queued write should land in.
    ///
    /// A record that came from one store goes to the other, provided the
    /// direction allows that flow. A record with no known origin goes to the
    /// upstream store of a one-way entity, or to `primary` for `both`.
    /// `None` means the direction forbids the write.
    pub fn write_target(&self, origin: Option<StoreSide>) -> Option<StoreSide> {
        match origin {
            Some(origin) if self.direction.allows(origin) => Some(origin.other()),
            Some(_) => None,
            None => Some(match self.direction {
                Direction::AtoB => StoreSide::A,
                Direction::BtoA => StoreSide::B,
                Direction::Both => self.primary,
            }),
        }
    }

    pub fn is_compatible_with(&self, flow: Flow) -> bool {
        self.direction.allows(flow.source())
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let checks: [(&'static str, &str); 4] = [
            ("entity_type", &self.entity_type),
            ("store_a_collection", &self.store_a_collection),
            ("store_b_table", &self.store_b_table),
            ("unique_key_field", &self.unique_key_field),
        ];
        for (field, value) in checks {
            validate_identifier(value).map_err(|e| RegistryError::InvalidIdentifier {
                entity_type: sanitize_identifier(&self.entity_type),
                field,
                reason: e.to_string(),
            })?;
        }
        if RESERVED_KEY_FIELDS.contains(&self.unique_key_field.as_str()) {
            return Err(RegistryError::InvalidIdentifier {
                entity_type: self.entity_type.clone(),
                field: "unique_key_field",
                reason: format!("'{}' is reserved", self.unique_key_field),
            });
        }
        if self.max_retries == 0 {
            return Err(RegistryError::ZeroRetries {
                entity_type: self.entity_type.clone(),
            });
        }
        Ok(())
    }
}

/// Entity type to [`SyncConfig`] lookup.
#[derive(Debug, Clone)]
pub struct SyncRegistry {
    entries: BTreeMap<String, SyncConfig>,
}

impl SyncRegistry {
    pub fn new(configs: impl IntoIterator<Item = SyncConfig>) -> Result<Self, RegistryError> {
        let mut entries = BTreeMap::new();
        for config in configs {
            config.validate()?;
            if entries.contains_key(&config.entity_type) {
                return Err(RegistryError::Duplicate(config.entity_type));
            }
            entries.insert(config.entity_type.clone(), config);
        }
        if entries.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn resolve(&self, entity_type: &str) -> SyncResult<&SyncConfig> {
        self.entries
            .get(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(sanitize_identifier(entity_type)))
    }

    /// All configurations, ordered by entity type.
    pub fn configs(&self) -> impl Iterator<Item = &SyncConfig> {
        self.entries.values()
    }

    pub fn compatible_with(&self, flow: Flow) -> impl Iterator<Item = &SyncConfig> {
        self.entries
            .values()
            .filter(move |config| config.is_compatible_with(flow))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
