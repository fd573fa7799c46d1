use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Every tenant-scoped table.
///
/// Variants are declared in erasure order: children ahead of their parents,
/// credentials last so a tenant can still be diagnosed if erasure aborts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sales,
    InventorySnapshots,
    Recommendations,
    SyncEvents,
    Products,
    RetentionPolicies,
    Credentials,
}

impl EntityKind {
    pub const ERASURE_ORDER: [EntityKind; 7] = [
        EntityKind::Sales,
        EntityKind::InventorySnapshots,
        EntityKind::Recommendations,
        EntityKind::SyncEvents,
        EntityKind::Products,
        EntityKind::RetentionPolicies,
        EntityKind::Credentials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sales => "sales",
            EntityKind::InventorySnapshots => "inventory_snapshots",
            EntityKind::Recommendations => "recommendations",
            EntityKind::SyncEvents => "sync_events",
            EntityKind::Products => "products",
            EntityKind::RetentionPolicies => "retention_policies",
            EntityKind::Credentials => "credentials",
        }
    }

    /// Physical table name. Only ever interpolated from this closed set.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Credentials => "pos_credentials",
            other => other.as_str(),
        }
    }

    /// Kinds whose rows are removed by the database when a product goes.
    pub fn cascades_from_products(&self) -> bool {
        matches!(
            self,
            EntityKind::Sales | EntityKind::InventorySnapshots | EntityKind::Recommendations
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data types a retention policy can govern.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Sales,
    Products,
    InventorySnapshots,
    Recommendations,
    SyncEvents,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Sales,
        DataType::Products,
        DataType::InventorySnapshots,
        DataType::Recommendations,
        DataType::SyncEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        self.entity().as_str()
    }

    pub fn entity(&self) -> EntityKind {
        match self {
            DataType::Sales => EntityKind::Sales,
            DataType::Products => EntityKind::Products,
            DataType::InventorySnapshots => EntityKind::InventorySnapshots,
            DataType::Recommendations => EntityKind::Recommendations,
            DataType::SyncEvents => EntityKind::SyncEvents,
        }
    }

    /// Column holding the age of a row for retention purposes.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            DataType::Sales => "sold_at",
            DataType::Products => "updated_at",
            DataType::InventorySnapshots => "captured_at",
            DataType::Recommendations => "generated_at",
            DataType::SyncEvents => "occurred_at",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|data_type| data_type.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "data type",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for DataType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
