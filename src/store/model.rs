//! Typed rows for the sync store.
//!
//! Keep these structs focused on the data returned by queries. Sync policy
//! lives in the manager.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Native-record identifier for one module side of a sync row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataIdentifier {
    /// Entity id of the module-side integration endpoint.
    pub entity: String,
    /// Opaque native key (row id string, composite JSON object, ...).
    pub id: Value,
    /// Content hash of `id`, the persisted per-entity lookup key.
    pub hash: String,
}

/// One persisted sync row: the unit of idempotency across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRow {
    pub id: String,
    pub name: String,
    /// Last-known content hash of the full canonical record.
    pub hash: String,
    pub entities: Vec<String>,
    pub data_identifiers: Vec<DataIdentifier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRow {
    /// Native key recorded for the given entity.
    pub fn entity_native_id(&self, entity: &str) -> Result<&Value> {
        self.data_identifiers
            .iter()
            .find(|ident| ident.entity == entity)
            .map(|ident| &ident.id)
            .ok_or_else(|| SyncError::EntityNotFound {
                entity: entity.to_string(),
            })
    }

    /// Whether the given entity already has a native identifier recorded.
    pub fn has_entity_identifier(&self, entity: &str) -> bool {
        self.data_identifiers
            .iter()
            .any(|ident| ident.entity == entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> SyncRow {
        SyncRow {
            id: "row-1".into(),
            name: "AccountSync".into(),
            hash: "h".into(),
            entities: vec!["e1".into(), "e2".into()],
            data_identifiers: vec![DataIdentifier {
                entity: "e1".into(),
                id: json!("cb-1"),
                hash: "ih".into(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn entity_native_id_found() {
        assert_eq!(row().entity_native_id("e1").unwrap(), &json!("cb-1"));
    }

    #[test]
    fn entity_native_id_missing_fails() {
        let err = row().entity_native_id("e2").unwrap_err();
        assert!(matches!(err, SyncError::EntityNotFound { .. }));
    }

    #[test]
    fn has_entity_identifier_reflects_sides() {
        let row = row();
        assert!(row.has_entity_identifier("e1"));
        assert!(!row.has_entity_identifier("e2"));
    }
}
