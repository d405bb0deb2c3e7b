//! The transient per-record wrapper used during a sync pass.
//!
//! A [`SyncRecord`] carries one module record in canonical shape together
//! with its match hash and identity hash. Records are immutable once built
//! (the sync-row back-reference is the only later assignment), so hashes can
//! never go stale against their data.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::config::{CanonicalData, SyncTypeConfig};
use crate::error::Result;
use crate::hash::{hash_value, hash_values};

#[derive(Debug, Clone)]
pub struct SyncRecord {
    config: Arc<SyncTypeConfig>,
    module_name: String,
    data_identifier: Value,
    data: CanonicalData,
    data_identifier_hash: String,
    match_hash: String,
    missing_match_data: bool,
    sync_id: Option<String>,
}

impl SyncRecord {
    /// Wrap a native record by running the module's field map over it.
    pub fn from_native(
        config: &Arc<SyncTypeConfig>,
        module_name: &str,
        data_identifier: Value,
        native: &Value,
    ) -> Result<Self> {
        let data = config.extract(module_name, native)?;
        Ok(Self::build(config, module_name, data_identifier, data))
    }

    /// Wrap already-canonical data verbatim, skipping the field map. Use
    /// with caution: the caller is asserting the data is canonical.
    pub fn from_canonical(
        config: &Arc<SyncTypeConfig>,
        module_name: &str,
        data_identifier: Value,
        data: CanonicalData,
    ) -> Self {
        Self::build(config, module_name, data_identifier, data)
    }

    fn build(
        config: &Arc<SyncTypeConfig>,
        module_name: &str,
        data_identifier: Value,
        data: CanonicalData,
    ) -> Self {
        let match_values: Vec<Value> = config
            .match_on()
            .iter()
            .map(|key| data.get(key).cloned().unwrap_or(Value::Null))
            .collect();
        let missing_match_data = match_values.iter().any(is_blank);
        if missing_match_data {
            warn!(
                sync_type = config.name(),
                module = module_name,
                identifier = %data_identifier,
                "record is missing match data; it will never be matched"
            );
        }
        Self {
            config: Arc::clone(config),
            module_name: module_name.to_string(),
            data_identifier_hash: hash_value(&data_identifier),
            match_hash: hash_values(&match_values),
            data_identifier,
            data,
            missing_match_data,
            sync_id: None,
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &Arc<SyncTypeConfig> {
        &self.config
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn data_identifier(&self) -> &Value {
        &self.data_identifier
    }

    pub fn data(&self) -> &CanonicalData {
        &self.data
    }

    pub fn data_identifier_hash(&self) -> &str {
        &self.data_identifier_hash
    }

    pub fn match_hash(&self) -> &str {
        &self.match_hash
    }

    pub fn missing_match_data(&self) -> bool {
        self.missing_match_data
    }

    pub fn sync_id(&self) -> Option<&str> {
        self.sync_id.as_deref()
    }

    /// Record the persisted sync row this record reconciled into.
    pub fn set_sync_id(&mut self, id: impl Into<String>) {
        self.sync_id = Some(id.into());
    }

    /// The only equality notion between records: match-hash equality.
    pub fn equals(&self, other: &SyncRecord) -> bool {
        self.match_hash == other.match_hash
    }

    /// True iff the field is blank (null, absent, or empty string), i.e. an
    /// update merge may overwrite it without losing information.
    pub fn data_key_is_replaceable(&self, key: &str) -> bool {
        self.data.get(key).map_or(true, is_blank)
    }

    /// Content hash over all keys in configured order. With
    /// `omit_empty_strings` set, empty-string fields hash as absent so that
    /// "never set" and "set to empty" compare equal.
    pub fn hash_data(&self, omit_empty_strings: bool) -> String {
        let values: Vec<Value> = self
            .config
            .keys()
            .iter()
            .map(|key| match self.data.get(key) {
                Some(Value::String(s)) if omit_empty_strings && s.is_empty() => Value::Null,
                Some(value) => value.clone(),
                None => Value::Null,
            })
            .collect();
        hash_values(&values)
    }

    /// Project this record's canonical data into the named module's native
    /// payload shape.
    pub fn reverse_module_map(&self, module: &str) -> Result<Value> {
        self.config.project(module, &self.data)
    }
}

pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
