//! The capability trait a module manager implements to take part in a sync.
//!
//! This is deliberately narrow: bulk read plus batch create/update hooks.
//! API-client concerns (auth, transport, rate limits) live with the module
//! implementation and are composed, not inherited.
//!
//! Contract for the batch hooks: failures are isolated per record. A record
//! that cannot be written becomes a [`RecordOutcome`] failure in the returned
//! list; it must not abort the rest of the batch. After each successful
//! native write the hook reports back through [`SyncContext::confirm_create`]
//! or [`SyncContext::confirm_update`] so the durable sync state stays true.
//!
//! [`SyncContext::confirm_create`]: crate::manager::SyncContext::confirm_create
//! [`SyncContext::confirm_update`]: crate::manager::SyncContext::confirm_update

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SyncTypeConfig;
use crate::error::{Result, SyncError};
use crate::manager::SyncContext;
use crate::record::SyncRecord;

/// Per-record result of a batch hook or a no-op decision.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub data_identifier: Value,
    pub sync_id: Option<String>,
    pub kind: OutcomeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Created,
    Updated,
    Unchanged,
    Failed(String),
}

impl RecordOutcome {
    pub fn created(record: &SyncRecord) -> Self {
        Self::from_record(record, OutcomeKind::Created)
    }

    pub fn updated(record: &SyncRecord) -> Self {
        Self::from_record(record, OutcomeKind::Updated)
    }

    pub fn unchanged(data_identifier: Value, sync_id: String) -> Self {
        Self {
            data_identifier,
            sync_id: Some(sync_id),
            kind: OutcomeKind::Unchanged,
        }
    }

    pub fn failed(record: &SyncRecord, message: impl Into<String>) -> Self {
        Self::from_record(record, OutcomeKind::Failed(message.into()))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed(_))
    }

    fn from_record(record: &SyncRecord, kind: OutcomeKind) -> Self {
        Self {
            data_identifier: record.data_identifier().clone(),
            sync_id: record.sync_id().map(str::to_string),
            kind,
        }
    }
}

#[async_trait]
pub trait SyncModule: Send + Sync {
    /// Module name, the key into the sync type's field maps.
    fn name(&self) -> &str;

    /// Entity id of this module-side integration endpoint.
    fn entity_id(&self) -> &str;

    /// Bulk read: every native record wrapped as a [`SyncRecord`].
    async fn all_sync_records(&self, config: &Arc<SyncTypeConfig>) -> Result<Vec<SyncRecord>>;

    /// Create the given records natively, confirming each success through
    /// `ctx`. One outcome per record, failures isolated.
    async fn batch_create(
        &self,
        records: Vec<SyncRecord>,
        ctx: &SyncContext<'_>,
    ) -> Result<Vec<RecordOutcome>>;

    /// Update the given records natively (each carries this module's native
    /// id as its data identifier), confirming each success through `ctx`.
    async fn batch_update(
        &self,
        records: Vec<SyncRecord>,
        ctx: &SyncContext<'_>,
    ) -> Result<Vec<RecordOutcome>>;
}

/// In-process module backed by a JSON map of native records keyed by id.
///
/// Used by the demo runner and as a test double; stands in for a real API
/// client the way a mock backend would.
pub struct MemoryModule {
    name: String,
    entity_id: String,
    records: Mutex<BTreeMap<String, Value>>,
}

impl MemoryModule {
    pub fn new(name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::with_records(name, entity_id, Vec::new())
    }

    pub fn with_records(
        name: impl Into<String>,
        entity_id: impl Into<String>,
        records: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_id: entity_id.into(),
            records: Mutex::new(records.into_iter().collect()),
        }
    }

    pub async fn insert(&self, id: impl Into<String>, record: Value) {
        self.records.lock().await.insert(id.into(), record);
    }

    /// Snapshot of the native records, for inspection.
    pub async fn records(&self) -> BTreeMap<String, Value> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl SyncModule for MemoryModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    async fn all_sync_records(&self, config: &Arc<SyncTypeConfig>) -> Result<Vec<SyncRecord>> {
        let records = self.records.lock().await;
        let mut out = Vec::with_capacity(records.len());
        for (id, native) in records.iter() {
            out.push(SyncRecord::from_native(
                config,
                &self.name,
                Value::String(id.clone()),
                native,
            )?);
        }
        Ok(out)
    }

    async fn batch_create(
        &self,
        records: Vec<SyncRecord>,
        ctx: &SyncContext<'_>,
    ) -> Result<Vec<RecordOutcome>> {
        debug!(module = %self.name, count = records.len(), "batch create called");
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let payload = match record.reverse_module_map(&self.name) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(module = %self.name, identifier = %record.data_identifier(), %err, "projection failed; skipping record");
                    results.push(RecordOutcome::failed(&record, err.to_string()));
                    continue;
                }
            };
            let new_id = Uuid::new_v4().to_string();
            self.records.lock().await.insert(new_id.clone(), payload);
            let row = ctx
                .confirm_create(&record, Value::String(new_id), &self.entity_id)
                .await?;
            let mut outcome = RecordOutcome::created(&record);
            outcome.sync_id = Some(row.id);
            results.push(outcome);
        }
        Ok(results)
    }

    async fn batch_update(
        &self,
        records: Vec<SyncRecord>,
        ctx: &SyncContext<'_>,
    ) -> Result<Vec<RecordOutcome>> {
        debug!(module = %self.name, count = records.len(), "batch update called");
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let native_id = match record.data_identifier() {
                Value::String(s) => s.clone(),
                other => {
                    results.push(RecordOutcome::failed(
                        &record,
                        format!("unsupported identifier {other}"),
                    ));
                    continue;
                }
            };
            let payload = match record.reverse_module_map(&self.name) {
                Ok(payload) => payload,
                Err(err) => {
                    results.push(RecordOutcome::failed(&record, err.to_string()));
                    continue;
                }
            };
            let found = {
                let mut map = self.records.lock().await;
                match map.get_mut(&native_id) {
                    Some(existing) => {
                        merge_native(existing, payload);
                        true
                    }
                    None => false,
                }
            };
            if found {
                ctx.confirm_update(&record).await?;
                results.push(RecordOutcome::updated(&record));
            } else {
                let err = SyncError::module(&self.name, format!("item {native_id} not found"));
                warn!(module = %self.name, %err, "update target not found");
                results.push(RecordOutcome::failed(&record, err.to_string()));
            }
        }
        Ok(results)
    }
}

/// Overlay the payload's fields onto the stored native record.
fn merge_native(existing: &mut Value, payload: Value) {
    match (existing, payload) {
        (Value::Object(existing), Value::Object(payload)) => {
            for (key, value) in payload {
                existing.insert(key, value);
            }
        }
        (existing, payload) => *existing = payload,
    }
}
