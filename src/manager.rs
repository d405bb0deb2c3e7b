//! The sync orchestrator: initial and incremental reconciliation between a
//! primary and a secondary module.
//!
//! One manager drives one entity pair. Sync passes on the same manager are
//! serialized through an internal lock; row lookups and writes are otherwise
//! unguarded, so concurrent passes over the same pair must not be introduced
//! upstream.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{SyncSettings, SyncTypeConfig};
use crate::error::{Result, SyncError};
use crate::hash::{canonical_string, hash_value};
use crate::module::{RecordOutcome, SyncModule};
use crate::record::{is_blank, SyncRecord};
use crate::store::{repo, DataIdentifier, Pool, SyncRow};

pub struct SyncManager {
    primary: Arc<dyn SyncModule>,
    secondary: Arc<dyn SyncModule>,
    config: Arc<SyncTypeConfig>,
    settings: SyncSettings,
    pool: Pool,
    flight: Mutex<()>,
}

/// Aggregate result of an initial sync pass.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Pairs matched across both sides (no create call needed).
    pub matched: usize,
    /// Records already reconciled on an earlier pass.
    pub unchanged: usize,
    /// Records without match data skipped for this pass.
    pub skipped_missing_match: usize,
    pub primary_created: Vec<RecordOutcome>,
    pub primary_updated: Vec<RecordOutcome>,
    pub secondary_created: Vec<RecordOutcome>,
    pub secondary_updated: Vec<RecordOutcome>,
}

impl SyncReport {
    pub fn created_count(&self) -> usize {
        count_ok(&self.primary_created) + count_ok(&self.secondary_created)
    }

    pub fn updated_count(&self) -> usize {
        count_ok(&self.primary_updated) + count_ok(&self.secondary_updated)
    }

    pub fn failure_count(&self) -> usize {
        [
            &self.primary_created,
            &self.primary_updated,
            &self.secondary_created,
            &self.secondary_updated,
        ]
        .iter()
        .flat_map(|outcomes| outcomes.iter())
        .filter(|outcome| outcome.is_failure())
        .count()
    }
}

fn count_ok(outcomes: &[RecordOutcome]) -> usize {
    outcomes.iter().filter(|o| !o.is_failure()).count()
}

/// Callback surface handed to module batch hooks, so a module can confirm
/// each native write without holding the whole manager.
pub struct SyncContext<'a> {
    manager: &'a SyncManager,
}

impl SyncContext<'_> {
    pub fn settings(&self) -> &SyncSettings {
        &self.manager.settings
    }

    /// Record a successful native create: refresh the row's content hash,
    /// then store the new `{entity, id, hash}` identifier. The hash goes
    /// first so a failed identifier write leaves the row on the create path
    /// for the next pass.
    pub async fn confirm_create(
        &self,
        record: &SyncRecord,
        created_id: Value,
        entity_id: &str,
    ) -> Result<SyncRow> {
        let sync_id = record.sync_id().ok_or_else(|| {
            SyncError::Internal("confirm_create called for a record with no sync id".into())
        })?;
        let hash = record.hash_data(self.manager.settings.omit_empty_strings_from_data);
        repo::update_hash(&self.manager.pool, sync_id, &hash).await?;
        let ident = DataIdentifier {
            entity: entity_id.to_string(),
            hash: hash_value(&created_id),
            id: created_id,
        };
        repo::add_data_identifier(&self.manager.pool, sync_id, &ident).await
    }

    /// Record a successful native update by refreshing the stored hash.
    pub async fn confirm_update(&self, record: &SyncRecord) -> Result<()> {
        let sync_id = record.sync_id().ok_or_else(|| {
            SyncError::Internal("confirm_update called for a record with no sync id".into())
        })?;
        let hash = record.hash_data(self.manager.settings.omit_empty_strings_from_data);
        repo::update_hash(&self.manager.pool, sync_id, &hash).await
    }
}

impl SyncManager {
    pub fn new(
        primary: Arc<dyn SyncModule>,
        secondary: Arc<dyn SyncModule>,
        config: Arc<SyncTypeConfig>,
        settings: SyncSettings,
        pool: Pool,
    ) -> Self {
        Self {
            primary,
            secondary,
            config,
            settings,
            pool,
            flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Arc<SyncTypeConfig> {
        &self.config
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Full reconciliation: pull both record sets, match by hash, merge
    /// field-by-field, then create what each side is missing.
    pub async fn initial_sync(&self) -> Result<SyncReport> {
        let _flight = self.flight.lock().await;
        let started = Instant::now();
        let primary_entity = self.primary.entity_id().to_string();
        let secondary_entity = self.secondary.entity_id().to_string();

        let t = Instant::now();
        let mut primary_arr = self.primary.all_sync_records(&self.config).await?;
        debug!(
            count = primary_arr.len(),
            sync_type = self.config.name(),
            module = self.primary.name(),
            elapsed_ms = t.elapsed().as_millis() as u64,
            "retrieved primary records"
        );
        let t = Instant::now();
        let mut secondary_arr = self.secondary.all_sync_records(&self.config).await?;
        debug!(
            count = secondary_arr.len(),
            sync_type = self.config.name(),
            module = self.secondary.name(),
            elapsed_ms = t.elapsed().as_millis() as u64,
            "retrieved secondary records"
        );

        let mut report = SyncReport::default();
        let mut create_in_secondary: Vec<SyncRecord> = Vec::new();
        let mut create_in_primary: Vec<SyncRecord> = Vec::new();

        // Records without match data can never pair.
        let primary_unmatchable = drain_missing_match(&mut primary_arr);
        let secondary_unmatchable = drain_missing_match(&mut secondary_arr);
        if self.settings.ignore_empty_match_values {
            if !primary_unmatchable.is_empty() || !secondary_unmatchable.is_empty() {
                debug!(
                    primary = primary_unmatchable.len(),
                    secondary = secondary_unmatchable.len(),
                    "routing records without match data through the create path"
                );
            }
            create_in_secondary.extend(primary_unmatchable);
            create_in_primary.extend(secondary_unmatchable);
        } else {
            report.skipped_missing_match =
                primary_unmatchable.len() + secondary_unmatchable.len();
            debug!(
                skipped = report.skipped_missing_match,
                "skipping records without match data"
            );
        }

        if self.settings.use_first_matching_duplicate {
            let before = primary_arr.len() + secondary_arr.len();
            dedup_by_match_hash(&mut primary_arr);
            dedup_by_match_hash(&mut secondary_arr);
            let dropped = before - primary_arr.len() - secondary_arr.len();
            if dropped > 0 {
                debug!(dropped, "removed duplicate match hashes, first record wins");
            }
        } else {
            self.ensure_unique_match_hashes(&primary_arr)?;
            self.ensure_unique_match_hashes(&secondary_arr)?;
        }

        // Partition into matched pairs and per-side create sets.
        let primary_hashes: HashSet<String> = primary_arr
            .iter()
            .map(|r| r.match_hash().to_string())
            .collect();
        let mut secondary_by_hash: HashMap<String, SyncRecord> = HashMap::new();
        for rec in secondary_arr {
            if primary_hashes.contains(rec.match_hash()) {
                secondary_by_hash.insert(rec.match_hash().to_string(), rec);
            } else {
                create_in_primary.push(rec);
            }
        }
        let mut pairs: Vec<(SyncRecord, SyncRecord)> = Vec::new();
        for rec in primary_arr {
            match secondary_by_hash.remove(rec.match_hash()) {
                Some(sec) => pairs.push((rec, sec)),
                None => create_in_secondary.push(rec),
            }
        }
        report.matched = pairs.len();

        // Merge matched pairs and persist one row per pair; both sides exist
        // already so no create call is needed.
        let mut primary_update: Vec<SyncRecord> = Vec::new();
        let mut secondary_update: Vec<SyncRecord> = Vec::new();
        for (primary_rec, secondary_rec) in pairs {
            let merged = merge_pair(&self.config, &self.settings, primary_rec, secondary_rec);
            let (mut primary_rec, mut secondary_rec) = (merged.primary, merged.secondary);
            let row = self
                .create_sync_row(
                    &[&primary_rec, &secondary_rec],
                    &[primary_entity.clone(), secondary_entity.clone()],
                )
                .await?;
            primary_rec.set_sync_id(&row.id);
            secondary_rec.set_sync_id(&row.id);
            if merged.primary_changed && !self.settings.is_unidirectional {
                primary_update.push(primary_rec);
            }
            if merged.secondary_changed {
                secondary_update.push(secondary_rec);
            }
        }

        // Rows for unmatched records, one identifier each. A row that already
        // carries the target side's identifier was reconciled on an earlier
        // pass and needs no create call.
        let mut primary_create: Vec<SyncRecord> = Vec::new();
        if !self.settings.is_unidirectional {
            for mut rec in create_in_primary {
                let row = self
                    .create_sync_row(&[&rec], &[secondary_entity.clone(), primary_entity.clone()])
                    .await?;
                if row.has_entity_identifier(&primary_entity) {
                    report.unchanged += 1;
                    continue;
                }
                rec.set_sync_id(&row.id);
                primary_create.push(rec);
            }
        } else if !create_in_primary.is_empty() {
            debug!(
                count = create_in_primary.len(),
                "unidirectional sync, skipping primary-side creates"
            );
        }
        let mut secondary_create: Vec<SyncRecord> = Vec::new();
        for mut rec in create_in_secondary {
            let row = self
                .create_sync_row(&[&rec], &[primary_entity.clone(), secondary_entity.clone()])
                .await?;
            if row.has_entity_identifier(&secondary_entity) {
                report.unchanged += 1;
                continue;
            }
            rec.set_sync_id(&row.id);
            secondary_create.push(rec);
        }

        debug!(
            update = primary_update.len(),
            create = primary_create.len(),
            module = self.primary.name(),
            "primary-side changes"
        );
        debug!(
            update = secondary_update.len(),
            create = secondary_create.len(),
            module = self.secondary.name(),
            "secondary-side changes"
        );

        let ctx = SyncContext { manager: self };
        if !self.settings.is_unidirectional {
            if !primary_update.is_empty() {
                report.primary_updated = self.primary.batch_update(primary_update, &ctx).await?;
            }
            if !primary_create.is_empty() {
                report.primary_created = self.primary.batch_create(primary_create, &ctx).await?;
            }
        }
        if !secondary_update.is_empty() {
            report.secondary_updated = self.secondary.batch_update(secondary_update, &ctx).await?;
        }
        if !secondary_create.is_empty() {
            report.secondary_created = self.secondary.batch_create(secondary_create, &ctx).await?;
        }

        debug!(
            matched = report.matched,
            created = report.created_count(),
            updated = report.updated_count(),
            failed = report.failure_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "initial sync complete"
        );
        Ok(report)
    }

    /// Incremental reconciliation for a delta of primary-side records: no-op
    /// when the stored hash is unchanged, update the secondary side when it
    /// differs, create when the secondary side is missing.
    pub async fn sync(&self, records: Vec<SyncRecord>) -> Result<Vec<RecordOutcome>> {
        let _flight = self.flight.lock().await;
        let primary_entity = self.primary.entity_id().to_string();
        let secondary_entity = self.secondary.entity_id().to_string();
        let secondary_name = self.secondary.name().to_string();

        let mut batch_updates: Vec<SyncRecord> = Vec::new();
        let mut batch_creates: Vec<SyncRecord> = Vec::new();
        let mut unchanged: Vec<RecordOutcome> = Vec::new();

        for mut record in records {
            let data_hash = record.hash_data(self.settings.omit_empty_strings_from_data);
            let row = repo::get_sync_row(
                &self.pool,
                self.config.name(),
                record.data_identifier(),
                &primary_entity,
            )
            .await?;

            match row {
                Some(row) => {
                    let hash_match = row.hash == data_hash;
                    if row.data_identifiers.len() > 1 {
                        if hash_match {
                            debug!(sync_id = %row.id, "content hash unchanged, nothing to do");
                            unchanged.push(RecordOutcome::unchanged(
                                record.data_identifier().clone(),
                                row.id.clone(),
                            ));
                        } else {
                            debug!(sync_id = %row.id, "previously synced but content changed, updating");
                            let secondary_id = row.entity_native_id(&secondary_entity)?.clone();
                            let mut secondary_rec = SyncRecord::from_canonical(
                                &self.config,
                                &secondary_name,
                                secondary_id,
                                record.data().clone(),
                            );
                            secondary_rec.set_sync_id(&row.id);
                            batch_updates.push(secondary_rec);
                        }
                    } else {
                        // One identifier only: the secondary side is missing
                        // (earlier failure or filter), so create it.
                        debug!(sync_id = %row.id, "secondary side missing, creating");
                        record.set_sync_id(&row.id);
                        batch_creates.push(record);
                    }
                }
                None => {
                    debug!("no sync row, creating one and routing through the create path");
                    let row = self
                        .create_sync_row(
                            &[&record],
                            &[primary_entity.clone(), secondary_entity.clone()],
                        )
                        .await?;
                    record.set_sync_id(&row.id);
                    batch_creates.push(record);
                }
            }
        }

        let ctx = SyncContext { manager: self };
        let mut results: Vec<RecordOutcome> = Vec::new();
        if !batch_updates.is_empty() {
            results.extend(self.secondary.batch_update(batch_updates, &ctx).await?);
        }
        if !batch_creates.is_empty() {
            results.extend(self.secondary.batch_create(batch_creates, &ctx).await?);
        }
        results.extend(unchanged);
        Ok(results)
    }

    /// Persist (or refresh) the sync row for the given records. The first
    /// record is the identity anchor; `entities` lists every participating
    /// side, including ones without a record yet.
    async fn create_sync_row(
        &self,
        records: &[&SyncRecord],
        entities: &[String],
    ) -> Result<SyncRow> {
        let identifiers: Vec<DataIdentifier> = records
            .iter()
            .zip(entities.iter())
            .map(|(rec, entity)| DataIdentifier {
                entity: entity.clone(),
                id: rec.data_identifier().clone(),
                hash: rec.data_identifier_hash().to_string(),
            })
            .collect();
        let anchor = records[0];
        let hash = anchor.hash_data(self.settings.omit_empty_strings_from_data);
        repo::upsert_sync_row(&self.pool, self.config.name(), &hash, entities, &identifiers).await
    }

    fn ensure_unique_match_hashes(&self, records: &[SyncRecord]) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for rec in records {
            if !seen.insert(rec.match_hash()) {
                return Err(SyncError::MultipleMatches {
                    name: self.config.name().to_string(),
                    identifier: canonical_string(rec.data_identifier()),
                });
            }
        }
        Ok(())
    }
}

fn drain_missing_match(records: &mut Vec<SyncRecord>) -> Vec<SyncRecord> {
    let (keep, missing): (Vec<_>, Vec<_>) = std::mem::take(records)
        .into_iter()
        .partition(|rec| !rec.missing_match_data());
    *records = keep;
    missing
}

fn dedup_by_match_hash(records: &mut Vec<SyncRecord>) {
    let mut seen: HashSet<String> = HashSet::new();
    records.retain(|rec| seen.insert(rec.match_hash().to_string()));
}

struct MergedPair {
    primary: SyncRecord,
    secondary: SyncRecord,
    primary_changed: bool,
    secondary_changed: bool,
}

/// Field-by-field merge of a matched pair. The primary value wins unless it
/// is blank and the secondary's is not; a blank value never overwrites a
/// non-blank one. Under unidirectional sync the primary is never changed.
fn merge_pair(
    config: &Arc<SyncTypeConfig>,
    settings: &SyncSettings,
    primary: SyncRecord,
    secondary: SyncRecord,
) -> MergedPair {
    let mut primary_data = primary.data().clone();
    let mut secondary_data = secondary.data().clone();
    let mut primary_changed = false;
    let mut secondary_changed = false;

    for key in config.keys() {
        let pv = primary_data.get(key).cloned().unwrap_or(Value::Null);
        let sv = secondary_data.get(key).cloned().unwrap_or(Value::Null);
        if values_equivalent(&pv, &sv) {
            continue;
        }
        if is_blank(&pv) && !is_blank(&sv) && !settings.is_unidirectional {
            primary_data.insert(key.clone(), sv);
            primary_changed = true;
        } else if !is_blank(&pv) {
            secondary_data.insert(key.clone(), pv);
            secondary_changed = true;
        }
    }

    let primary = if primary_changed {
        SyncRecord::from_canonical(
            config,
            primary.module_name(),
            primary.data_identifier().clone(),
            primary_data,
        )
    } else {
        primary
    };
    let secondary = if secondary_changed {
        SyncRecord::from_canonical(
            config,
            secondary.module_name(),
            secondary.data_identifier().clone(),
            secondary_data,
        )
    } else {
        secondary
    };
    MergedPair {
        primary,
        secondary,
        primary_changed,
        secondary_changed,
    }
}

/// Value comparison that never equates a number with a blank: `0` is a real
/// value, not an empty one.
fn values_equivalent(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if a.is_number() || b.is_number() {
        return false;
    }
    is_falsy(a) && is_falsy(b)
}

fn is_falsy(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(false)) || is_blank(value)
}
