use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use frigg_sync::config::{ModuleMapping, SyncSettings, SyncTypeConfig};
use frigg_sync::store;
use frigg_sync::{
    MemoryModule, OutcomeKind, RecordOutcome, SyncContext, SyncError, SyncManager, SyncModule,
    SyncRecord,
};

async fn setup_pool() -> store::Pool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

fn account_config() -> Arc<SyncTypeConfig> {
    let crossbeam = ModuleMapping::from_fields(&fields(&[
        ("accountName", "accountName"),
        ("domain", "domain"),
        ("partner", "partner"),
    ]));
    let monday = ModuleMapping::from_fields(&fields(&[
        ("accountName", "Account Name"),
        ("domain", "Domain"),
        ("partner", "Partner"),
    ]));
    SyncTypeConfig::builder("AccountSync")
        .keys(["accountName", "domain", "partner"])
        .match_on(["domain"])
        .module("crossbeam", crossbeam)
        .module("monday", monday)
        .build()
        .unwrap()
}

fn lead_config() -> Arc<SyncTypeConfig> {
    let crossbeam = ModuleMapping::from_fields(&fields(&[
        ("firstName", "firstName"),
        ("lastName", "lastName"),
        ("email", "email"),
    ]));
    let monday = ModuleMapping::from_fields(&fields(&[
        ("firstName", "First Name"),
        ("lastName", "Last Name"),
        ("email", "Email"),
    ]));
    SyncTypeConfig::builder("LeadSync")
        .keys(["firstName", "lastName", "email"])
        .match_on(["email"])
        .module("crossbeam", crossbeam)
        .module("monday", monday)
        .build()
        .unwrap()
}

/// Scripted module: serves a fixed record set and logs every batch call.
struct RecordingModule {
    name: String,
    entity: String,
    records: Vec<(String, Value)>,
    create_calls: Arc<Mutex<Vec<Value>>>,
    update_calls: Arc<Mutex<Vec<(Value, Value)>>>,
    fail_domains: Arc<Mutex<HashSet<String>>>,
    counter: AtomicU64,
}

impl RecordingModule {
    fn new(name: &str, entity: &str, records: Vec<(String, Value)>) -> Self {
        Self {
            name: name.to_string(),
            entity: entity.to_string(),
            records,
            create_calls: Arc::default(),
            update_calls: Arc::default(),
            fail_domains: Arc::default(),
            counter: AtomicU64::new(0),
        }
    }

    async fn fail_domain(&self, domain: &str) {
        self.fail_domains.lock().await.insert(domain.to_string());
    }

    async fn clear_failures(&self) {
        self.fail_domains.lock().await.clear();
    }

    async fn create_calls(&self) -> Vec<Value> {
        self.create_calls.lock().await.clone()
    }

    async fn update_calls(&self) -> Vec<(Value, Value)> {
        self.update_calls.lock().await.clone()
    }
}

#[async_trait]
impl SyncModule for RecordingModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entity_id(&self) -> &str {
        &self.entity
    }

    async fn all_sync_records(&self, config: &Arc<SyncTypeConfig>) -> frigg_sync::Result<Vec<SyncRecord>> {
        let mut out = Vec::new();
        for (id, native) in &self.records {
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
    ) -> frigg_sync::Result<Vec<RecordOutcome>> {
        let mut results = Vec::new();
        for record in records {
            let domain = record
                .data()
                .get("domain")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if self.fail_domains.lock().await.contains(&domain) {
                results.push(RecordOutcome::failed(&record, "scripted failure"));
                continue;
            }
            let payload = record.reverse_module_map(&self.name)?;
            self.create_calls.lock().await.push(payload);
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let created_id = format!("{}-new-{}", self.name, n);
            let row = ctx
                .confirm_create(&record, Value::String(created_id), &self.entity)
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
    ) -> frigg_sync::Result<Vec<RecordOutcome>> {
        let mut results = Vec::new();
        for record in records {
            let payload = record.reverse_module_map(&self.name)?;
            self.update_calls
                .lock()
                .await
                .push((record.data_identifier().clone(), payload));
            ctx.confirm_update(&record).await?;
            results.push(RecordOutcome::updated(&record));
        }
        Ok(results)
    }
}

fn acme_native() -> Value {
    json!({
        "accountName": "Acme",
        "domain": "acme.com",
        "partner": "P1",
    })
}

fn acme_monday_native() -> Value {
    json!({
        "Account Name": "Acme",
        "Domain": "acme.com",
        "Partner": "P1",
    })
}

async fn sync_row_count(pool: &store::Pool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM syncs")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn unmatched_record_creates_on_secondary() {
    let pool = setup_pool().await;
    let config = account_config();
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    let secondary = Arc::new(RecordingModule::new("monday", "monday-e", vec![]));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config.clone(),
        SyncSettings::default(),
        pool.clone(),
    );

    let report = manager.initial_sync().await.unwrap();
    assert_eq!(report.matched, 0);
    assert_eq!(report.secondary_created.len(), 1);
    assert_eq!(report.secondary_created[0].kind, OutcomeKind::Created);

    // The projected payload is monday-shaped and carries the match field.
    let creates = secondary.create_calls().await;
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0]["Domain"], json!("acme.com"));
    assert_eq!(creates[0]["Account Name"], json!("Acme"));

    // One row, both sides recorded after the create confirmation.
    let row = store::get_sync_row(&pool, "AccountSync", &json!("cb-1"), "crossbeam-e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.data_identifiers.len(), 2);
    assert_eq!(
        row.entity_native_id("monday-e").unwrap(),
        &json!("monday-new-1")
    );
    assert_eq!(sync_row_count(&pool).await, 1);
}

#[tokio::test]
async fn matched_pair_creates_row_without_calls() {
    let pool = setup_pool().await;
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    let secondary = Arc::new(RecordingModule::new(
        "monday",
        "monday-e",
        vec![("item-1".to_string(), acme_monday_native())],
    ));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        account_config(),
        SyncSettings::default(),
        pool.clone(),
    );

    let report = manager.initial_sync().await.unwrap();
    assert_eq!(report.matched, 1);
    assert!(primary.create_calls().await.is_empty());
    assert!(primary.update_calls().await.is_empty());
    assert!(secondary.create_calls().await.is_empty());
    assert!(secondary.update_calls().await.is_empty());

    let row = store::get_sync_row(&pool, "AccountSync", &json!("item-1"), "monday-e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.data_identifiers.len(), 2);
    assert_eq!(sync_row_count(&pool).await, 1);
}

#[tokio::test]
async fn changed_field_updates_other_side() {
    let pool = setup_pool().await;
    let config = account_config();
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    let secondary = Arc::new(RecordingModule::new(
        "monday",
        "monday-e",
        vec![("item-1".to_string(), acme_monday_native())],
    ));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config.clone(),
        SyncSettings::default(),
        pool.clone(),
    );
    manager.initial_sync().await.unwrap();

    // The account is renamed on the primary side; the match field is not.
    let delta = SyncRecord::from_native(
        &config,
        "crossbeam",
        json!("cb-1"),
        &json!({"accountName": "Acme Corp", "domain": "acme.com", "partner": "P1"}),
    )
    .unwrap();
    let expected_hash = delta.hash_data(true);

    let outcomes = manager.sync(vec![delta]).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].kind, OutcomeKind::Updated);

    let updates = secondary.update_calls().await;
    assert_eq!(updates.len(), 1);
    // The update targets monday's native id with a monday-shaped payload.
    assert_eq!(updates[0].0, json!("item-1"));
    assert_eq!(updates[0].1["Account Name"], json!("Acme Corp"));

    let row = store::get_sync_row(&pool, "AccountSync", &json!("cb-1"), "crossbeam-e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.hash, expected_hash);
}

#[tokio::test]
async fn unchanged_delta_is_noop() {
    let pool = setup_pool().await;
    let config = account_config();
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    let secondary = Arc::new(RecordingModule::new(
        "monday",
        "monday-e",
        vec![("item-1".to_string(), acme_monday_native())],
    ));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config.clone(),
        SyncSettings::default(),
        pool.clone(),
    );
    manager.initial_sync().await.unwrap();

    let delta = || {
        SyncRecord::from_native(&config, "crossbeam", json!("cb-1"), &acme_native()).unwrap()
    };

    let first = manager.sync(vec![delta()]).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].kind, OutcomeKind::Unchanged);

    // Re-running with the same unchanged delta issues no update and creates
    // no second row.
    let second = manager.sync(vec![delta()]).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].kind, OutcomeKind::Unchanged);
    assert!(secondary.update_calls().await.is_empty());
    assert!(secondary.create_calls().await.is_empty());
    assert_eq!(sync_row_count(&pool).await, 1);
}

#[tokio::test]
async fn missing_match_data_routes_to_create() {
    let pool = setup_pool().await;
    let config = lead_config();
    // Neither lead has an email: their match hashes are degenerate-equal,
    // but they must never be treated as a matched pair.
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![(
            "cb-lead-1".to_string(),
            json!({"firstName": "Ada", "lastName": "Lovelace"}),
        )],
    ));
    let secondary = Arc::new(RecordingModule::new(
        "monday",
        "monday-e",
        vec![(
            "item-lead-1".to_string(),
            json!({"First Name": "Grace", "Last Name": "Hopper"}),
        )],
    ));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config,
        SyncSettings::default(),
        pool.clone(),
    );

    let report = manager.initial_sync().await.unwrap();
    assert_eq!(report.matched, 0);
    assert_eq!(report.primary_created.len(), 1);
    assert_eq!(report.secondary_created.len(), 1);
    assert_eq!(primary.create_calls().await.len(), 1);
    assert_eq!(secondary.create_calls().await.len(), 1);
    assert_eq!(sync_row_count(&pool).await, 2);
}

#[tokio::test]
async fn unidirectional_suppresses_primary_direction() {
    let pool = setup_pool().await;
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    // The secondary holds a record the primary does not.
    let secondary = Arc::new(RecordingModule::new(
        "monday",
        "monday-e",
        vec![(
            "item-2".to_string(),
            json!({"Account Name": "Initech", "Domain": "initech.com", "Partner": "P2"}),
        )],
    ));
    let settings = SyncSettings {
        is_unidirectional: true,
        ..SyncSettings::default()
    };
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        account_config(),
        settings,
        pool.clone(),
    );

    let report = manager.initial_sync().await.unwrap();
    // Primary -> secondary still flows; the reverse direction is suppressed
    // entirely, including row creation.
    assert_eq!(report.secondary_created.len(), 1);
    assert!(report.primary_created.is_empty());
    assert!(primary.create_calls().await.is_empty());
    assert_eq!(secondary.create_calls().await.len(), 1);
    assert_eq!(sync_row_count(&pool).await, 1);
}

#[tokio::test]
async fn batch_failure_is_isolated_and_recoverable() {
    let pool = setup_pool().await;
    let config = account_config();
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![
            ("cb-1".to_string(), acme_native()),
            (
                "cb-2".to_string(),
                json!({"accountName": "Initech", "domain": "initech.com", "partner": "P2"}),
            ),
        ],
    ));
    let secondary = Arc::new(RecordingModule::new("monday", "monday-e", vec![]));
    secondary.fail_domain("acme.com").await;

    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config.clone(),
        SyncSettings::default(),
        pool.clone(),
    );
    let report = manager.initial_sync().await.unwrap();

    // One record failed, the other still went through.
    assert_eq!(report.secondary_created.len(), 2);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.created_count(), 1);

    // The failed record's row is left single-sided.
    let failed_row = store::get_sync_row(&pool, "AccountSync", &json!("cb-1"), "crossbeam-e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed_row.data_identifiers.len(), 1);

    // Once the downstream recovers, an incremental pass finds the
    // single-sided row and routes the record back through the create path.
    secondary.clear_failures().await;
    let delta =
        SyncRecord::from_native(&config, "crossbeam", json!("cb-1"), &acme_native()).unwrap();
    let outcomes = manager.sync(vec![delta]).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].kind, OutcomeKind::Created);

    let recovered = store::get_sync_row(&pool, "AccountSync", &json!("cb-1"), "crossbeam-e")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovered.data_identifiers.len(), 2);
    assert_eq!(sync_row_count(&pool).await, 2);
}

#[tokio::test]
async fn initial_resync_creates_nothing_new() {
    let pool = setup_pool().await;
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![("cb-1".to_string(), acme_native())],
    ));
    let secondary = Arc::new(RecordingModule::new("monday", "monday-e", vec![]));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        account_config(),
        SyncSettings::default(),
        pool.clone(),
    );

    let first = manager.initial_sync().await.unwrap();
    assert_eq!(first.created_count(), 1);

    // The second pass sees the same unmatched record, finds the fully
    // reconciled row, and issues no second create.
    let second = manager.initial_sync().await.unwrap();
    assert_eq!(second.created_count(), 0);
    assert_eq!(second.unchanged, 1);
    assert_eq!(secondary.create_calls().await.len(), 1);
    assert_eq!(sync_row_count(&pool).await, 1);
}

#[tokio::test]
async fn duplicate_match_hashes_fail_when_dedup_disabled() {
    let pool = setup_pool().await;
    // Two primary records claim the same domain.
    let primary = Arc::new(RecordingModule::new(
        "crossbeam",
        "crossbeam-e",
        vec![
            ("cb-1".to_string(), acme_native()),
            (
                "cb-2".to_string(),
                json!({"accountName": "Acme GmbH", "domain": "acme.com", "partner": "P3"}),
            ),
        ],
    ));
    let secondary = Arc::new(RecordingModule::new("monday", "monday-e", vec![]));
    let settings = SyncSettings {
        use_first_matching_duplicate: false,
        ..SyncSettings::default()
    };
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        account_config(),
        settings,
        pool.clone(),
    );

    let err = manager.initial_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::MultipleMatches { .. }));
    assert!(secondary.create_calls().await.is_empty());
}

#[tokio::test]
async fn memory_modules_end_to_end() {
    let pool = setup_pool().await;
    let config = account_config();
    let primary = Arc::new(MemoryModule::with_records(
        "crossbeam",
        "crossbeam-e",
        vec![
            ("cb-1".to_string(), acme_native()),
            (
                "cb-2".to_string(),
                json!({"accountName": "Initech", "domain": "initech.com", "partner": "P2"}),
            ),
        ],
    ));
    let secondary = Arc::new(MemoryModule::with_records(
        "monday",
        "monday-e",
        vec![("item-1".to_string(), acme_monday_native())],
    ));
    let manager = SyncManager::new(
        primary.clone(),
        secondary.clone(),
        config,
        SyncSettings::default(),
        pool.clone(),
    );

    let report = manager.initial_sync().await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.created_count(), 1);

    // The missing record landed in the secondary store, monday-shaped.
    let records = secondary.records().await;
    assert_eq!(records.len(), 2);
    let created = records
        .values()
        .find(|r| r["Domain"] == json!("initech.com"))
        .expect("created record present");
    assert_eq!(created["Account Name"], json!("Initech"));

    // A second full pass now matches both records and changes nothing.
    let again = manager.initial_sync().await.unwrap();
    assert_eq!(again.matched, 2);
    assert_eq!(again.created_count(), 0);
    assert_eq!(again.updated_count(), 0);
    assert_eq!(sync_row_count(&pool).await, 2);
}
