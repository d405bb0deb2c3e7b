use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::model::{DataIdentifier, SyncRow};
use crate::error::{Result, SyncError};
use crate::hash::canonical_string;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, ensure the parent directory exists. Leaves
/// in-memory URLs and non-sqlite schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let path_part = rest.split('?').next().unwrap_or(rest);
    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    url.to_string()
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Look up the sync row holding `(entity, data_identifier)` for a sync type.
/// Exactly one row or none; more than one is a data-integrity violation and
/// fails loudly.
#[instrument(skip_all)]
pub async fn get_sync_row(
    pool: &Pool,
    name: &str,
    data_identifier: &serde_json::Value,
    entity: &str,
) -> Result<Option<SyncRow>> {
    let encoded = canonical_string(data_identifier);
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT d.sync_id FROM data_identifiers d \
         JOIN syncs s ON s.id = d.sync_id \
         WHERE s.name = ? AND d.entity_id = ? AND d.native_id = ?",
    )
    .bind(name)
    .bind(entity)
    .bind(&encoded)
    .fetch_all(pool)
    .await?;

    if ids.len() > 1 {
        return Err(SyncError::MultipleMatches {
            name: name.to_string(),
            identifier: encoded,
        });
    }
    match ids.first() {
        Some(id) => load_sync_row(pool, id).await,
        None => Ok(None),
    }
}

/// Load a full sync row by id.
pub async fn load_sync_row(pool: &Pool, id: &str) -> Result<Option<SyncRow>> {
    let row = sqlx::query("SELECT id, name, hash, created_at, updated_at FROM syncs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let entities: Vec<String> =
        sqlx::query_scalar("SELECT entity_id FROM sync_entities WHERE sync_id = ? ORDER BY rowid")
            .bind(id)
            .fetch_all(pool)
            .await?;

    let ident_rows = sqlx::query(
        "SELECT entity_id, native_id, hash FROM data_identifiers WHERE sync_id = ? ORDER BY rowid",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    let mut data_identifiers = Vec::with_capacity(ident_rows.len());
    for ident in ident_rows {
        let native: String = ident.get("native_id");
        data_identifiers.push(DataIdentifier {
            entity: ident.get("entity_id"),
            id: serde_json::from_str(&native)?,
            hash: ident.get("hash"),
        });
    }

    Ok(Some(SyncRow {
        id: row.get("id"),
        name: row.get("name"),
        hash: row.get("hash"),
        entities,
        data_identifiers,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

/// Create or refresh the sync row identified by `(name, first identifier,
/// entity set)`. On match the stored hash is replaced and the given
/// identifiers are written; otherwise a new row is inserted.
#[instrument(skip_all)]
pub async fn upsert_sync_row(
    pool: &Pool,
    name: &str,
    hash: &str,
    entities: &[String],
    identifiers: &[DataIdentifier],
) -> Result<SyncRow> {
    let primary = identifiers
        .first()
        .ok_or_else(|| SyncError::Internal("upsert requires at least one identifier".into()))?;
    let encoded = canonical_string(&primary.id);

    let mut tx = pool.begin().await?;
    let candidates: Vec<String> = sqlx::query_scalar(
        "SELECT d.sync_id FROM data_identifiers d \
         JOIN syncs s ON s.id = d.sync_id \
         WHERE s.name = ? AND d.entity_id = ? AND d.native_id = ?",
    )
    .bind(name)
    .bind(&primary.entity)
    .bind(&encoded)
    .fetch_all(&mut *tx)
    .await?;

    // A candidate only counts when it spans the same entity set.
    let mut existing: Option<String> = None;
    for candidate in candidates {
        let row_entities: Vec<String> =
            sqlx::query_scalar("SELECT entity_id FROM sync_entities WHERE sync_id = ?")
                .bind(&candidate)
                .fetch_all(&mut *tx)
                .await?;
        if entities.iter().all(|e| row_entities.contains(e)) {
            if existing.is_some() {
                return Err(SyncError::MultipleMatches {
                    name: name.to_string(),
                    identifier: encoded,
                });
            }
            existing = Some(candidate);
        }
    }

    let id = match existing {
        Some(id) => {
            sqlx::query("UPDATE syncs SET hash = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
                .bind(hash)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            for ident in identifiers {
                insert_identifier_tx(&mut tx, &id, ident).await?;
            }
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query("INSERT INTO syncs (id, name, hash) VALUES (?, ?, ?)")
                .bind(&id)
                .bind(name)
                .bind(hash)
                .execute(&mut *tx)
                .await?;
            for entity in entities {
                sqlx::query(
                    "INSERT OR IGNORE INTO sync_entities (sync_id, entity_id) VALUES (?, ?)",
                )
                .bind(&id)
                .bind(entity)
                .execute(&mut *tx)
                .await?;
            }
            for ident in identifiers {
                insert_identifier_tx(&mut tx, &id, ident).await?;
            }
            id
        }
    };
    tx.commit().await?;

    load_sync_row(pool, &id)
        .await?
        .ok_or_else(|| SyncError::Store(sqlx::Error::RowNotFound))
}

async fn insert_identifier_tx(
    tx: &mut Transaction<'_, Sqlite>,
    sync_id: &str,
    ident: &DataIdentifier,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO data_identifiers (sync_id, entity_id, native_id, hash) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(sync_id)
    .bind(&ident.entity)
    .bind(canonical_string(&ident.id))
    .bind(&ident.hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record the native identifier a module side reconciled into, replacing any
/// previous identifier for that entity.
#[instrument(skip_all)]
pub async fn add_data_identifier(
    pool: &Pool,
    sync_id: &str,
    ident: &DataIdentifier,
) -> Result<SyncRow> {
    let mut tx = pool.begin().await?;
    insert_identifier_tx(&mut tx, sync_id, ident).await?;
    sqlx::query("UPDATE syncs SET updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(sync_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    load_sync_row(pool, sync_id)
        .await?
        .ok_or_else(|| SyncError::Store(sqlx::Error::RowNotFound))
}

/// Replace the stored content hash after a confirmed downstream write.
#[instrument(skip_all)]
pub async fn update_hash(pool: &Pool, sync_id: &str, hash: &str) -> Result<()> {
    sqlx::query("UPDATE syncs SET hash = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(hash)
        .bind(sync_id)
        .execute(pool)
        .await?;
    Ok(())
}
