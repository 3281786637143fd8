use std::{
    collections::HashMap,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::RwLock;

use crate::{
    error::StoreError,
    models::{ParsedResult, ScanId, ScanRecord, ScanRequest, ScanStatus},
    profiles::ProfileKind,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = if url.contains(":memory:") || url.contains("mode=memory") {
        // every connection would open its own empty database
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new()
    };
    Ok(pool.connect_with(options).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Persistence for scan records. `commit` is a compare-and-set on the
/// status column, so concurrent writers cannot overwrite a terminal state.
#[async_trait::async_trait]
pub trait ScanStore: Send + Sync {
    async fn insert(
        &self,
        owner: &str,
        request: &ScanRequest,
        now: DateTime<Utc>,
    ) -> Result<ScanRecord, StoreError>;

    async fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, StoreError>;

    /// Returns `false` when the stored status is no longer `expected`.
    async fn commit(&self, record: &ScanRecord, expected: ScanStatus) -> Result<bool, StoreError>;

    /// Failed scans created at or after `since`, oldest first.
    async fn list_failed(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct ScanRow {
    id: i64,
    owner: String,
    job_handle: Option<String>,
    target: String,
    profile: String,
    custom_arguments: Option<String>,
    priority: i64,
    status: String,
    attempts: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    raw_output: Option<String>,
    parsed_result: Option<String>,
    error_message: Option<String>,
    hosts_up: i64,
    ports_found: i64,
    vulnerabilities_found: i64,
}

impl TryFrom<ScanRow> for ScanRecord {
    type Error = StoreError;

    fn try_from(row: ScanRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };
        let count = |value: i64, column: &str| {
            u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
        };

        let profile = ProfileKind::from_str(&row.profile).map_err(|e| corrupt(e.to_string()))?;
        let status = ScanStatus::from_str(&row.status).map_err(corrupt)?;
        let parsed_result = row
            .parsed_result
            .as_deref()
            .map(serde_json::from_str::<ParsedResult>)
            .transpose()
            .map_err(|e| corrupt(format!("parsed_result: {e}")))?;
        let priority =
            i32::try_from(row.priority).map_err(|_| corrupt(format!("priority out of range: {}", row.priority)))?;

        Ok(ScanRecord {
            id,
            owner: row.owner,
            job_handle: row.job_handle,
            request: ScanRequest {
                target: row.target,
                profile,
                custom_arguments: row.custom_arguments,
                priority,
            },
            status,
            attempts: count(row.attempts, "attempts")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
            raw_output: row.raw_output,
            parsed_result,
            error_message: row.error_message,
            hosts_up: count(row.hosts_up, "hosts_up")?,
            ports_found: count(row.ports_found, "ports_found")?,
            vulnerabilities_found: count(row.vulnerabilities_found, "vulnerabilities_found")?,
        })
    }
}

#[derive(Clone)]
pub struct SqliteScanStore {
    pool: SqlitePool,
}

impl SqliteScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens `url`, creating the database if needed, and applies migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = create_pool(url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl ScanStore for SqliteScanStore {
    async fn insert(
        &self,
        owner: &str,
        request: &ScanRequest,
        now: DateTime<Utc>,
    ) -> Result<ScanRecord, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO scans(owner, target, profile, custom_arguments, priority, status, attempts, created_at, updated_at) VALUES(?, ?, ?, ?, ?, 'queued', 1, ?, ?)",
        )
        .bind(owner)
        .bind(&request.target)
        .bind(request.profile.as_str())
        .bind(&request.custom_arguments)
        .bind(request.priority)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ScanRecord::new(
            inserted.last_insert_rowid(),
            owner,
            request.clone(),
            now,
        ))
    }

    async fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, StoreError> {
        sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScanRecord::try_from)
            .transpose()
    }

    async fn commit(&self, record: &ScanRecord, expected: ScanStatus) -> Result<bool, StoreError> {
        let parsed = record
            .parsed_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated = sqlx::query(
            "UPDATE scans SET job_handle=?, status=?, attempts=?, updated_at=?, started_at=?, completed_at=?, duration_seconds=?, raw_output=?, parsed_result=?, error_message=?, hosts_up=?, ports_found=?, vulnerabilities_found=? WHERE id=? AND status=?",
        )
        .bind(&record.job_handle)
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_seconds)
        .bind(&record.raw_output)
        .bind(parsed)
        .bind(&record.error_message)
        .bind(i64::from(record.hosts_up))
        .bind(i64::from(record.ports_found))
        .bind(i64::from(record.vulnerabilities_found))
        .bind(record.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_failed(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE status = 'failed' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = ScanRecord::try_from(row)?;
            if record.created_at >= since {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Process-local store for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryScanStore {
    records: RwLock<HashMap<ScanId, ScanRecord>>,
    next_id: AtomicI64,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ScanStore for MemoryScanStore {
    async fn insert(
        &self,
        owner: &str,
        request: &ScanRequest,
        now: DateTime<Utc>,
    ) -> Result<ScanRecord, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ScanRecord::new(id, owner, request.clone(), now);
        self.records.write().await.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: ScanId) -> Result<Option<ScanRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn commit(&self, record: &ScanRecord, expected: ScanStatus) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(stored) if stored.status == expected => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_failed(&self, since: DateTime<Utc>) -> Result<Vec<ScanRecord>, StoreError> {
        let mut failed: Vec<ScanRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == ScanStatus::Failed && r.created_at >= since)
            .cloned()
            .collect();
        failed.sort_by_key(|r| r.id);
        Ok(failed)
    }
}
