use std::collections::BTreeMap;

use async_trait::async_trait;
use calpull_core::{meta, LocalEventRecord, RecordFields, RecordStatus};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::store::{validate_fields, RecordStore, RunLease, StoreError};

/// `pg_advisory_xact_lock` key shared by every calpull process on the database.
const RUN_LOCK_KEY: i64 = 0x6361_6c70_756c_6c;

/// Record store backed by the `records` / `record_meta` tables.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_metadata(&self, id: i64) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT meta_key, meta_value
              FROM record_meta
             WHERE record_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.try_get("meta_key")?, row.try_get("meta_value")?);
        }
        Ok(out)
    }

    async fn ensure_exists(&self, id: i64) -> Result<(), StoreError> {
        let found = sqlx::query("SELECT 1 FROM records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

fn record_from_row(row: &PgRow) -> Result<LocalEventRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let modified_at: DateTime<Utc> = row.try_get("modified_at")?;
    Ok(LocalEventRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        slug: row.try_get("slug")?,
        category: row.try_get("category")?,
        status: RecordStatus::parse(&status),
        comments_open: row.try_get("comments_open")?,
        pings_open: row.try_get("pings_open")?,
        modified_at,
        metadata: BTreeMap::new(),
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_record(&self, fields: &RecordFields, external_id: &str) -> Result<i64, StoreError> {
        validate_fields(fields)?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO records (title, description, slug, category, status, comments_open, pings_open, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id
            "#,
        )
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.slug.as_deref().unwrap_or_default())
        .bind(fields.category.unwrap_or(calpull_core::DEFAULT_CATEGORY))
        .bind(fields.status.as_str())
        .bind(fields.comments_open)
        .bind(fields.pings_open)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get("id")?;

        sqlx::query("INSERT INTO record_meta (record_id, meta_key, meta_value) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(meta::CALENDAR_ID)
            .bind(external_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update_record(&self, id: i64, fields: &RecordFields) -> Result<i64, StoreError> {
        validate_fields(fields)?;
        let result = sqlx::query(
            r#"
            UPDATE records
               SET title = $2,
                   description = $3,
                   slug = COALESCE($4, slug),
                   category = COALESCE($5, category),
                   status = $6,
                   comments_open = $7,
                   pings_open = $8,
                   modified_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.slug.as_deref())
        .bind(fields.category)
        .bind(fields.status.as_str())
        .bind(fields.comments_open)
        .bind(fields.pings_open)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(id)
    }

    async fn query_by_metadata(&self, key: &str, value: &str) -> Result<Vec<LocalEventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.title, r.description, r.slug, r.category, r.status,
                   r.comments_open, r.pings_open, r.modified_at
              FROM records r
              JOIN record_meta m ON m.record_id = r.id
             WHERE m.meta_key = $1
               AND m.meta_value = $2
               AND r.status = 'publish'
             ORDER BY r.modified_at DESC, r.id DESC
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            record.metadata = self.load_metadata(record.id).await?;
            out.push(record);
        }
        Ok(out)
    }

    async fn get_record(&self, id: i64) -> Result<Option<LocalEventRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, description, slug, category, status,
                   comments_open, pings_open, modified_at
              FROM records
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let mut record = record_from_row(&row)?;
        record.metadata = self.load_metadata(id).await?;
        Ok(Some(record))
    }

    async fn get_metadata(&self, id: i64, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT meta_value FROM record_meta WHERE record_id = $1 AND meta_key = $2")
            .bind(id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("meta_value")?)),
            None => Ok(None),
        }
    }

    async fn add_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_exists(id).await?;
        sqlx::query("INSERT INTO record_meta (record_id, meta_key, meta_value) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_metadata(&self, id: i64, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_exists(id).await?;
        sqlx::query(
            r#"
            INSERT INTO record_meta (record_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (record_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            "#,
        )
        .bind(id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_metadata(&self, id: i64, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM record_meta WHERE record_id = $1 AND meta_key = $2")
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire_run_lease(&self) -> Result<RunLease, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RUN_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(RunLease::held(tx))
    }
}
