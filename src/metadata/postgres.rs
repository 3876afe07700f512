use super::{
    KnowledgeFile, MetadataError, MetadataStore, MetadataTransaction, check_requeue,
    check_transition,
};
use crate::knowledge::status::FileStatus;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

const COLUMNS: &str = "id, collection_id, owner_id, filename, file_ext, mime_type, size_in_bytes, \
     content_hash, object_path, upload_id, part_count, status, failure_reason, created_at, updated_at";

/// PostgreSQL-backed metadata store (`knowledge_file` table).
#[derive(Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Open a connection pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, MetadataError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        tracing::info!(max_connections, "Connected to metadata database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<(), MetadataError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Metadata migrations applied");
        Ok(())
    }
}

fn parse_row(row: PgRow) -> Result<KnowledgeFile, MetadataError> {
    let status: String = row.try_get("status")?;
    Ok(KnowledgeFile {
        id: row.try_get("id")?,
        collection_id: row.try_get("collection_id")?,
        owner_id: row.try_get("owner_id")?,
        filename: row.try_get("filename")?,
        file_ext: row.try_get("file_ext")?,
        mime_type: row.try_get("mime_type")?,
        size_in_bytes: row.try_get("size_in_bytes")?,
        content_hash: row.try_get("content_hash")?,
        object_path: row.try_get("object_path")?,
        upload_id: row.try_get("upload_id")?,
        part_count: row.try_get("part_count")?,
        status: status.parse::<FileStatus>()?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, MetadataError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeFile>, MetadataError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM knowledge_file WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(parse_row).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        from: FileStatus,
        to: FileStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<KnowledgeFile>, MetadataError> {
        check_transition(from, to)?;
        let row = sqlx::query(&format!(
            "UPDATE knowledge_file
             SET status = $3,
                 failure_reason = COALESCE($4, failure_reason),
                 updated_at = now()
             WHERE id = $1 AND status = $2
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            tracing::debug!(file_id = %id, %from, %to, "Status compare-and-set lost");
        }
        row.map(parse_row).transpose()
    }

    async fn requeue(
        &self,
        id: Uuid,
        from: FileStatus,
    ) -> Result<Option<KnowledgeFile>, MetadataError> {
        check_requeue(from)?;
        let row = sqlx::query(&format!(
            "UPDATE knowledge_file
             SET status = $3, failure_reason = NULL, updated_at = now()
             WHERE id = $1 AND status = $2
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(FileStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            tracing::debug!(file_id = %id, %from, "Requeue compare-and-set lost");
        }
        row.map(parse_row).transpose()
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MetadataTransaction for PostgresTransaction {
    async fn insert(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError> {
        let result = sqlx::query(
            "INSERT INTO knowledge_file (id, collection_id, owner_id, filename, file_ext, mime_type,
                 size_in_bytes, content_hash, object_path, upload_id, part_count, status,
                 failure_reason, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(file.id)
        .bind(file.collection_id)
        .bind(file.owner_id)
        .bind(&file.filename)
        .bind(&file.file_ext)
        .bind(&file.mime_type)
        .bind(file.size_in_bytes)
        .bind(&file.content_hash)
        .bind(&file.object_path)
        .bind(&file.upload_id)
        .bind(file.part_count)
        .bind(file.status.as_str())
        .bind(&file.failure_reason)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(MetadataError::Duplicate(file.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError> {
        let result = sqlx::query(
            "UPDATE knowledge_file
             SET upload_id = $2, part_count = $3, status = $4, failure_reason = $5, updated_at = $6
             WHERE id = $1",
        )
        .bind(file.id)
        .bind(&file.upload_id)
        .bind(file.part_count)
        .bind(file.status.as_str())
        .bind(&file.failure_reason)
        .bind(file.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::Missing(file.id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), MetadataError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MetadataError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
