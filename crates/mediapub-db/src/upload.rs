//! Upload and Query records.

use async_trait::async_trait;
use mediapub_core::models::{Query, QueryStatus, RpcResponse, Upload, UploadStatus};
use mediapub_core::AppError;
use sqlx::{PgPool, Postgres};

/// Persistence for the two records kept per upload.
///
/// Transition methods return `false` when the record was missing or already
/// past the stage the transition applies to.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Insert a new upload. A redelivered `Created` hook for an existing ID
    /// leaves the stored record untouched and returns `false`.
    async fn create_upload(&self, upload: &Upload) -> Result<bool, AppError>;

    async fn get_upload(&self, id: &str) -> Result<Option<Upload>, AppError>;

    /// Record transferred bytes while the upload is `created` or `uploading`.
    async fn record_progress(&self, id: &str, received: i64) -> Result<bool, AppError>;

    /// The transport reached the declared size: `received = size`.
    async fn mark_transferred(&self, id: &str) -> Result<bool, AppError>;

    async fn mark_terminated(&self, id: &str) -> Result<bool, AppError>;

    /// Store the finalised locator, move the upload to `received` and create
    /// its Query record, atomically.
    async fn mark_received(&self, id: &str, path: &str, query: &Query) -> Result<(), AppError>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), AppError>;

    async fn get_query(&self, upload_id: &str) -> Result<Option<Query>, AppError>;

    /// Persist the outcome of a Query still in `received` and move its upload
    /// to `upload_status`, atomically. A `failed` upload also takes `error`.
    /// Returns `false`, changing nothing, when the Query is missing or
    /// already terminal.
    async fn complete_query(
        &self,
        upload_id: &str,
        status: QueryStatus,
        response: Option<&RpcResponse>,
        error: &str,
        upload_status: UploadStatus,
    ) -> Result<bool, AppError>;
}

const UPLOAD_COLUMNS: &str =
    "id, user_id, size, received, status, filename, path, error, created_at, updated_at";

const QUERY_COLUMNS: &str =
    "id, upload_id, status, request, response, error, created_at, updated_at";

#[derive(Clone)]
pub struct PgUploadRepository {
    pool: PgPool,
}

impl PgUploadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UploadStore for PgUploadRepository {
    #[tracing::instrument(skip(self, upload), fields(db.table = "uploads", upload_id = %upload.id))]
    async fn create_upload(&self, upload: &Upload) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO uploads (id, user_id, size, received, status, filename, path, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&upload.id)
        .bind(upload.user_id)
        .bind(upload.size)
        .bind(upload.received)
        .bind(upload.status.to_string())
        .bind(&upload.filename)
        .bind(&upload.path)
        .bind(&upload.error)
        .bind(upload.created_at)
        .bind(upload.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "uploads"))]
    async fn get_upload(&self, id: &str) -> Result<Option<Upload>, AppError> {
        let upload = sqlx::query_as::<Postgres, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(upload)
    }

    #[tracing::instrument(skip(self), fields(db.table = "uploads"))]
    async fn record_progress(&self, id: &str, received: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET received = $2, status = 'uploading', updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'uploading')
            "#,
        )
        .bind(id)
        .bind(received)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "uploads"))]
    async fn mark_transferred(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET received = size, updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'uploading')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), fields(db.table = "uploads"))]
    async fn mark_terminated(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'terminated', updated_at = NOW()
            WHERE id = $1 AND status IN ('created', 'uploading')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, query), fields(db.table = "uploads"))]
    async fn mark_received(&self, id: &str, path: &str, query: &Query) -> Result<(), AppError> {
        let request = serde_json::to_value(&query.request)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE uploads
            SET status = 'received', path = $2, received = size, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(path)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("upload {id}")));
        }

        sqlx::query(
            r#"
            INSERT INTO queries (id, upload_id, status, request, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, '', $5, $6)
            ON CONFLICT (upload_id) DO UPDATE
            SET status = EXCLUDED.status, request = EXCLUDED.request, response = NULL,
                error = '', updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(query.id)
        .bind(id)
        .bind(query.status.to_string())
        .bind(request)
        .bind(query.created_at)
        .bind(query.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, error), fields(db.table = "uploads"))]
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE uploads SET status = $2, error = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(UploadStatus::Failed.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "queries"))]
    async fn get_query(&self, upload_id: &str) -> Result<Option<Query>, AppError> {
        let query = sqlx::query_as::<Postgres, Query>(&format!(
            "SELECT {QUERY_COLUMNS} FROM queries WHERE upload_id = $1"
        ))
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(query)
    }

    #[tracing::instrument(
        skip(self, response, error),
        fields(db.table = "queries", status = %status, upload_status = %upload_status)
    )]
    async fn complete_query(
        &self,
        upload_id: &str,
        status: QueryStatus,
        response: Option<&RpcResponse>,
        error: &str,
        upload_status: UploadStatus,
    ) -> Result<bool, AppError> {
        let response = response.map(serde_json::to_value).transpose()?;
        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query(
            r#"
            UPDATE queries
            SET status = $2, response = $3, error = $4, updated_at = NOW()
            WHERE upload_id = $1 AND status = 'received'
            "#,
        )
        .bind(upload_id)
        .bind(status.to_string())
        .bind(response)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        if completed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE uploads
            SET status = $2,
                error = CASE WHEN $2 = 'failed' THEN $3 ELSE error END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .bind(upload_status.to_string())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
