use async_trait::async_trait;
use mediapub_storage::{BlobIndex, StorageError, StorageResult};
use sqlx::PgPool;

/// Blob index stored in the `blobs` table, keyed by `(destination, hash)`.
#[derive(Clone)]
pub struct PgBlobIndex {
    pool: PgPool,
}

impl PgBlobIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend_error(e: sqlx::Error) -> StorageError {
    StorageError::BackendError(format!("blob index: {e}"))
}

#[async_trait]
impl BlobIndex for PgBlobIndex {
    async fn contains(&self, destination: &str, hash: &str) -> StorageResult<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM blobs WHERE destination = $1 AND hash = $2")
                .bind(destination)
                .bind(hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend_error)?;
        Ok(found.is_some())
    }

    #[tracing::instrument(skip(self), fields(db.table = "blobs"))]
    async fn record(&self, destination: &str, hash: &str, size: u64) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO blobs (destination, hash, size)
            VALUES ($1, $2, $3)
            ON CONFLICT (destination, hash) DO NOTHING
            "#,
        )
        .bind(destination)
        .bind(hash)
        .bind(size as i64)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }
}
