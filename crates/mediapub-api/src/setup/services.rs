//! Production backends: Postgres, Redis, the configured upload storage and
//! blob destinations, and the downstream JSON-RPC service.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use mediapub_core::Config;
use mediapub_db::{PgBlobIndex, PgUploadRepository};
use mediapub_infra::RedisLock;
use mediapub_storage::{create_blob_stores, create_upload_storage};
use mediapub_worker::RedisBroker;

use super::Components;
use crate::auth::JwtUserResolver;
use crate::rpc::JsonRpcClient;

pub async fn create_components(config: &Config, pool: PgPool) -> Result<Components> {
    let upload_storage = create_upload_storage(config)
        .await
        .context("Failed to initialize upload storage")?;
    let blob_destinations = create_blob_stores(config)
        .await
        .context("Failed to initialize blob destinations")?;

    let broker = RedisBroker::new(&config.redis_url, config.task_bus_queue.clone())
        .await
        .context("Failed to connect task broker to Redis")?;
    let lock = RedisLock::new(&config.redis_url)
        .await
        .context("Failed to connect distributed lock to Redis")?;
    tracing::info!(queue = %config.task_bus_queue, "Redis broker and lock connected");

    let rpc = JsonRpcClient::new(
        config.rpc_url.clone(),
        Duration::from_secs(config.rpc_timeout_seconds),
    )
    .context("Failed to build RPC client")?;

    Ok(Components {
        store: Arc::new(PgUploadRepository::new(pool.clone())),
        upload_storage,
        lock: Arc::new(lock),
        broker: Arc::new(broker),
        blob_destinations,
        blob_index: Arc::new(PgBlobIndex::new(pool)),
        rpc: Arc::new(rpc),
        users: Arc::new(JwtUserResolver::new(&config.jwt_secret)),
        direct_results: false,
    })
}
