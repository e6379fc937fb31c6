use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use unigate_core::shard::ShardConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ShardConfigRecord {
    pub id: i32,
    pub config: ShardConfig,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Shard-configuration persistence. Record ids are monotonically increasing;
/// the live config is the one with the highest id.
#[async_trait]
pub trait ShardConfigStore: Send + Sync {
    async fn latest(&self) -> Result<Option<ShardConfigRecord>, StoreError>;

    /// Persist a new configuration, returning the inserted id.
    async fn save(&self, config: &ShardConfig, created_by: &str) -> Result<i32, StoreError>;
}

#[derive(Clone)]
pub struct PgShardConfigStore {
    pool: PgPool,
}

impl PgShardConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShardConfigStore for PgShardConfigStore {
    async fn latest(&self) -> Result<Option<ShardConfigRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, config_json::TEXT AS config_json, created_at, created_by \
             FROM shard_config ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get("config_json").map_err(StoreError::from)?;
                let config: ShardConfig = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Database(format!("bad shard config json: {e}")))?;
                Ok(Some(ShardConfigRecord {
                    id: row.try_get("id").map_err(StoreError::from)?,
                    config,
                    created_at: row.try_get("created_at").map_err(StoreError::from)?,
                    created_by: row.try_get("created_by").map_err(StoreError::from)?,
                }))
            }
        }
    }

    async fn save(&self, config: &ShardConfig, created_by: &str) -> Result<i32, StoreError> {
        let json = serde_json::to_string(config)
            .map_err(|e| StoreError::Database(format!("unserializable shard config: {e}")))?;
        let row = sqlx::query(
            "INSERT INTO shard_config (config_json, created_by) \
             VALUES (CAST($1 AS JSONB), $2) RETURNING id",
        )
        .bind(json)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("id").map_err(StoreError::from)
    }
}
