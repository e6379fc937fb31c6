use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "active" => Ok(ApiKeyStatus::Active),
            "revoked" => Ok(ApiKeyStatus::Revoked),
            other => Err(StoreError::Database(format!(
                "unknown api key status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub api_key: String,
    pub description: String,
    pub status: ApiKeyStatus,
    pub pricing_plan_id: Option<i64>,
    pub active_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingPlan {
    pub id: i64,
    pub name: String,
    pub requests_per_second: i32,
    pub requests_per_day: i32,
    pub price: BigUint,
}

/// Projection the cache holds for usable keys (status active, plan set).
/// Field-for-field equality decides whether the rate limiter keeps or
/// rebuilds a key's buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKeyInfo {
    pub api_key: String,
    pub requests_per_second: i32,
    pub requests_per_day: i32,
    pub pricing_plan_id: i64,
    pub active_until: Option<DateTime<Utc>>,
}

/// API-key and pricing-plan persistence.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn find_key(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Usable-key projection joined with its plan limits. Returns `None` for
    /// unknown, revoked, or planless keys.
    async fn key_info(&self, api_key: &str) -> Result<Option<CachedKeyInfo>, StoreError>;

    async fn create_key(&self, api_key: &str, description: &str)
        -> Result<ApiKeyRecord, StoreError>;

    /// Returns whether a row was actually revoked.
    async fn revoke_key(&self, api_key: &str) -> Result<bool, StoreError>;

    async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError>;

    async fn plan(&self, id: i64) -> Result<Option<PricingPlan>, StoreError>;

    async fn plans(&self) -> Result<Vec<PricingPlan>, StoreError>;

    async fn create_plan(
        &self,
        name: &str,
        requests_per_second: i32,
        requests_per_day: i32,
        price: &BigUint,
    ) -> Result<PricingPlan, StoreError>;
}

/// Postgres-backed key store.
#[derive(Clone)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const KEY_COLUMNS: &str =
    "id, api_key, description, status::TEXT AS status, pricing_plan_id, active_until, created_at";

fn key_from_row(row: &sqlx::postgres::PgRow) -> Result<ApiKeyRecord, StoreError> {
    Ok(ApiKeyRecord {
        id: row.try_get("id").map_err(StoreError::from)?,
        api_key: row.try_get("api_key").map_err(StoreError::from)?,
        description: row.try_get("description").map_err(StoreError::from)?,
        status: ApiKeyStatus::parse(row.try_get::<String, _>("status").map_err(StoreError::from)?.as_str())?,
        pricing_plan_id: row.try_get("pricing_plan_id").map_err(StoreError::from)?,
        active_until: row.try_get("active_until").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
    })
}

pub(crate) fn parse_numeric(text: &str) -> Result<BigUint, StoreError> {
    BigUint::parse_bytes(text.as_bytes(), 10)
        .ok_or_else(|| StoreError::Numeric(text.to_string()))
}

fn plan_from_row(row: &sqlx::postgres::PgRow) -> Result<PricingPlan, StoreError> {
    let price_text: String = row.try_get("price").map_err(StoreError::from)?;
    Ok(PricingPlan {
        id: row.try_get("id").map_err(StoreError::from)?,
        name: row.try_get("name").map_err(StoreError::from)?,
        requests_per_second: row.try_get("requests_per_second").map_err(StoreError::from)?,
        requests_per_day: row.try_get("requests_per_day").map_err(StoreError::from)?,
        price: parse_numeric(&price_text)?,
    })
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn find_key(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(key_from_row).transpose()
    }

    async fn key_info(&self, api_key: &str) -> Result<Option<CachedKeyInfo>, StoreError> {
        let row = sqlx::query(
            "SELECT k.api_key, p.requests_per_second, p.requests_per_day, \
                    k.pricing_plan_id, k.active_until \
             FROM api_keys k \
             JOIN pricing_plans p ON p.id = k.pricing_plan_id \
             WHERE k.api_key = $1 AND k.status = 'active'",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(CachedKeyInfo {
                api_key: row.try_get("api_key").map_err(StoreError::from)?,
                requests_per_second: row.try_get("requests_per_second").map_err(StoreError::from)?,
                requests_per_day: row.try_get("requests_per_day").map_err(StoreError::from)?,
                pricing_plan_id: row
                    .try_get::<Option<i64>, _>("pricing_plan_id")
                    .map_err(StoreError::from)?
                    .ok_or_else(|| StoreError::Database("joined plan id was null".into()))?,
                active_until: row.try_get("active_until").map_err(StoreError::from)?,
            })),
        }
    }

    async fn create_key(
        &self,
        api_key: &str,
        description: &str,
    ) -> Result<ApiKeyRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO api_keys (api_key, description) VALUES ($1, $2) RETURNING {KEY_COLUMNS}"
        ))
        .bind(api_key)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        key_from_row(&row)
    }

    async fn revoke_key(&self, api_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE api_keys SET status = 'revoked' WHERE api_key = $1 AND status = 'active'",
        )
        .bind(api_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(key_from_row).collect()
    }

    async fn plan(&self, id: i64) -> Result<Option<PricingPlan>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, requests_per_second, requests_per_day, price::TEXT AS price \
             FROM pricing_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn plans(&self) -> Result<Vec<PricingPlan>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, requests_per_second, requests_per_day, price::TEXT AS price \
             FROM pricing_plans ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(plan_from_row).collect()
    }

    async fn create_plan(
        &self,
        name: &str,
        requests_per_second: i32,
        requests_per_day: i32,
        price: &BigUint,
    ) -> Result<PricingPlan, StoreError> {
        let row = sqlx::query(
            "INSERT INTO pricing_plans (name, requests_per_second, requests_per_day, price) \
             VALUES ($1, $2, $3, CAST($4 AS NUMERIC)) \
             RETURNING id, name, requests_per_second, requests_per_day, price::TEXT AS price",
        )
        .bind(name)
        .bind(requests_per_second)
        .bind(requests_per_day)
        .bind(price.to_string())
        .fetch_one(&self.pool)
        .await?;
        plan_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        assert_eq!(ApiKeyStatus::parse("active").unwrap(), ApiKeyStatus::Active);
        assert_eq!(ApiKeyStatus::parse("revoked").unwrap(), ApiKeyStatus::Revoked);
        assert!(ApiKeyStatus::parse("banana").is_err());
        assert_eq!(ApiKeyStatus::Active.as_str(), "active");
    }

    #[test]
    fn numeric_parsing_handles_78_digits() {
        let seventy_eight_nines = "9".repeat(78);
        let parsed = parse_numeric(&seventy_eight_nines).unwrap();
        assert_eq!(parsed.to_string(), seventy_eight_nines);

        assert!(parse_numeric("12.5").is_err());
        assert!(parse_numeric("-3").is_err());
        assert!(parse_numeric("").is_err());
    }

    #[test]
    fn cached_info_equality_is_field_for_field() {
        let a = CachedKeyInfo {
            api_key: "sk_x".into(),
            requests_per_second: 5,
            requests_per_day: 10_000,
            pricing_plan_id: 1,
            active_until: None,
        };
        let mut b = a.clone();
        assert_eq!(a, b);

        b.requests_per_second = 20;
        assert_ne!(a, b);
    }
}
