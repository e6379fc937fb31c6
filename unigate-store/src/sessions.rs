use crate::error::StoreError;
use crate::keys::parse_numeric;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(StoreError::Database(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSession {
    pub id: Uuid,
    pub api_key: String,
    pub payment_address: String,
    pub receiver_nonce: Vec<u8>,
    pub status: SessionStatus,
    pub target_plan_id: i64,
    pub amount_required: BigUint,
    pub token_received: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub token_id: Vec<u8>,
    pub token_type: Vec<u8>,
}

/// Everything `open_session` needs to run its transaction.
#[derive(Debug, Clone)]
pub struct OpenSessionRequest {
    pub session_id: Uuid,
    pub api_key: String,
    /// Insert a fresh active key row before locking it (initiate without a key).
    pub mint_key: bool,
    pub target_plan_id: i64,
    pub payment_address: String,
    pub receiver_nonce: Vec<u8>,
    pub amount_required: BigUint,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_id: Vec<u8>,
    pub token_type: Vec<u8>,
}

/// Everything `complete_purchase` needs to run its transaction.
#[derive(Debug, Clone)]
pub struct CompletePurchase {
    pub session_id: Uuid,
    pub api_key: String,
    pub plan_id: i64,
    pub active_until: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub token_received: String,
}

/// Payment-session persistence, including the two composite transactions the
/// payment workflow requires.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// One transaction under a `FOR UPDATE NOWAIT` lock on the api-key row:
    /// optionally mint the key, transition any previous pending session for
    /// the key to `failed`, insert the new pending session. A concurrently
    /// held lock surfaces as [`StoreError::LockConflict`].
    async fn open_session(&self, req: OpenSessionRequest) -> Result<PaymentSession, StoreError>;

    async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, StoreError>;

    async fn find_pending_by_key(&self, api_key: &str)
        -> Result<Option<PaymentSession>, StoreError>;

    /// `pending → failed`, optionally storing the received token JSON for
    /// reconciliation. A session already terminal is left untouched.
    async fn fail_session(&self, id: Uuid, token_received: Option<&str>)
        -> Result<(), StoreError>;

    /// `pending → expired` for one session.
    async fn expire_session(&self, id: Uuid) -> Result<(), StoreError>;

    /// Batch sweep: every pending session past its expiry becomes `expired`.
    /// Returns the number of sessions transitioned.
    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// One transaction: upgrade the key's plan and `active_until`, mark the
    /// session completed. Fails with [`StoreError::SessionNotPending`] if a
    /// concurrent path already finished the session.
    async fn complete_purchase(&self, req: CompletePurchase) -> Result<(), StoreError>;
}

/// Postgres-backed payment store.
#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = "id, api_key, payment_address, receiver_nonce, status, \
     target_plan_id, amount_required::TEXT AS amount_required, token_received, \
     created_at, completed_at, expires_at, token_id, token_type";

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<PaymentSession, StoreError> {
    let status: String = row.try_get("status").map_err(StoreError::from)?;
    let amount: String = row.try_get("amount_required").map_err(StoreError::from)?;
    Ok(PaymentSession {
        id: row.try_get("id").map_err(StoreError::from)?,
        api_key: row.try_get("api_key").map_err(StoreError::from)?,
        payment_address: row.try_get("payment_address").map_err(StoreError::from)?,
        receiver_nonce: row.try_get("receiver_nonce").map_err(StoreError::from)?,
        status: SessionStatus::parse(&status)?,
        target_plan_id: row.try_get("target_plan_id").map_err(StoreError::from)?,
        amount_required: parse_numeric(&amount)?,
        token_received: row.try_get("token_received").map_err(StoreError::from)?,
        created_at: row.try_get("created_at").map_err(StoreError::from)?,
        completed_at: row.try_get("completed_at").map_err(StoreError::from)?,
        expires_at: row.try_get("expires_at").map_err(StoreError::from)?,
        token_id: row.try_get("token_id").map_err(StoreError::from)?,
        token_type: row.try_get("token_type").map_err(StoreError::from)?,
    })
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn open_session(&self, req: OpenSessionRequest) -> Result<PaymentSession, StoreError> {
        let mut tx = self.pool.begin().await?;

        if req.mint_key {
            sqlx::query("INSERT INTO api_keys (api_key, description) VALUES ($1, '')")
                .bind(&req.api_key)
                .execute(&mut *tx)
                .await?;
        }

        // Row lock serializes concurrent initiations on the same key; NOWAIT
        // turns a held lock into an immediate 55P03 instead of queueing.
        let locked = sqlx::query(
            "SELECT status::TEXT AS status FROM api_keys WHERE api_key = $1 FOR UPDATE NOWAIT",
        )
        .bind(&req.api_key)
        .fetch_optional(&mut *tx)
        .await?;

        let status = match locked {
            None => return Err(StoreError::KeyNotFound),
            Some(row) => row.try_get::<String, _>("status").map_err(StoreError::from)?,
        };
        if status == "revoked" {
            return Err(StoreError::KeyRevoked);
        }

        sqlx::query(
            "UPDATE payment_sessions SET status = 'failed' \
             WHERE api_key = $1 AND status = 'pending'",
        )
        .bind(&req.api_key)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO payment_sessions \
                 (id, api_key, payment_address, receiver_nonce, status, target_plan_id, \
                  amount_required, created_at, expires_at, token_id, token_type) \
             VALUES ($1, $2, $3, $4, 'pending', $5, CAST($6 AS NUMERIC), $7, $8, $9, $10) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(req.session_id)
        .bind(&req.api_key)
        .bind(&req.payment_address)
        .bind(&req.receiver_nonce)
        .bind(req.target_plan_id)
        .bind(req.amount_required.to_string())
        .bind(req.created_at)
        .bind(req.expires_at)
        .bind(&req.token_id)
        .bind(&req.token_type)
        .fetch_one(&mut *tx)
        .await?;

        let session = session_from_row(&row)?;
        tx.commit().await?;
        Ok(session)
    }

    async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_pending_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<PaymentSession>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE api_key = $1 AND status = 'pending'"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn fail_session(
        &self,
        id: Uuid,
        token_received: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE payment_sessions \
             SET status = 'failed', token_received = COALESCE($2, token_received) \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(token_received)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_session(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE payment_sessions SET status = 'expired' \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE payment_sessions SET status = 'expired' \
             WHERE status = 'pending' AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn complete_purchase(&self, req: CompletePurchase) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE api_keys SET pricing_plan_id = $1, active_until = $2 WHERE api_key = $3",
        )
        .bind(req.plan_id)
        .bind(req.active_until)
        .bind(&req.api_key)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE payment_sessions \
             SET status = 'completed', completed_at = $1, token_received = $2 \
             WHERE id = $3 AND status = 'pending'",
        )
        .bind(req.completed_at)
        .bind(&req.token_received)
        .bind(req.session_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            // Dropping the transaction rolls back the plan upgrade.
            return Err(StoreError::SessionNotPending);
        }

        tx.commit().await?;
        Ok(())
    }
}
