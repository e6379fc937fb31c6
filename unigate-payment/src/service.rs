use crate::discount::{amount_due, DiscountParams};
use crate::gateway::{SettleRequest, TokenGateway};
use chrono::{DateTime, Duration, Utc};
use num_bigint::BigUint;
use rand::RngCore;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use unigate_core::clock::TimeMeter;
use unigate_core::config::PaymentConfig;
use unigate_core::GatewayError;
use unigate_observability::MetricsCollector;
use unigate_store::sessions::{CompletePurchase, OpenSessionRequest, PaymentStore};
use unigate_store::{ApiKeyCache, ApiKeyStatus, KeyStore, PaymentSession, PricingPlan, SessionStatus};
use uuid::Uuid;

/// Tunables lifted out of the config once at startup.
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub session_ttl: Duration,
    pub plan_period: Duration,
    pub discount: DiscountParams,
}

impl PaymentSettings {
    pub fn from_config(config: &PaymentConfig) -> anyhow::Result<Self> {
        let minimum = BigUint::parse_bytes(config.minimum_payment.as_bytes(), 10)
            .ok_or_else(|| anyhow::anyhow!("minimum_payment is not a decimal integer"))?;
        Ok(Self {
            session_ttl: Duration::seconds(config.session_ttl_secs as i64),
            plan_period: Duration::days(config.plan_period_days),
            discount: DiscountParams::new(config.plan_period_days, config.grace_secs, minimum),
        })
    }
}

pub struct InitiateRequest {
    pub api_key: Option<String>,
    pub target_plan_id: i64,
    pub token_id: Vec<u8>,
    pub token_type: Vec<u8>,
}

#[derive(Debug)]
pub struct InitiateResponse {
    pub session_id: Uuid,
    pub api_key: String,
    pub payment_address: String,
    pub amount_required: BigUint,
    pub expires_at: DateTime<Utc>,
}

pub struct CompleteRequest {
    pub session_id: Uuid,
    pub salt: Vec<u8>,
    pub transfer_commitment: Value,
    pub source_token: Value,
}

/// Business outcome of a processed completion; transport-level failures
/// (unknown session, wrong state, lock conflicts) surface as errors instead.
#[derive(Debug)]
pub struct CompleteOutcome {
    pub success: bool,
    pub message: String,
    pub new_plan_id: Option<i64>,
    pub api_key: Option<String>,
}

#[derive(Debug)]
pub struct KeyDetails {
    pub status: ApiKeyStatus,
    pub active_until: Option<DateTime<Utc>>,
    pub plan: Option<PricingPlan>,
}

/// The payment workflow: initiate / complete / status / key details, plus the
/// periodic expiry sweep.
pub struct PaymentService {
    keys: Arc<dyn KeyStore>,
    payments: Arc<dyn PaymentStore>,
    gateway: Arc<dyn TokenGateway>,
    cache: Arc<ApiKeyCache>,
    clock: Arc<dyn TimeMeter>,
    metrics: Arc<MetricsCollector>,
    settings: PaymentSettings,
}

impl PaymentService {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        payments: Arc<dyn PaymentStore>,
        gateway: Arc<dyn TokenGateway>,
        cache: Arc<ApiKeyCache>,
        clock: Arc<dyn TimeMeter>,
        metrics: Arc<MetricsCollector>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            keys,
            payments,
            gateway,
            cache,
            clock,
            metrics,
            settings,
        }
    }

    /// Open a payment session: bind a fresh receive address, compute the
    /// discounted amount, and persist the pending session under the api-key
    /// row lock (cancelling any previous pending one).
    pub async fn initiate(&self, req: InitiateRequest) -> Result<InitiateResponse, GatewayError> {
        let target_plan = self
            .keys
            .plan(req.target_plan_id)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::BadRequest("Unknown pricing plan".into()))?;

        let now = self.clock.now();

        let (api_key, mint_key, current) = match &req.api_key {
            Some(key) => {
                let record = self
                    .keys
                    .find_key(key)
                    .await
                    .map_err(GatewayError::from)?
                    .ok_or_else(|| GatewayError::BadRequest("Invalid API key".into()))?;
                if record.status == ApiKeyStatus::Revoked {
                    return Err(GatewayError::BadRequest("API key is revoked".into()));
                }
                let current = match (record.pricing_plan_id, record.active_until) {
                    (Some(plan_id), Some(active_until)) => self
                        .keys
                        .plan(plan_id)
                        .await
                        .map_err(GatewayError::from)?
                        .map(|plan| (plan.price, active_until)),
                    _ => None,
                };
                (key.clone(), false, current)
            }
            None => (mint_api_key(), true, None),
        };

        let amount_required = amount_due(
            &target_plan.price,
            current.as_ref().map(|(price, until)| (price, *until)),
            now,
            &self.settings.discount,
        );

        let mut receiver_nonce = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut receiver_nonce);
        let payment_address =
            self.gateway
                .derive_address(&receiver_nonce, &req.token_id, &req.token_type);

        let session = self
            .payments
            .open_session(OpenSessionRequest {
                session_id: Uuid::new_v4(),
                api_key: api_key.clone(),
                mint_key,
                target_plan_id: target_plan.id,
                payment_address,
                receiver_nonce,
                amount_required,
                created_at: now,
                expires_at: now + self.settings.session_ttl,
                token_id: req.token_id,
                token_type: req.token_type,
            })
            .await
            .map_err(GatewayError::from)?;

        info!(
            session = %session.id,
            plan = target_plan.id,
            amount = %session.amount_required,
            minted = mint_key,
            "payment session opened"
        );

        Ok(InitiateResponse {
            session_id: session.id,
            api_key,
            payment_address: session.payment_address,
            amount_required: session.amount_required,
            expires_at: session.expires_at,
        })
    }

    /// Complete a pending session: settle the transfer through the gateway,
    /// check the amount, then upgrade the key and finish the session in one
    /// transaction.
    pub async fn complete(&self, req: CompleteRequest) -> Result<CompleteOutcome, GatewayError> {
        let session = self
            .payments
            .session(req.session_id)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::BadRequest("Invalid session ID".into()))?;

        if session.status != SessionStatus::Pending {
            return Err(GatewayError::PaymentRequired("Session is not pending".into()));
        }

        let now = self.clock.now();
        if now > session.expires_at {
            self.payments
                .expire_session(session.id)
                .await
                .map_err(GatewayError::from)?;
            self.record_terminal("expired");
            return Err(GatewayError::PaymentRequired("Session expired".into()));
        }

        let settled = match self
            .gateway
            .settle(SettleRequest {
                session_id: session.id,
                receiver_nonce: session.receiver_nonce.clone(),
                token_id: session.token_id.clone(),
                token_type: session.token_type.clone(),
                expected_address: session.payment_address.clone(),
                salt: req.salt,
                transfer_commitment: req.transfer_commitment,
                source_token: req.source_token,
            })
            .await
        {
            Ok(settled) => settled,
            Err(e) => {
                warn!(session = %session.id, error = %e, "settlement failed");
                self.payments
                    .fail_session(session.id, None)
                    .await
                    .map_err(GatewayError::from)?;
                self.record_terminal("failed");
                return Ok(CompleteOutcome {
                    success: false,
                    message: e.to_string(),
                    new_plan_id: None,
                    api_key: None,
                });
            }
        };

        if settled.amount < session.amount_required {
            // Keep the received token on record so operators can reconcile.
            let token_json = settled.token_json.to_string();
            self.payments
                .fail_session(session.id, Some(&token_json))
                .await
                .map_err(GatewayError::from)?;
            self.record_terminal("failed");
            return Ok(CompleteOutcome {
                success: false,
                message: "Insufficient payment amount".into(),
                new_plan_id: None,
                api_key: None,
            });
        }

        self.payments
            .complete_purchase(CompletePurchase {
                session_id: session.id,
                api_key: session.api_key.clone(),
                plan_id: session.target_plan_id,
                active_until: now + self.settings.plan_period,
                completed_at: now,
                token_received: settled.token_json.to_string(),
            })
            .await
            .map_err(GatewayError::from)?;

        self.cache.invalidate(&session.api_key);
        self.record_terminal("completed");
        info!(session = %session.id, plan = session.target_plan_id, "payment completed");

        Ok(CompleteOutcome {
            success: true,
            message: "Payment completed".into(),
            new_plan_id: Some(session.target_plan_id),
            api_key: Some(session.api_key),
        })
    }

    pub async fn payment_status(&self, id: Uuid) -> Result<Option<PaymentSession>, GatewayError> {
        self.payments.session(id).await.map_err(GatewayError::from)
    }

    /// Public key read: revoked and unknown keys both come back as not-found.
    pub async fn key_details(&self, api_key: &str) -> Result<KeyDetails, GatewayError> {
        let record = self
            .keys
            .find_key(api_key)
            .await
            .map_err(GatewayError::from)?
            .filter(|r| r.status != ApiKeyStatus::Revoked)
            .ok_or_else(|| GatewayError::NotFound("Unknown API key".into()))?;

        let plan = match record.pricing_plan_id {
            Some(id) => self.keys.plan(id).await.map_err(GatewayError::from)?,
            None => None,
        };

        Ok(KeyDetails {
            status: record.status,
            active_until: record.active_until,
            plan,
        })
    }

    pub async fn plans(&self) -> Result<Vec<PricingPlan>, GatewayError> {
        self.keys.plans().await.map_err(GatewayError::from)
    }

    /// Transition every overdue pending session to `expired`.
    pub async fn sweep_expired(&self) -> Result<u64, GatewayError> {
        let swept = self
            .payments
            .expire_pending(self.clock.now())
            .await
            .map_err(GatewayError::from)?;
        if swept > 0 {
            for _ in 0..swept {
                self.record_terminal("expired");
            }
            info!(swept, "expired pending payment sessions");
        }
        Ok(swept)
    }

    /// Background sweep loop; ends when the shutdown signal flips.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_expired().await {
                        warn!(error = %e, "session sweep failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn record_terminal(&self, status: &str) {
        self.metrics
            .payment_sessions_total
            .with_label_values(&[status])
            .inc();
    }
}

/// Fresh key id: `sk_` + 32 lowercase hex chars, no dashes.
fn mint_api_key() -> String {
    format!("sk_{}", Uuid::new_v4().simple())
}
