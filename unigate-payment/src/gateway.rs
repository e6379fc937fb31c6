use async_trait::async_trait;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use unigate_core::router::SharedRouter;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Inputs for settling one payment session's transfer.
#[derive(Debug, Clone)]
pub struct SettleRequest {
    pub session_id: Uuid,
    pub receiver_nonce: Vec<u8>,
    pub token_id: Vec<u8>,
    pub token_type: Vec<u8>,
    /// The receive address the session was opened with; the finalized
    /// transfer must land exactly here.
    pub expected_address: String,
    pub salt: Vec<u8>,
    pub transfer_commitment: Value,
    pub source_token: Value,
}

/// A finalized, verified incoming token.
#[derive(Debug, Clone)]
pub struct SettledToken {
    pub token_json: Value,
    pub amount: BigUint,
}

#[derive(Error, Debug)]
pub enum SettleError {
    #[error("commitment rejected: {0}")]
    CommitmentRejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("token verification failed: {0}")]
    VerificationFailed(String),

    #[error("aggregator error: {0}")]
    Aggregator(String),
}

/// Boundary to the token SDK and the aggregator network.
///
/// Address derivation and transfer settlement are opaque to the payment
/// workflow; this trait is the seam tests replace.
#[async_trait]
pub trait TokenGateway: Send + Sync {
    /// Deterministic receive address for `(serverSecret, nonce, tokenId,
    /// tokenType)`; not guessable without the server secret.
    fn derive_address(&self, receiver_nonce: &[u8], token_id: &[u8], token_type: &[u8]) -> String;

    /// Submit the transfer commitment, await acceptance and the inclusion
    /// proof, finalize to the receiver predicate, and verify the token.
    async fn settle(&self, req: SettleRequest) -> Result<SettledToken, SettleError>;
}

/// Production gateway: talks JSON-RPC to the aggregator shards selected by
/// the live router, and keys address derivation with the server secret.
pub struct AggregatorGateway {
    secret: Vec<u8>,
    router: SharedRouter,
    client: reqwest::Client,
    accept_timeout: Duration,
    proof_timeout: Duration,
    poll_interval: Duration,
}

impl AggregatorGateway {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        router: SharedRouter,
        accept_timeout: Duration,
        proof_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            secret: secret.into(),
            router,
            client,
            accept_timeout,
            proof_timeout,
            poll_interval: Duration::from_secs(1),
        })
    }

    fn target_for(&self, commitment: &Value) -> Result<String, SettleError> {
        let request_id = commitment
            .get("requestId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SettleError::Aggregator("commitment has no requestId".into()))?;
        let router = self.router.load_full();
        router
            .route_by_request_id(request_id)
            .map(|t| t.url)
            .map_err(|e| SettleError::Aggregator(e.to_string()))
    }

    async fn rpc(&self, url: &str, method: &str, params: Value) -> Result<Value, SettleError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SettleError::Aggregator(e.to_string()))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| SettleError::Aggregator(e.to_string()))?;
        if let Some(err) = value.get("error") {
            return Err(SettleError::Aggregator(err.to_string()));
        }
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Submit the commitment and wait for `SUCCESS`, re-submitting each poll
    /// tick (submission is idempotent on the aggregator side).
    async fn await_acceptance(&self, url: &str, commitment: &Value) -> Result<(), SettleError> {
        let wait = async {
            loop {
                let result = self
                    .rpc(url, "submit_commitment", commitment.clone())
                    .await?;
                match result.get("status").and_then(|s| s.as_str()) {
                    Some("SUCCESS") => return Ok(()),
                    Some("PENDING") | None => {}
                    Some(other) => {
                        return Err(SettleError::CommitmentRejected(other.to_string()));
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.accept_timeout, wait)
            .await
            .map_err(|_| SettleError::Timeout("commitment acceptance"))?
    }

    async fn await_inclusion_proof(
        &self,
        url: &str,
        request_id: &str,
    ) -> Result<Value, SettleError> {
        let wait = async {
            loop {
                let result = self
                    .rpc(url, "get_inclusion_proof", json!({ "requestId": request_id }))
                    .await?;
                if let Some(proof) = result.get("inclusionProof") {
                    if !proof.is_null() {
                        return Ok(proof.clone());
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.proof_timeout, wait)
            .await
            .map_err(|_| SettleError::Timeout("inclusion proof"))?
    }
}

#[async_trait]
impl TokenGateway for AggregatorGateway {
    fn derive_address(&self, receiver_nonce: &[u8], token_id: &[u8], token_type: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(receiver_nonce);
        mac.update(token_id);
        mac.update(token_type);
        let digest = mac.finalize().into_bytes();
        format!("DIRECT://{}", hex::encode(digest))
    }

    async fn settle(&self, req: SettleRequest) -> Result<SettledToken, SettleError> {
        let url = self.target_for(&req.transfer_commitment)?;
        let request_id = req
            .transfer_commitment
            .get("requestId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        self.await_acceptance(&url, &req.transfer_commitment).await?;
        let proof = self.await_inclusion_proof(&url, &request_id).await?;
        debug!(session = %req.session_id, "inclusion proof converged");

        // Finalize to the receiver predicate: the derived address for the
        // stored nonce must be the one the transfer names as its recipient.
        let derived = self.derive_address(&req.receiver_nonce, &req.token_id, &req.token_type);
        if derived != req.expected_address {
            return Err(SettleError::VerificationFailed(
                "receiver predicate does not match the session address".into(),
            ));
        }
        let recipient = req
            .transfer_commitment
            .get("transaction")
            .and_then(|t| t.get("recipient"))
            .or_else(|| req.transfer_commitment.get("recipient"))
            .and_then(|r| r.as_str())
            .unwrap_or_default();
        if recipient != req.expected_address {
            return Err(SettleError::VerificationFailed(format!(
                "transfer recipient {recipient} is not the session address"
            )));
        }

        let amount = sum_coins(&req.source_token)?;
        let token_json = json!({
            "token": req.source_token,
            "transfer": req.transfer_commitment,
            "inclusionProof": proof,
            "recipient": req.expected_address,
        });
        Ok(SettledToken { token_json, amount })
    }
}

/// Sum a token's coin amounts. Coins appear either as `[coinId, "amount"]`
/// pairs or as objects with an `amount` field; amounts are decimal strings.
pub fn sum_coins(token: &Value) -> Result<BigUint, SettleError> {
    let coins = match token.get("coins") {
        None | Some(Value::Null) => return Ok(BigUint::from(0u32)),
        Some(value) => value,
    };
    // Tolerate one level of nesting: { "coins": { "coins": [...] } }
    let coins = coins.get("coins").unwrap_or(coins);
    let entries = coins
        .as_array()
        .ok_or_else(|| SettleError::VerificationFailed("coins is not a list".into()))?;

    let mut total = BigUint::from(0u32);
    for entry in entries {
        let raw = match entry {
            Value::Array(pair) => pair.get(1).and_then(|v| v.as_str()),
            Value::Object(obj) => obj.get("amount").and_then(|v| v.as_str()),
            _ => None,
        }
        .ok_or_else(|| SettleError::VerificationFailed("malformed coin entry".into()))?;
        let amount = BigUint::parse_bytes(raw.as_bytes(), 10)
            .ok_or_else(|| SettleError::VerificationFailed(format!("bad coin amount: {raw}")))?;
        total += amount;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unigate_core::router::ShardRouter;

    fn gateway() -> AggregatorGateway {
        AggregatorGateway::new(
            b"test-secret".to_vec(),
            ShardRouter::Failsafe.into_shared(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn derived_addresses_are_deterministic() {
        let g = gateway();
        let a = g.derive_address(&[1; 32], b"tid", b"ttype");
        let b = g.derive_address(&[1; 32], b"tid", b"ttype");
        assert_eq!(a, b);
        assert!(a.starts_with("DIRECT://"));
        assert_eq!(a.len(), "DIRECT://".len() + 64);
    }

    #[test]
    fn derived_addresses_differ_per_input() {
        let g = gateway();
        let base = g.derive_address(&[1; 32], b"tid", b"ttype");
        assert_ne!(base, g.derive_address(&[2; 32], b"tid", b"ttype"));
        assert_ne!(base, g.derive_address(&[1; 32], b"other", b"ttype"));
        assert_ne!(base, g.derive_address(&[1; 32], b"tid", b"other"));
    }

    #[test]
    fn derived_addresses_depend_on_the_secret() {
        let g1 = gateway();
        let g2 = AggregatorGateway::new(
            b"another-secret".to_vec(),
            ShardRouter::Failsafe.into_shared(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_ne!(
            g1.derive_address(&[1; 32], b"tid", b"ttype"),
            g2.derive_address(&[1; 32], b"tid", b"ttype")
        );
    }

    #[test]
    fn sum_coins_handles_pairs_and_objects() {
        let token = json!({ "coins": [["c1", "100"], ["c2", "250"]] });
        assert_eq!(sum_coins(&token).unwrap(), BigUint::from(350u32));

        let token = json!({ "coins": { "coins": [{ "id": "c1", "amount": "42" }] } });
        assert_eq!(sum_coins(&token).unwrap(), BigUint::from(42u32));
    }

    #[test]
    fn sum_coins_of_a_coinless_token_is_zero() {
        assert_eq!(sum_coins(&json!({})).unwrap(), BigUint::from(0u32));
        assert_eq!(
            sum_coins(&json!({ "coins": null })).unwrap(),
            BigUint::from(0u32)
        );
    }

    #[test]
    fn sum_coins_rejects_malformed_entries() {
        assert!(sum_coins(&json!({ "coins": "lots" })).is_err());
        assert!(sum_coins(&json!({ "coins": [["c1"]] })).is_err());
        assert!(sum_coins(&json!({ "coins": [["c1", "12.5"]] })).is_err());
        assert!(sum_coins(&json!({ "coins": [["c1", "-5"]] })).is_err());
    }

    #[test]
    fn sum_coins_is_exact_at_78_digits() {
        let big = "9".repeat(77);
        let token = json!({ "coins": [["c1", big], ["c2", "1"]] });
        let expected = BigUint::parse_bytes(b"1", 10).unwrap()
            + BigUint::parse_bytes("9".repeat(77).as_bytes(), 10).unwrap();
        assert_eq!(sum_coins(&token).unwrap(), expected);
    }
}
