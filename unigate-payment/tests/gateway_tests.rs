//! AggregatorGateway tests against a fake aggregator speaking just enough
//! JSON-RPC: `submit_commitment` and `get_inclusion_proof`.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router as AxumRouter};
use num_bigint::BigUint;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use unigate_core::router::ShardRouter;
use unigate_core::shard::{ShardConfig, ShardEntry};
use unigate_payment::{AggregatorGateway, SettleError, SettleRequest, TokenGateway};
use uuid::Uuid;

#[derive(Clone)]
struct FakeAggregator {
    /// Number of status polls before the commitment reads SUCCESS.
    accept_after: Arc<AtomicUsize>,
    /// Number of proof polls before the inclusion proof materializes.
    proof_after: Arc<AtomicUsize>,
}

/// Counts a poll down; true once the counter has already hit zero.
fn countdown_done(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        })
        .map(|previous| previous == 0)
        .unwrap_or(false)
}

async fn rpc(State(state): State<FakeAggregator>, Json(body): Json<Value>) -> Json<Value> {
    let method = body["method"].as_str().unwrap_or_default();
    let result = match method {
        "submit_commitment" => {
            if countdown_done(&state.accept_after) {
                json!({ "status": "SUCCESS" })
            } else {
                json!({ "status": "PENDING" })
            }
        }
        "get_inclusion_proof" => {
            if countdown_done(&state.proof_after) {
                json!({ "inclusionProof": { "merklePath": ["a", "b"] } })
            } else {
                json!({ "inclusionProof": null })
            }
        }
        other => json!({ "error": format!("unknown method {other}") }),
    };
    Json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

async fn spawn_aggregator(accept_after: usize, proof_after: usize) -> String {
    let state = FakeAggregator {
        accept_after: Arc::new(AtomicUsize::new(accept_after)),
        proof_after: Arc::new(AtomicUsize::new(proof_after)),
    };
    let app = AxumRouter::new().route("/", post(rpc)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn gateway_for(url: &str, accept_timeout: Duration, proof_timeout: Duration) -> AggregatorGateway {
    let config = ShardConfig {
        version: 1,
        shards: vec![ShardEntry {
            id: 1,
            url: url.to_string(),
        }],
    };
    let router = ShardRouter::from_config(&config).unwrap().into_shared();
    AggregatorGateway::new(b"secret".to_vec(), router, accept_timeout, proof_timeout).unwrap()
}

fn settle_request(gateway: &AggregatorGateway) -> SettleRequest {
    let nonce = vec![7u8; 32];
    let token_id = vec![1u8; 32];
    let token_type = b"unicity".to_vec();
    let address = gateway.derive_address(&nonce, &token_id, &token_type);
    SettleRequest {
        session_id: Uuid::new_v4(),
        receiver_nonce: nonce,
        token_id,
        token_type,
        expected_address: address.clone(),
        salt: vec![9, 9],
        transfer_commitment: json!({
            "requestId": "00".repeat(32),
            "transaction": { "recipient": address },
        }),
        source_token: json!({ "coins": [["c1", "5000"], ["c2", "2500"]] }),
    }
}

#[tokio::test]
async fn settle_happy_path_sums_the_coins() {
    let url = spawn_aggregator(0, 0).await;
    let gateway = gateway_for(&url, Duration::from_secs(30), Duration::from_secs(60));

    let settled = gateway.settle(settle_request(&gateway)).await.unwrap();
    assert_eq!(settled.amount, BigUint::from(7500u32));
    assert_eq!(settled.token_json["recipient"], settled.token_json["transfer"]["transaction"]["recipient"]);
    assert!(settled.token_json["inclusionProof"]["merklePath"].is_array());
}

#[tokio::test]
async fn settle_waits_for_acceptance_and_proof() {
    // SUCCESS on the second status poll, proof on the second proof poll
    let url = spawn_aggregator(1, 1).await;
    let gateway = gateway_for(&url, Duration::from_secs(30), Duration::from_secs(60));

    let settled = gateway.settle(settle_request(&gateway)).await.unwrap();
    assert_eq!(settled.amount, BigUint::from(7500u32));
}

#[tokio::test]
async fn settle_times_out_when_the_proof_never_converges() {
    let url = spawn_aggregator(0, usize::MAX).await;
    let gateway = gateway_for(&url, Duration::from_secs(5), Duration::from_millis(1500));

    let err = gateway.settle(settle_request(&gateway)).await.unwrap_err();
    assert!(matches!(err, SettleError::Timeout("inclusion proof")));
}

#[tokio::test]
async fn settle_rejects_a_mismatched_recipient() {
    let url = spawn_aggregator(0, 0).await;
    let gateway = gateway_for(&url, Duration::from_secs(30), Duration::from_secs(60));

    let mut req = settle_request(&gateway);
    req.transfer_commitment["transaction"]["recipient"] = json!("DIRECT://somewhere-else");
    let err = gateway.settle(req).await.unwrap_err();
    assert!(matches!(err, SettleError::VerificationFailed(_)));
}

#[tokio::test]
async fn settle_requires_a_request_id_in_the_commitment() {
    let url = spawn_aggregator(0, 0).await;
    let gateway = gateway_for(&url, Duration::from_secs(30), Duration::from_secs(60));

    let mut req = settle_request(&gateway);
    req.transfer_commitment = json!({ "transaction": {} });
    let err = gateway.settle(req).await.unwrap_err();
    assert!(matches!(err, SettleError::Aggregator(_)));
}
