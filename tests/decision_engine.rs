//! End-to-end scenarios against a temporary sled directory and a temporary
//! Cedar policy file, exercising the full path-parse -> token-verify ->
//! counter-store -> policy-runtime pipeline through `DecisionEngine`.

use std::io::Write;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use ratelimit_decider::counter_store::CounterStore;
use ratelimit_decider::counters::RequestCounters;
use ratelimit_decider::decision::DecisionEngine;
use ratelimit_decider::policy::PolicyRuntime;

const SECRET: &[u8] = b"integration-test-secret";

async fn engine_with_policy(policy_src: &str) -> (tempfile::TempDir, tempfile::NamedTempFile, DecisionEngine) {
	let kv_dir = tempfile::tempdir().unwrap();
	let store = CounterStore::open(kv_dir.path(), 60).unwrap();
	let mut policy_file = tempfile::NamedTempFile::new().unwrap();
	policy_file.write_all(policy_src.as_bytes()).unwrap();
	let (policy, _handle) = PolicyRuntime::init(policy_file.path()).await.unwrap();
	(kv_dir, policy_file, DecisionEngine::new(store, policy, 60))
}

fn entries(path: &str, remote: &str, method: &str, authorization: &str, prefer: &str) -> Vec<(String, String)> {
	vec![
		("path".to_string(), path.to_string()),
		("remote_address".to_string(), remote.to_string()),
		("method".to_string(), method.to_string()),
		("authorization".to_string(), authorization.to_string()),
		("prefer".to_string(), prefer.to_string()),
	]
}

fn sign(claims: serde_json::Value) -> String {
	encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

#[tokio::test]
async fn s1_admit_fresh_principal() {
	let (_kv, _pf, engine) = engine_with_policy("").await;
	let req = entries("/rest/v1/items?select=id,name::text", "10.0.0.1", "GET", "", "");
	let verdict = engine.decide(&req, SECRET);
	assert!(verdict.allow);
}

#[tokio::test]
async fn s2_method_mapping_with_prefer() {
	// A policy that only forbids UPSERT lets us observe the mapping
	// indirectly: if the prefer header were ignored the request would be
	// INSERT, which this policy never touches, so it would always admit.
	let (_kv, _pf, engine) = engine_with_policy(r#"forbid (principal, action == Action::"UPSERT", resource);"#).await;
	let req = entries("/rest/v1/items", "10.0.0.2", "POST", "", "resolution=merge-duplicates");
	let verdict = engine.decide(&req, SECRET);
	assert!(!verdict.allow);
}

#[tokio::test]
async fn s3_function_route_targets_function_resource() {
	let (_kv, _pf, engine) =
		engine_with_policy(r#"forbid (principal, action, resource == Function::"recompute");"#).await;
	let req = entries("/rest/v1/rpc/recompute?x=1", "10.0.0.3", "GET", "", "");
	let verdict = engine.decide(&req, SECRET);
	assert!(!verdict.allow);
}

#[tokio::test]
async fn s4_over_limit_by_user() {
	let (kv_dir, _pf, engine) = engine_with_policy(
		r#"forbid (principal, action, resource) when { context.user_total_requests > 10 };"#,
	)
	.await;

	// preload: user u1 already has global=11
	let store = CounterStore::open(kv_dir.path(), 60).unwrap();
	let mut preload = RequestCounters::fresh();
	for _ in 0..11 {
		preload.record_request(Some("items"), None, "GET");
	}
	store.update("u1", &preload).unwrap();

	let token = sign(serde_json::json!({ "id": "u1", "role": "authenticated" }));
	let req = entries("/rest/v1/items", "10.0.0.4", "GET", &format!("Bearer {token}"), "");
	let verdict = engine.decide(&req, SECRET);

	assert!(!verdict.allow);
	assert_eq!(verdict.denied_by.as_deref(), Some("jwt"));
}

#[tokio::test]
async fn s5_over_limit_by_peer_user_ok() {
	let (kv_dir, _pf, engine) = engine_with_policy(
		r#"forbid (principal, action, resource) when { context.remote_total_requests > 15 };"#,
	)
	.await;

	let store = CounterStore::open(kv_dir.path(), 60).unwrap();
	let mut preload = RequestCounters::fresh();
	for _ in 0..20 {
		preload.record_request(Some("items"), None, "GET");
	}
	store.update("10.0.0.5", &preload).unwrap();

	let req = entries("/rest/v1/items", "10.0.0.5", "GET", "", "");
	let verdict = engine.decide(&req, SECRET);

	assert!(!verdict.allow);
	assert_eq!(verdict.denied_by.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
async fn s6_invalid_token_treated_as_anonymous() {
	let (_kv, _pf, engine) = engine_with_policy("").await;
	let req = entries("/rest/v1/items", "10.0.0.6", "GET", "Bearer not-a-real-jwt", "");
	let verdict = engine.decide(&req, SECRET);
	assert!(verdict.allow);
}
