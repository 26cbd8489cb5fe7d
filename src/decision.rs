//! The decision engine: orchestrates the path parser, method translator,
//! token verifier, counter store, and policy runtime into one verdict per
//! request.
//!
//! Grounded on `ShouldRateLimit` in `internal/limiter/ratelimiter.go` of the
//! original source: the descriptor-flattening switch, the user/remote
//! two-pass policy check, and the "user denial wins over remote denial"
//! composition rule are carried over directly; the shared write-lock
//! sequencing is this crate's own answer to §5's serializability
//! requirement, grounded on `CounterStore::lock`.

use tracing::{info, warn};

use crate::counter_store::CounterStore;
use crate::counters::RequestCounters;
use crate::method_translator;
use crate::path_parser::{self, PathParts};
use crate::policy::{self, PolicyRequest, PolicyRuntime, RequestContext, RequestEntities};
use crate::token_verifier;

/// One flattened descriptor group, as received over the wire.
#[derive(Debug, Default, Clone)]
pub struct RequestState {
	pub raw_path: String,
	pub remote_address: String,
	pub authorization: String,
	pub method: String,
	pub prefer: String,
}

impl RequestState {
	/// Build a `RequestState` from an ordered list of (key, value) entries,
	/// ignoring unrecognized keys. `method` is translated last since
	/// `prefer` may appear after it in the descriptor.
	pub fn from_entries(entries: &[(String, String)]) -> Self {
		let mut state = RequestState::default();
		let mut http_verb = String::new();
		for (key, value) in entries {
			match key.as_str() {
				"path" => state.raw_path = value.clone(),
				"remote_address" => state.remote_address = value.clone(),
				"authorization" => state.authorization = value.clone(),
				"method" => http_verb = value.clone(),
				"prefer" => state.prefer = value.clone(),
				_ => {},
			}
		}
		state.method = method_translator::translate(&http_verb, &state.prefer);
		state
	}
}

/// The outcome of one `decide()` call.
#[derive(Debug, Clone)]
pub struct Verdict {
	pub allow: bool,
	/// `"jwt"` when the user-principal check denied, the peer address when
	/// the remote-principal check denied, absent when allowed.
	pub denied_by: Option<String>,
	pub seconds_until_reset: u64,
}

pub struct DecisionEngine {
	store: CounterStore,
	policy: PolicyRuntime,
	expire_time_secs: u64,
}

impl DecisionEngine {
	pub fn new(store: CounterStore, policy: PolicyRuntime, expire_time_secs: u64) -> Self {
		Self { store, policy, expire_time_secs }
	}

	/// Evaluate one request: fetch counters, run the policy twice, compose
	/// the verdict, account for the attempt, and write counters back.
	pub fn decide(&self, entries: &[(String, String)], hmac_secret: &[u8]) -> Verdict {
		let state = RequestState::from_entries(entries);
		let path = path_parser::parse_path(&state.raw_path);
		let claims = token_verifier::verify(&state.authorization, hmac_secret);
		let user_id = token_verifier::user_id_from_claims(&claims);

		// Serialize the whole get -> check -> batch_update sequence for
		// this pair of keys so concurrent requests for the same principal
		// cannot silently lose increments.
		let _guard = self.store.lock();

		let mut user_counters = self.store.get(&user_id);
		let mut remote_counters = self.store.get(&state.remote_address);

		let resource = match policy::resource_uid(non_empty(&path.table), non_empty(&path.function)) {
			Ok(r) => r,
			Err(err) => {
				warn!(error = %err, "failed to build policy resource; fail-open (admit)");
				self.record_and_store(&state, &path, &user_id, &mut user_counters, &mut remote_counters);
				return Verdict { allow: true, denied_by: None, seconds_until_reset: 0 };
			},
		};

		let entities = RequestEntities {
			remote_address: state.remote_address.clone(),
			table: non_empty(&path.table).map(str::to_string),
			function: non_empty(&path.function).map(str::to_string),
			claims,
			user_requests_for_method: user_counters.table_method_count(&state.method),
			remote_requests_for_method: remote_counters.table_method_count(&state.method),
		};
		let context = RequestContext {
			remote_address: state.remote_address.clone(),
			user_total_requests: user_counters.global as i64,
			remote_total_requests: remote_counters.global as i64,
		};

		let user_diag = self.policy.check(PolicyRequest {
			principal_type: "User",
			principal: "jwt",
			action: &state.method,
			resource: resource.clone(),
			entities: &entities,
			context: &context,
		});

		let (allow, denied_by, bucket_cause) = if !user_diag.allow {
			(false, Some("jwt".to_string()), &user_counters)
		} else {
			let remote_diag = self.policy.check(PolicyRequest {
				principal_type: "RemoteAddress",
				principal: &state.remote_address,
				action: &state.method,
				resource,
				entities: &entities,
				context: &context,
			});
			if !remote_diag.allow {
				(false, Some(state.remote_address.clone()), &remote_counters)
			} else {
				(true, None, &user_counters)
			}
		};

		let seconds_until_reset = if allow {
			0
		} else {
			bucket_cause.seconds_until_reset(self.expire_time_secs)
		};

		self.record_and_store(&state, &path, &user_id, &mut user_counters, &mut remote_counters);

		if !allow {
			info!(denied_by = ?denied_by, seconds_until_reset, "request over limit");
		}

		Verdict { allow, denied_by, seconds_until_reset }
	}

	fn record_and_store(
		&self,
		state: &RequestState,
		path: &PathParts,
		user_id: &str,
		user_counters: &mut RequestCounters,
		remote_counters: &mut RequestCounters,
	) {
		let table = non_empty(&path.table);
		let function = non_empty(&path.function);
		user_counters.record_request(table, function, &state.method);
		remote_counters.record_request(table, function, &state.method);

		let keys = vec![user_id.to_string(), state.remote_address.clone()];
		let counters = vec![user_counters.clone(), remote_counters.clone()];
		if let Err(err) = self.store.batch_update(&keys, &counters) {
			warn!(error = %err, "counter batch update failed; verdict already computed, proceeding");
		}
	}
}

fn non_empty(s: &str) -> Option<&str> {
	if s.is_empty() { None } else { Some(s) }
}
