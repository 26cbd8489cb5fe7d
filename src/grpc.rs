//! The tonic service implementation: translates the Envoy-compatible wire
//! types to and from the Decision Engine's plain-Rust contract.
//!
//! Grounded on `remoteratelimit.rs`'s `pub mod proto { tonic::include_proto!
//! ("envoy.service.ratelimit.v3"); }` for the proto package name, and on the
//! server-side `tonic::Request`/`Response` plumbing used throughout the
//! teacher's proxy crates.

use tonic::{Request, Response, Status};
use tracing::{instrument, warn};

use crate::decision::DecisionEngine;
use crate::proto::rate_limit_response::{Code, DescriptorStatus};
use crate::proto::rate_limit_service_server::RateLimitService;
use crate::proto::{RateLimitRequest, RateLimitResponse};

pub struct Decider {
	engine: DecisionEngine,
	hmac_secret: Vec<u8>,
}

impl Decider {
	pub fn new(engine: DecisionEngine, hmac_secret: Vec<u8>) -> Self {
		Self { engine, hmac_secret }
	}
}

#[tonic::async_trait]
impl RateLimitService for Decider {
	#[instrument(skip_all, fields(domain = %request.get_ref().domain))]
	async fn should_rate_limit(
		&self,
		request: Request<RateLimitRequest>,
	) -> Result<Response<RateLimitResponse>, Status> {
		let req = request.into_inner();
		if req.descriptors.is_empty() {
			return Err(Status::invalid_argument("at least one descriptor is required"));
		}

		// All descriptor groups describe one RPC and flatten into a single
		// RequestState; the original switches over every Entries[] slot
		// regardless of which descriptor it came from.
		let entries: Vec<(String, String)> = req
			.descriptors
			.iter()
			.flat_map(|descriptor| descriptor.entries.iter())
			.map(|e| (e.key.clone(), e.value.clone()))
			.collect();

		let verdict = self.engine.decide(&entries, &self.hmac_secret);
		if !verdict.allow {
			if let Some(denied_by) = &verdict.denied_by {
				warn!(denied_by, "request over limit");
			}
		}

		let status = DescriptorStatus {
			code: if verdict.allow { Code::Ok as i32 } else { Code::OverLimit as i32 },
			current_limit: None,
			limit_remaining: 0,
			duration_until_reset: if verdict.allow {
				None
			} else {
				Some(prost_types::Duration {
					seconds: verdict.seconds_until_reset as i64,
					nanos: 0,
				})
			},
		};

		let response = RateLimitResponse {
			overall_code: status.code,
			statuses: vec![status],
		};
		Ok(Response::new(response))
	}
}
