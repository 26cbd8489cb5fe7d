pub mod counter_store;
pub mod counters;
pub mod decision;
pub mod grpc;
pub mod method_translator;
pub mod path_parser;
pub mod policy;
pub mod telemetry;
pub mod token_verifier;

pub mod proto {
	tonic::include_proto!("envoy.service.ratelimit.v3");
}
