//! CLI entry point, following the teacher's `clap::Parser` + `tokio::main` +
//! `tracing_subscriber` bootstrap from `src/main.rs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ratelimit_decider::counter_store::{self, CounterStore};
use ratelimit_decider::decision::DecisionEngine;
use ratelimit_decider::grpc::Decider;
use ratelimit_decider::policy::PolicyRuntime;
use ratelimit_decider::proto::rate_limit_service_server::RateLimitServiceServer;
use serde::Deserialize;
use tonic::transport::Server;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ratelimit-decider", about = "Envoy-compatible external rate limit decision service")]
struct Args {
	/// HMAC secret used to verify bearer tokens.
	#[arg(long)]
	hmac: Option<String>,

	/// Path to the Cedar policy file.
	#[arg(long)]
	path: Option<PathBuf>,

	/// Path to an optional YAML config file supplying any of these fields.
	/// CLI flags take precedence over file values.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Directory for the embedded counter store.
	#[arg(long)]
	kv_path: Option<PathBuf>,

	/// Address the gRPC server listens on.
	#[arg(long)]
	listen: Option<String>,

	/// Seconds before a counter bucket expires.
	#[arg(long)]
	expire_seconds: Option<u64>,

	/// Seconds between counter store compaction passes.
	#[arg(long)]
	compaction_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
	hmac: Option<String>,
	path: Option<PathBuf>,
	kv_path: Option<PathBuf>,
	listen: Option<String>,
	expire_seconds: Option<u64>,
	compaction_interval_seconds: Option<u64>,
}

struct ResolvedConfig {
	hmac: String,
	path: PathBuf,
	kv_path: PathBuf,
	listen: String,
	expire_seconds: u64,
	compaction_interval_seconds: u64,
}

const DEFAULT_KV_PATH: &str = "./ratelimit.db";
const DEFAULT_LISTEN: &str = "localhost:3007";
const DEFAULT_EXPIRE_SECONDS: u64 = 60;
const DEFAULT_COMPACTION_INTERVAL_SECONDS: u64 = 300;

fn resolve_config(args: Args) -> anyhow::Result<ResolvedConfig> {
	let file: FileConfig = match &args.config {
		Some(path) => {
			let raw = std::fs::read_to_string(path)?;
			serde_yaml::from_str(&raw)?
		},
		None => FileConfig::default(),
	};

	let hmac = args
		.hmac
		.or(file.hmac)
		.ok_or_else(|| anyhow::anyhow!("--hmac is required (via flag or config file)"))?;
	let path = args
		.path
		.or(file.path)
		.ok_or_else(|| anyhow::anyhow!("--path is required (via flag or config file)"))?;

	Ok(ResolvedConfig {
		hmac,
		path,
		kv_path: args.kv_path.or(file.kv_path).unwrap_or_else(|| PathBuf::from(DEFAULT_KV_PATH)),
		listen: args.listen.or(file.listen).unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
		expire_seconds: args.expire_seconds.or(file.expire_seconds).unwrap_or(DEFAULT_EXPIRE_SECONDS),
		compaction_interval_seconds: args
			.compaction_interval_seconds
			.or(file.compaction_interval_seconds)
			.unwrap_or(DEFAULT_COMPACTION_INTERVAL_SECONDS),
	})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	ratelimit_decider::telemetry::init();

	let config = resolve_config(Args::parse())?;
	let addr: SocketAddr = config
		.listen
		.parse()
		.or_else(|_| {
			use std::net::ToSocketAddrs;
			config
				.listen
				.to_socket_addrs()
				.ok()
				.and_then(|mut it| it.next())
				.ok_or_else(|| anyhow::anyhow!("could not resolve listen address {}", config.listen))
		})?;

	let store = CounterStore::open(&config.kv_path, config.expire_seconds)?;
	let compaction = counter_store::spawn_compaction_worker(
		store.clone(),
		Duration::from_secs(config.compaction_interval_seconds),
	);

	let (policy, _watcher) = PolicyRuntime::init(&config.path).await?;
	let engine = DecisionEngine::new(store, policy, config.expire_seconds);
	let decider = Decider::new(engine, config.hmac.into_bytes());

	info!(%addr, kv_path = %config.kv_path.display(), policy_path = %config.path.display(), "starting rate limit decider");

	Server::builder()
		.add_service(RateLimitServiceServer::new(decider))
		.serve(addr)
		.await?;

	compaction.shutdown().await;
	Ok(())
}
