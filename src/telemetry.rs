//! Tracing setup, following the teacher's `tracing_subscriber::fmt` +
//! `EnvFilter::from_default_env()` convention from `src/main.rs`.

pub fn init() {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();
}
