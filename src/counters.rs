//! The per-principal sliding bucket and its compact wire encoding.
//!
//! Grounded on the Go `RequestCounters`/`TableRequestCounters` types in
//! `internal/limiter/ratelimiter.go` of the original source, carried over
//! field-for-field (including the single-character JSON keys used to keep
//! the KV payload small) since an implementer must preserve them for wire
//! compatibility.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock seconds since the Unix epoch. Stored instead of `SystemTime`
/// directly so the compact JSON encoding round-trips exactly.
pub type Timestamp = u64;

pub fn now() -> Timestamp {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before epoch")
		.as_secs()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRequestCounters {
	#[serde(rename = "m")]
	pub method_count: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounters {
	#[serde(rename = "s")]
	pub bucket_start: Timestamp,
	#[serde(rename = "g")]
	pub global: u64,
	#[serde(rename = "t", skip_serializing_if = "Option::is_none")]
	pub table: Option<TableRequestCounters>,
	#[serde(rename = "f")]
	pub function: u64,
}

impl RequestCounters {
	/// A fresh, empty bucket starting now. Used on a Counter Store miss.
	pub fn fresh() -> Self {
		Self {
			bucket_start: now(),
			global: 0,
			table: None,
			function: 0,
		}
	}

	/// Seconds remaining until this bucket expires, given `expire_time`
	/// seconds of total lifetime. Floored to 0; never negative.
	pub fn seconds_until_reset(&self, expire_time_secs: u64) -> u64 {
		let age = now().saturating_sub(self.bucket_start);
		expire_time_secs.saturating_sub(age)
	}

	/// Apply the accounting policy for one observed request: the window
	/// counts attempts, not successes, so this always runs regardless of
	/// verdict.
	pub fn record_request(&mut self, table: Option<&str>, function: Option<&str>, method: &str) {
		self.global += 1;
		if let Some(_table) = table {
			let counters = self.table.get_or_insert_with(TableRequestCounters::default);
			*counters.method_count.entry(method.to_string()).or_insert(0) += 1;
		}
		if function.is_some() {
			self.function += 1;
		}
	}

	/// The count this principal has accrued for `method` against the
	/// currently tracked table, or 0 if no table has been touched yet.
	pub fn table_method_count(&self, method: &str) -> u64 {
		self
			.table
			.as_ref()
			.and_then(|t| t.method_count.get(method))
			.copied()
			.unwrap_or(0)
	}

	pub fn serialize(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("RequestCounters is always serializable")
	}

	pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn compact_wire_keys() {
		let mut c = RequestCounters::fresh();
		c.record_request(Some("items"), None, "SELECT");
		let json: serde_json::Value = serde_json::from_slice(&c.serialize()).unwrap();
		assert!(json.get("s").is_some());
		assert!(json.get("g").is_some());
		assert!(json.get("t").is_some());
		assert!(json.get("f").is_some());
		assert_eq!(json["t"]["m"]["SELECT"], 1);
	}

	#[test]
	fn round_trip() {
		let mut c = RequestCounters::fresh();
		c.record_request(Some("items"), None, "SELECT");
		c.record_request(None, Some("recompute"), "SELECT");
		let bytes = c.serialize();
		let back = RequestCounters::deserialize(&bytes).unwrap();
		assert_eq!(c, back);
	}

	#[test]
	fn global_counts_every_request() {
		let mut c = RequestCounters::fresh();
		for _ in 0..5 {
			c.record_request(Some("items"), None, "SELECT");
		}
		assert_eq!(c.global, 5);
	}

	#[test]
	fn table_counter_collapses_to_most_recently_touched_table() {
		let mut c = RequestCounters::fresh();
		c.record_request(Some("items"), None, "SELECT");
		c.record_request(Some("orders"), None, "SELECT");
		// the collapsed model does not distinguish which table was touched,
		// only which verb — both increments land in the same counter.
		assert_eq!(c.table_method_count("SELECT"), 2);
	}

	#[test]
	fn seconds_until_reset_floors_at_zero() {
		let mut c = RequestCounters::fresh();
		c.bucket_start = 0;
		assert_eq!(c.seconds_until_reset(60), 0);
	}
}
