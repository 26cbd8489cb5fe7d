//! Parses PostgREST-style request paths into structured resource descriptors.
//!
//! Grounded on the `path`/`remote_address` descriptor handling in
//! `http/remoteratelimit.rs` and the query-string utilities used throughout
//! `src/http/*` in the teacher repo; the specific path grammar (`/rest/v1`,
//! `/rpc/<fn>`, `select=` column lists) is described in the specification
//! and is not itself present in the teacher's HTTP proxy.

use std::collections::BTreeMap;

const REST_PREFIX: &str = "/rest/v1";
const RPC_SEGMENT: &str = "rpc/";

/// Parsed form of a request path. Malformed input never produces an error;
/// it degrades to a zero-valued, "unscoped" `PathParts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParts {
	pub table: String,
	pub function: String,
	pub columns: Vec<String>,
	pub filters: BTreeMap<String, String>,
}

impl PathParts {
	/// True when exactly one of `table`/`function` is populated.
	pub fn is_scoped(&self) -> bool {
		!self.table.is_empty() ^ !self.function.is_empty()
	}
}

/// Parse a raw request path (path + optional query string) into `PathParts`.
///
/// This never fails: any input that doesn't look like a well-formed
/// `/rest/v1/...` path simply yields an empty `PathParts`.
pub fn parse_path(raw: &str) -> PathParts {
	let (path, query) = match raw.split_once('?') {
		Some((p, q)) => (p, Some(q)),
		None => (raw, None),
	};

	let Some(rest) = path.strip_prefix(REST_PREFIX) else {
		return PathParts::default();
	};
	let rest = rest.strip_prefix('/').unwrap_or(rest);

	let mut parts = PathParts::default();
	if let Some(func) = rest.strip_prefix(RPC_SEGMENT) {
		// only the first path segment after `rpc/` names the function
		parts.function = func.split('/').next().unwrap_or("").to_string();
	} else if !rest.is_empty() {
		parts.table = rest.split('/').next().unwrap_or("").to_string();
	}

	if let Some(query) = query {
		for pair in query.split('&') {
			let Some((key, value)) = pair.split_once('=') else {
				continue;
			};
			if key.is_empty() {
				continue;
			}
			if key == "select" {
				parts.columns = value
					.split(',')
					.filter(|c| !c.is_empty())
					.map(strip_cast)
					.collect();
			} else {
				// first-write-wins on duplicate keys
				parts.filters.entry(key.to_string()).or_insert_with(|| value.to_string());
			}
		}
	}

	parts
}

fn strip_cast(column: &str) -> String {
	match column.split_once("::") {
		Some((name, _cast)) => name.to_string(),
		None => column.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_table_route() {
		let p = parse_path("/rest/v1/items?select=id,name::text&limit=10");
		assert_eq!(p.table, "items");
		assert_eq!(p.function, "");
		assert_eq!(p.columns, vec!["id".to_string(), "name".to_string()]);
		assert_eq!(p.filters.get("limit"), Some(&"10".to_string()));
		assert!(p.is_scoped());
	}

	#[test]
	fn parses_function_route() {
		let p = parse_path("/rest/v1/rpc/recompute?x=1");
		assert_eq!(p.table, "");
		assert_eq!(p.function, "recompute");
		assert_eq!(p.filters.get("x"), Some(&"1".to_string()));
		assert!(p.is_scoped());
	}

	#[test]
	fn unscoped_root() {
		let p = parse_path("/rest/v1");
		assert_eq!(p.table, "");
		assert_eq!(p.function, "");
		assert!(!p.is_scoped());
	}

	#[test]
	fn malformed_never_fails() {
		let p = parse_path("not-a-path-at-all");
		assert_eq!(p, PathParts::default());
	}

	#[test]
	fn duplicate_filter_keys_first_write_wins() {
		let p = parse_path("/rest/v1/items?id=1&id=2");
		assert_eq!(p.filters.get("id"), Some(&"1".to_string()));
	}
}
