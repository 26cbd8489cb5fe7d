//! Maps an HTTP verb, plus an optional content-negotiation `Prefer` header,
//! onto the SQL verb the policy and counters are scoped by.

const MERGE_DUPLICATES: &str = "resolution=merge-duplicates";

/// Total over the five HTTP verbs PostgREST recognizes; anything else maps
/// to the empty string.
pub fn translate(http_verb: &str, prefer_header: &str) -> String {
	match http_verb {
		"GET" => "SELECT",
		"PATCH" => "UPDATE",
		"PUT" => "UPSERT",
		"DELETE" => "DELETE",
		"POST" => {
			if prefer_header == MERGE_DUPLICATES {
				"UPSERT"
			} else {
				"INSERT"
			}
		},
		_ => "",
	}
	.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_all_five_verbs() {
		assert_eq!(translate("GET", ""), "SELECT");
		assert_eq!(translate("PATCH", ""), "UPDATE");
		assert_eq!(translate("PUT", ""), "UPSERT");
		assert_eq!(translate("DELETE", ""), "DELETE");
		assert_eq!(translate("POST", ""), "INSERT");
	}

	#[test]
	fn post_with_merge_duplicates_is_upsert() {
		assert_eq!(translate("POST", MERGE_DUPLICATES), "UPSERT");
	}

	#[test]
	fn unknown_verb_is_empty() {
		assert_eq!(translate("HEAD", ""), "");
		assert_eq!(translate("", ""), "");
	}
}
