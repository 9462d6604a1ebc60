//! Query fingerprints and cache keys.
//!
//! A fingerprint is the hex SHA-256 of the normalized query text followed by
//! a canonical rendering of its parameters. The digest is stable across
//! processes, so every instance sharing a remote tier derives the same key for
//! the same query.

use serde_json::Value;
use sha2::{Digest, Sha256};

const QUERY_PARAMS_SEPARATOR: &str = "::";
const PARAM_DELIMITER: &str = "|";

/// Collapse runs of whitespace, trim, and lowercase.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Render parameters deterministically as compact JSON joined by `|`.
///
/// Strings are JSON-quoted with escapes, so a delimiter or quote inside a
/// string never reads as a parameter boundary.
pub fn serialize_params(params: &[Value]) -> String {
    params
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(PARAM_DELIMITER)
}

/// Deterministic fingerprint of a (query, params) pair.
pub fn fingerprint(query: &str, params: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update(QUERY_PARAMS_SEPARATOR.as_bytes());
    hasher.update(serialize_params(params).as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key for a fingerprint under the given namespace prefix.
pub fn cache_key(prefix: &str, fingerprint: &str) -> String {
    format!("{prefix}{fingerprint}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn same_input_same_fingerprint() {
        let params = [json!(42), json!("open")];
        let first = fingerprint("SELECT * FROM workshops WHERE id = $1", &params);
        let second = fingerprint("SELECT * FROM workshops WHERE id = $1", &params);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn whitespace_and_case_do_not_matter() {
        let a = fingerprint("SELECT *\n  FROM   workshops ", &[]);
        let b = fingerprint("select * from workshops", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_params_differ() {
        let a = fingerprint("select * from enrollments where user_id = $1", &[json!(1)]);
        let b = fingerprint("select * from enrollments where user_id = $1", &[json!(2)]);
        assert_ne!(a, b);
    }

    #[test]
    fn string_and_number_params_differ() {
        let a = fingerprint("select $1", &[json!("1")]);
        let b = fingerprint("select $1", &[json!(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn params_are_rendered_with_delimiter() {
        let rendered = serialize_params(&[json!("a"), json!(1), json!(true), Value::Null]);
        assert_eq!(rendered, "\"a\"|1|true|null");
    }

    #[test]
    fn delimiters_inside_strings_do_not_split_params() {
        let joined = fingerprint("select $1", &[json!("a\"|\"b")]);
        let split = fingerprint("select $1", &[json!("a"), json!("b")]);
        assert_ne!(joined, split);

        assert_eq!(serialize_params(&[json!("a\"|\"b")]), r#""a\"|\"b""#);
        assert_ne!(
            serialize_params(&[json!("a|b")]),
            serialize_params(&[json!("a"), json!("b")])
        );
    }

    #[test]
    fn empty_query_has_its_own_fingerprint() {
        let empty = fingerprint("", &[]);
        assert_eq!(empty.len(), 64);
        assert_ne!(empty, fingerprint("select 1", &[]));
    }

    #[test]
    fn known_digest_is_stable_across_runs() {
        // sha256("select 1::")
        let mut hasher = Sha256::new();
        hasher.update(b"select 1::");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(fingerprint("  SELECT   1 ", &[]), expected);
    }

    #[test]
    fn key_is_prefixed_fingerprint() {
        assert_eq!(cache_key("query_cache:", "abc"), "query_cache:abc");
    }
}
