//! Canonical filter signatures.
//!
//! The signature pins the exact filter expression used by a sync or
//! derivation run: checkpoints and lineage records compare signatures to
//! detect filter changes. Two structurally equal expressions MUST hash
//! identically regardless of JSON object key order, so the encoder emits
//! object keys sorted before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::expr::FilterExpr;

/// Canonical JSON encoding: object keys sorted, no whitespace, arrays in
/// declaration order.
pub fn canonical_json(expr: &FilterExpr) -> String {
    let value = serde_json::to_value(expr).unwrap_or(Value::Null);
    let mut out = String::new();
    write_canonical(&value, &mut out);
    out
}

/// SHA-256 of the canonical encoding, lowercase hex.
pub fn filter_signature(expr: &FilterExpr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(expr).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain identifiers but go through the JSON string
                // encoder anyway so escaping stays uniform.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::expr::ErrorPolicy;
    use skygent_core::ids::{Handle, Hashtag};

    fn sample() -> FilterExpr {
        FilterExpr::and(
            FilterExpr::AuthorIn {
                handles: vec![
                    Handle::new("alice.test").unwrap(),
                    Handle::new("bob.test").unwrap(),
                ],
            },
            FilterExpr::Trending {
                tag: Hashtag::new("#rust").unwrap(),
                on_error: ErrorPolicy::Retry {
                    max_retries: 1,
                    base_delay_ms: 50,
                },
            },
        )
    }

    #[test]
    fn signature_is_deterministic() {
        assert_eq!(filter_signature(&sample()), filter_signature(&sample()));
        assert_eq!(filter_signature(&sample()).len(), 64);
    }

    #[test]
    fn structurally_different_expressions_differ() {
        let a = FilterExpr::Contains {
            text: "rust".into(),
            case_sensitive: None,
        };
        let b = FilterExpr::Contains {
            text: "rust".into(),
            case_sensitive: Some(false),
        };
        // `None` and `Some(false)` behave the same at eval time but are
        // different structures, so they pin different signatures.
        assert_ne!(filter_signature(&a), filter_signature(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = FilterExpr::AuthorIn {
            handles: vec![
                Handle::new("alice.test").unwrap(),
                Handle::new("bob.test").unwrap(),
            ],
        };
        let b = FilterExpr::AuthorIn {
            handles: vec![
                Handle::new("bob.test").unwrap(),
                Handle::new("alice.test").unwrap(),
            ],
        };
        assert_ne!(filter_signature(&a), filter_signature(&b));
    }

    #[test]
    fn key_order_is_not_significant() {
        // Build the same expression from two JSON spellings with different
        // member order; both must decode to the same AST and hash equal.
        let a: FilterExpr = serde_json::from_str(
            r#"{"_tag":"Engagement","minLikes":5,"minReposts":2}"#,
        )
        .unwrap();
        let b: FilterExpr = serde_json::from_str(
            r#"{"minReposts":2,"_tag":"Engagement","minLikes":5}"#,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(filter_signature(&a), filter_signature(&b));
    }

    #[test]
    fn canonical_encoding_sorts_keys() {
        let expr = FilterExpr::Engagement {
            min_likes: Some(5),
            min_reposts: Some(2),
            min_replies: None,
        };
        let canonical = canonical_json(&expr);
        assert_eq!(
            canonical,
            r#"{"_tag":"Engagement","minLikes":5,"minReposts":2}"#
        );
    }
}
