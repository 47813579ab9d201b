//! Filter compiler — structural validation.
//!
//! Compilation never transforms the expression; it walks the tree and
//! rejects shapes the runtime cannot evaluate. Regex patterns are
//! compile-tested here so evaluation can assume they build.

use regex::RegexBuilder;

use crate::errors::FilterCompileError;
use crate::expr::{ErrorPolicy, FilterExpr};

/// Sanity cap on retry attempts.
const MAX_RETRIES: u32 = 10;
/// Sanity cap on retry base delay.
const MAX_BASE_DELAY_MS: u64 = 60_000;

/// Validate an expression. Returns the borrowed expression on success so
/// call sites can chain straight into evaluation.
pub fn compile(expr: &FilterExpr) -> Result<&FilterExpr, FilterCompileError> {
    validate(expr)?;
    Ok(expr)
}

/// True iff any sub-expression requires external I/O to evaluate.
///
/// Pure expressions are the only ones allowed in `EventTime` derivation.
pub fn is_effectful(expr: &FilterExpr) -> bool {
    match expr {
        FilterExpr::HasValidLinks { .. } | FilterExpr::Trending { .. } | FilterExpr::Llm { .. } => {
            true
        }
        FilterExpr::LinkContains { check_resolved, .. }
        | FilterExpr::LinkRegex { check_resolved, .. } => *check_resolved,
        _ => expr.children().into_iter().any(is_effectful),
    }
}

fn validate(expr: &FilterExpr) -> Result<(), FilterCompileError> {
    match expr {
        FilterExpr::And { left, right } | FilterExpr::Or { left, right } => {
            validate(left)?;
            validate(right)
        }
        FilterExpr::Not { expr } => validate(expr),
        FilterExpr::AuthorIn { handles } => {
            non_empty_list("AuthorIn.handles", handles.len())
        }
        FilterExpr::HashtagIn { tags } => non_empty_list("HashtagIn.tags", tags.len()),
        FilterExpr::Contains { text, .. } => non_empty_text("Contains.text", text),
        FilterExpr::Engagement {
            min_likes,
            min_reposts,
            min_replies,
        } => {
            if min_likes.is_none() && min_reposts.is_none() && min_replies.is_none() {
                return Err(FilterCompileError::new(
                    "Engagement requires at least one threshold",
                ));
            }
            Ok(())
        }
        FilterExpr::MinImages { min } => {
            if *min < 1 {
                return Err(FilterCompileError::new("MinImages.min must be >= 1"));
            }
            Ok(())
        }
        FilterExpr::AltText { text } => non_empty_text("AltText.text", text),
        FilterExpr::AltTextRegex { pattern, flags } => check_regex(pattern, flags.as_deref()),
        FilterExpr::Language { langs } => {
            non_empty_list("Language.langs", langs.len())?;
            if langs.iter().any(|l| l.trim().is_empty()) {
                return Err(FilterCompileError::new("Language.langs contains an empty tag"));
            }
            Ok(())
        }
        FilterExpr::Regex { patterns, flags } => {
            non_empty_list("Regex.patterns", patterns.len())?;
            for pattern in patterns {
                check_regex(pattern, flags.as_deref())?;
            }
            Ok(())
        }
        FilterExpr::DateRange { start, end } => {
            if start >= end {
                return Err(FilterCompileError::new(
                    "DateRange.start must be strictly before DateRange.end",
                ));
            }
            Ok(())
        }
        FilterExpr::HasValidLinks { on_error } | FilterExpr::Trending { on_error, .. } => {
            check_policy(on_error)
        }
        FilterExpr::LinkContains { text, on_error, .. } => {
            non_empty_text("LinkContains.text", text)?;
            check_policy(on_error)
        }
        FilterExpr::LinkRegex {
            patterns,
            flags,
            on_error,
            ..
        } => {
            non_empty_list("LinkRegex.patterns", patterns.len())?;
            for pattern in patterns {
                check_regex(pattern, flags.as_deref())?;
            }
            check_policy(on_error)
        }
        FilterExpr::Llm {
            prompt,
            min_confidence,
            on_error,
        } => {
            non_empty_text("Llm.prompt", prompt)?;
            if !(0.0..=1.0).contains(min_confidence) || min_confidence.is_nan() {
                return Err(FilterCompileError::new(
                    "Llm.minConfidence must be within [0, 1]",
                ));
            }
            check_policy(on_error)
        }
        // Unit predicates and single-value predicates whose payloads are
        // validated newtypes have nothing left to check.
        _ => Ok(()),
    }
}

fn non_empty_list(what: &str, len: usize) -> Result<(), FilterCompileError> {
    if len == 0 {
        return Err(FilterCompileError::new(format!("{what} must not be empty")));
    }
    Ok(())
}

fn non_empty_text(what: &str, text: &str) -> Result<(), FilterCompileError> {
    if text.is_empty() {
        return Err(FilterCompileError::new(format!("{what} must not be empty")));
    }
    Ok(())
}

fn check_policy(policy: &ErrorPolicy) -> Result<(), FilterCompileError> {
    if let ErrorPolicy::Retry {
        max_retries,
        base_delay_ms,
    } = policy
    {
        if *max_retries > MAX_RETRIES {
            return Err(FilterCompileError::new(format!(
                "Retry.maxRetries must be <= {MAX_RETRIES}"
            )));
        }
        if *base_delay_ms > MAX_BASE_DELAY_MS {
            return Err(FilterCompileError::new(format!(
                "Retry.baseDelayMs must be <= {MAX_BASE_DELAY_MS}"
            )));
        }
    }
    Ok(())
}

/// Build a regex from a pattern and flag string (`i`, `m`, `s`, `x`).
///
/// Shared with the runtime so compile-time acceptance matches eval-time
/// behavior exactly.
pub(crate) fn build_regex(
    pattern: &str,
    flags: Option<&str>,
) -> Result<regex::Regex, FilterCompileError> {
    let mut builder = RegexBuilder::new(pattern);
    if let Some(flags) = flags {
        for flag in flags.chars() {
            match flag {
                'i' => {
                    let _ = builder.case_insensitive(true);
                }
                'm' => {
                    let _ = builder.multi_line(true);
                }
                's' => {
                    let _ = builder.dot_matches_new_line(true);
                }
                'x' => {
                    let _ = builder.ignore_whitespace(true);
                }
                other => {
                    return Err(FilterCompileError::new(format!(
                        "unsupported regex flag {other:?} (supported: i, m, s, x)"
                    )));
                }
            }
        }
    }
    builder
        .build()
        .map_err(|e| FilterCompileError::new(format!("invalid regex {pattern:?}: {e}")))
}

fn check_regex(pattern: &str, flags: Option<&str>) -> Result<(), FilterCompileError> {
    let _ = build_regex(pattern, flags)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use skygent_core::ids::Hashtag;

    #[test]
    fn accepts_well_formed_expressions() {
        let expr = FilterExpr::and(
            FilterExpr::HashtagIn {
                tags: vec![Hashtag::new("#rust").unwrap()],
            },
            FilterExpr::or(
                FilterExpr::IsOriginal,
                FilterExpr::Regex {
                    patterns: vec!["(?i)tokio".into()],
                    flags: None,
                },
            ),
        );
        assert!(compile(&expr).is_ok());
    }

    #[test]
    fn rejects_empty_lists() {
        assert!(compile(&FilterExpr::AuthorIn { handles: vec![] }).is_err());
        assert!(compile(&FilterExpr::HashtagIn { tags: vec![] }).is_err());
        assert!(compile(&FilterExpr::Regex {
            patterns: vec![],
            flags: None
        })
        .is_err());
        assert!(compile(&FilterExpr::Language { langs: vec![] }).is_err());
    }

    #[test]
    fn rejects_empty_text() {
        assert!(compile(&FilterExpr::Contains {
            text: String::new(),
            case_sensitive: None
        })
        .is_err());
        assert!(compile(&FilterExpr::AltText {
            text: String::new()
        })
        .is_err());
    }

    #[test]
    fn rejects_invalid_regex() {
        let err = compile(&FilterExpr::Regex {
            patterns: vec!["(unclosed".into()],
            flags: None,
        })
        .unwrap_err();
        assert!(err.message.contains("invalid regex"));
    }

    #[test]
    fn rejects_unknown_regex_flag() {
        assert!(compile(&FilterExpr::Regex {
            patterns: vec!["ok".into()],
            flags: Some("iz".into()),
        })
        .is_err());
    }

    #[test]
    fn rejects_engagement_without_thresholds() {
        assert!(compile(&FilterExpr::Engagement {
            min_likes: None,
            min_reposts: None,
            min_replies: None
        })
        .is_err());
    }

    #[test]
    fn rejects_degenerate_date_range() {
        let t: skygent_core::Timestamp = "2026-01-01T00:00:00Z".parse().unwrap();
        assert!(compile(&FilterExpr::DateRange { start: t, end: t }).is_err());
        assert!(compile(&FilterExpr::DateRange {
            start: "2026-02-01T00:00:00Z".parse().unwrap(),
            end: t
        })
        .is_err());
    }

    #[test]
    fn rejects_llm_confidence_out_of_range() {
        for bad in [-0.1, 1.1, f64::NAN] {
            assert!(compile(&FilterExpr::Llm {
                prompt: "about databases".into(),
                min_confidence: bad,
                on_error: ErrorPolicy::Exclude,
            })
            .is_err());
        }
    }

    #[test]
    fn rejects_absurd_retry_parameters() {
        assert!(compile(&FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Retry {
                max_retries: 99,
                base_delay_ms: 0
            }
        })
        .is_err());
    }

    #[test]
    fn rejects_min_images_zero() {
        assert!(compile(&FilterExpr::MinImages { min: 0 }).is_err());
    }

    #[test]
    fn nested_errors_surface() {
        let expr = FilterExpr::not(FilterExpr::and(
            FilterExpr::All,
            FilterExpr::Contains {
                text: String::new(),
                case_sensitive: None,
            },
        ));
        assert!(compile(&expr).is_err());
    }

    #[test]
    fn effectfulness_detection() {
        assert!(!is_effectful(&FilterExpr::All));
        assert!(!is_effectful(&FilterExpr::and(
            FilterExpr::IsReply,
            FilterExpr::HasImages
        )));
        assert!(is_effectful(&FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Include
        }));
        assert!(is_effectful(&FilterExpr::not(FilterExpr::Llm {
            prompt: "p".into(),
            min_confidence: 0.5,
            on_error: ErrorPolicy::Exclude,
        })));
        // Link predicates are pure unless they resolve over the network.
        assert!(!is_effectful(&FilterExpr::LinkContains {
            text: "youtube".into(),
            case_sensitive: None,
            check_resolved: false,
            on_error: ErrorPolicy::Exclude,
        }));
        assert!(is_effectful(&FilterExpr::LinkContains {
            text: "youtube".into(),
            case_sensitive: None,
            check_resolved: true,
            on_error: ErrorPolicy::Exclude,
        }));
        assert!(!is_effectful(&FilterExpr::Hashtag {
            tag: Hashtag::new("#rust").unwrap()
        }));
    }
}
