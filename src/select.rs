//! Selection expressions: which manifest indices a run should process.
//!
//! Grammar: comma-separated tokens, each a single positive integer or an
//! inclusive range `low-high`. Whitespace around tokens is ignored. An
//! empty expression means "all items".

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use crate::error::{Error, Result};

/// Resolves a selection expression against a manifest of `total` items.
///
/// The result is the de-duplicated, ascending set of selected indices.
///
/// # Errors
///
/// Returns [`Error::SelectionRange`] when a token is neither an integer nor
/// a range, when a range runs backwards (`low > high`), or when any
/// resolved index falls outside `[1, total]`.
pub fn resolve_selection(expr: &str, total: u32) -> Result<Vec<u32>> {
    if expr.trim().is_empty() {
        return Ok((1..=total).collect());
    }

    let mut selected = BTreeSet::new();
    for raw in expr.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            // Tolerate stray commas ("1,,3").
            continue;
        }
        if let Some((low, high)) = token.split_once('-') {
            let low = parse_index(low.trim(), token, total)?;
            let high = parse_index(high.trim(), token, total)?;
            if low > high {
                return Err(Error::SelectionRange {
                    token: token.to_string(),
                });
            }
            selected.extend(low..=high);
        } else {
            selected.insert(parse_index(token, token, total)?);
        }
    }
    Ok(selected.into_iter().collect())
}

/// Parses one index and bounds-checks it against `[1, total]`.
fn parse_index(text: &str, token: &str, total: u32) -> Result<u32> {
    let index: u32 = text.parse().map_err(|_| Error::SelectionRange {
        token: token.to_string(),
    })?;
    if index == 0 || index > total {
        return Err(Error::SelectionRange {
            token: token.to_string(),
        });
    }
    Ok(index)
}

/// Truncates an already-resolved selection to its first `limit` indices.
///
/// Applied after resolution, so it only changes how many indices are
/// processed, never which indices exist.
#[must_use]
pub fn apply_limit(mut selection: Vec<u32>, limit: Option<NonZeroUsize>) -> Vec<u32> {
    if let Some(limit) = limit {
        selection.truncate(limit.get());
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_expression_selects_all() {
        assert_eq!(resolve_selection("", 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(resolve_selection("   ", 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn singles_and_ranges_union_deduplicated_ascending() {
        assert_eq!(
            resolve_selection("5, 1-3, 2, 8-8", 10).unwrap(),
            vec![1, 2, 3, 5, 8]
        );
    }

    #[test]
    fn whitespace_and_stray_commas_tolerated() {
        assert_eq!(resolve_selection(" 2 , , 4 - 5 ", 6).unwrap(), vec![2, 4, 5]);
    }

    #[test]
    fn out_of_range_is_an_error_not_a_noop() {
        let err = resolve_selection("1,7", 5).unwrap_err();
        assert!(matches!(err, Error::SelectionRange { ref token } if token == "7"));

        let err = resolve_selection("3-9", 5).unwrap_err();
        assert!(matches!(err, Error::SelectionRange { ref token } if token == "3-9"));
    }

    #[test]
    fn zero_index_rejected() {
        assert!(resolve_selection("0", 5).is_err());
        assert!(resolve_selection("0-2", 5).is_err());
    }

    #[test]
    fn backwards_range_rejected() {
        let err = resolve_selection("4-2", 5).unwrap_err();
        assert!(matches!(err, Error::SelectionRange { ref token } if token == "4-2"));
    }

    #[test]
    fn malformed_tokens_rejected() {
        for bad in ["abc", "1..3", "2-", "-3", "1-2-3"] {
            assert!(resolve_selection(bad, 10).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn limit_truncates_after_resolution() {
        let sel = resolve_selection("1-6", 6).unwrap();
        let limited = apply_limit(sel, NonZeroUsize::new(3));
        assert_eq!(limited, vec![1, 2, 3]);

        let sel = resolve_selection("4-6", 6).unwrap();
        assert_eq!(apply_limit(sel.clone(), None), sel);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn resolved_sets_are_sorted_and_unique(
                indices in proptest::collection::vec(1u32..=50, 1..20)
            ) {
                let expr = indices
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let resolved = resolve_selection(&expr, 50).unwrap();
                let mut expected: Vec<u32> =
                    indices.iter().copied().collect::<std::collections::BTreeSet<_>>()
                        .into_iter().collect();
                expected.sort_unstable();
                prop_assert_eq!(resolved, expected);
            }

            #[test]
            fn ranges_resolve_to_exact_inclusive_span(low in 1u32..=30, span in 0u32..=20) {
                let high = low + span;
                let expr = format!("{low}-{high}");
                let resolved = resolve_selection(&expr, 50).unwrap();
                prop_assert_eq!(resolved, (low..=high).collect::<Vec<_>>());
            }
        }
    }
}
