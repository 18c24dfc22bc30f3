//! Text similarity metrics and safe diff rendering.
//!
//! This crate provides the pure-text half of change detection:
//! - Jaccard similarity over lowercased word sets
//! - A normalized edit-distance ratio (character-level Levenshtein for
//!   short texts, line-level diff ratio beyond a size cutoff)
//! - Structure-signature agreement for DOM skeletons
//! - The composite score and its classification bands
//! - A bounded, markdown-safe unified diff
//!
//! # Example
//!
//! ```
//! use sitewatch_diff::{compare, classify, ChangeType};
//!
//! let old = "The quick brown fox jumps over the lazy dog";
//! let new = "The quick brown fox leaps over the lazy dog";
//! let metrics = compare(old, new, "p:1", "p:1");
//!
//! // A one-word tweak stays above the default threshold: no alert.
//! assert!(metrics.final_score >= 0.85);
//! assert_eq!(classify(metrics.final_score, 0.85), None);
//!
//! let metrics = compare("apples and oranges", "stock market report", "p:1", "p:2");
//! assert_eq!(classify(metrics.final_score, 0.85), Some(ChangeType::MajorOverhaul));
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

/// Weight of the Jaccard component in the composite score.
pub const JACCARD_WEIGHT: f64 = 0.4;

/// Weight of the edit-distance component in the composite score.
pub const EDIT_WEIGHT: f64 = 0.4;

/// Weight of the structure-agreement component in the composite score.
pub const STRUCTURE_WEIGHT: f64 = 0.2;

/// Scores at or above this (but below the alert threshold) classify as a UI tweak.
pub const UI_TWEAK_FLOOR: f64 = 0.70;

/// Scores at or above this (but below [`UI_TWEAK_FLOOR`]) classify as a content update.
pub const CONTENT_UPDATE_FLOOR: f64 = 0.30;

/// Diffs at or below this many characters are returned untruncated.
pub const DIFF_LIMIT: usize = 3000;

/// Characters kept from the head of an oversized diff.
pub const DIFF_KEEP: usize = 2800;

/// Texts longer than this (in chars) skip character-level Levenshtein and
/// fall back to a line-level diff ratio.
const LEVENSHTEIN_MAX_CHARS: usize = 4096;

/// Classification of a meaningful change, from mildest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Cosmetic reshuffle; the page is still recognisably the same.
    UiTweak,
    /// Substantial content replacement within the same page structure.
    ContentUpdate,
    /// The page no longer resembles its previous self.
    MajorOverhaul,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::UiTweak => write!(f, "UI_TWEAK"),
            ChangeType::ContentUpdate => write!(f, "CONTENT_UPDATE"),
            ChangeType::MajorOverhaul => write!(f, "MAJOR_OVERHAUL"),
        }
    }
}

/// The individual similarity metrics plus their weighted composite.
///
/// Persisted inside forensic snapshots so a replay can compare
/// component-wise, not just by the final score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMetrics {
    /// Word-set overlap in [0, 1].
    pub jaccard: f64,
    /// Normalized edit-distance ratio in [0, 1].
    pub levenshtein_ratio: f64,
    /// Structure-signature agreement in [0, 1].
    pub semantic: f64,
    /// `0.4 * jaccard + 0.4 * levenshtein_ratio + 0.2 * semantic`.
    #[serde(rename = "final")]
    pub final_score: f64,
}

/// Compute all similarity metrics between two filtered texts and their
/// structure signatures.
pub fn compare(old_text: &str, new_text: &str, old_sig: &str, new_sig: &str) -> SimilarityMetrics {
    let jaccard = jaccard(old_text, new_text);
    let levenshtein_ratio = edit_ratio(old_text, new_text);
    let semantic = structure_agreement(old_sig, new_sig);
    let final_score =
        JACCARD_WEIGHT * jaccard + EDIT_WEIGHT * levenshtein_ratio + STRUCTURE_WEIGHT * semantic;
    SimilarityMetrics {
        jaccard,
        levenshtein_ratio,
        semantic,
        final_score,
    }
}

/// Apply the decision rule: `None` when the score clears the alert
/// threshold, otherwise the classification band. Band boundaries are
/// inclusive on the lower side.
pub fn classify(final_score: f64, threshold: f64) -> Option<ChangeType> {
    if final_score >= threshold {
        return None;
    }
    if final_score >= UI_TWEAK_FLOOR {
        Some(ChangeType::UiTweak)
    } else if final_score >= CONTENT_UPDATE_FLOOR {
        Some(ChangeType::ContentUpdate)
    } else {
        Some(ChangeType::MajorOverhaul)
    }
}

/// Jaccard similarity over lowercased whitespace-split token sets.
///
/// Two empty texts are identical (1.0); one empty side shares nothing (0.0).
pub fn jaccard(old_text: &str, new_text: &str) -> f64 {
    let old_set: HashSet<String> = old_text
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    let new_set: HashSet<String> = new_text
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    if old_set.is_empty() && new_set.is_empty() {
        return 1.0;
    }
    let intersection = old_set.intersection(&new_set).count();
    let union = old_set.union(&new_set).count();
    intersection as f64 / union as f64
}

/// Normalized edit-distance ratio in [0, 1].
///
/// Character-level Levenshtein (`1 - distance / max_len`) when both texts
/// fit the size cutoff; beyond it, a line-level diff ratio from the same
/// family (twice the matched length over the total length).
pub fn edit_ratio(old_text: &str, new_text: &str) -> f64 {
    if old_text.is_empty() && new_text.is_empty() {
        return 1.0;
    }
    let old_len = old_text.chars().count();
    let new_len = new_text.chars().count();
    if old_len.max(new_len) <= LEVENSHTEIN_MAX_CHARS {
        let distance = levenshtein(old_text, new_text);
        return 1.0 - distance as f64 / old_len.max(new_len) as f64;
    }
    f64::from(TextDiff::from_lines(old_text, new_text).ratio())
}

/// Classic two-row Levenshtein distance over characters.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Agreement between two structure signatures in [0, 1].
///
/// Signatures are comma-separated `tag:count` summaries; agreement is the
/// weighted overlap `sum(min) / sum(max)` over the union of tags. Two empty
/// signatures agree fully.
pub fn structure_agreement(old_sig: &str, new_sig: &str) -> f64 {
    let old_counts = parse_signature(old_sig);
    let new_counts = parse_signature(new_sig);

    if old_counts.is_empty() && new_counts.is_empty() {
        return 1.0;
    }

    let tags: HashSet<&str> = old_counts
        .iter()
        .map(|(t, _)| *t)
        .chain(new_counts.iter().map(|(t, _)| *t))
        .collect();

    let mut min_sum = 0u64;
    let mut max_sum = 0u64;
    for tag in tags {
        let a = lookup(&old_counts, tag);
        let b = lookup(&new_counts, tag);
        min_sum += a.min(b);
        max_sum += a.max(b);
    }
    if max_sum == 0 {
        return 1.0;
    }
    min_sum as f64 / max_sum as f64
}

fn parse_signature(sig: &str) -> Vec<(&str, u64)> {
    sig.split(',')
        .filter_map(|part| {
            let (tag, count) = part.split_once(':')?;
            let tag = tag.trim();
            if tag.is_empty() {
                return None;
            }
            Some((tag, count.trim().parse().unwrap_or(1)))
        })
        .collect()
}

fn lookup(counts: &[(&str, u64)], tag: &str) -> u64 {
    counts
        .iter()
        .find(|(t, _)| *t == tag)
        .map(|(_, c)| *c)
        .unwrap_or(0)
}

/// A rendered diff bounded for delivery through a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeDiff {
    /// Markdown-ish `+`/`-` line diff, possibly truncated.
    pub text: String,
    /// Whether the rendered text was cut at [`DIFF_KEEP`] characters.
    pub truncated: bool,
    /// Lines present only in the new text.
    pub lines_added: usize,
    /// Lines present only in the old text.
    pub lines_removed: usize,
}

impl SafeDiff {
    /// One-line human summary of the line-count delta.
    pub fn summary(&self) -> String {
        if self.lines_added > self.lines_removed {
            format!("+{} lines added", self.lines_added - self.lines_removed)
        } else if self.lines_removed > self.lines_added {
            format!("{} lines removed", self.lines_removed - self.lines_added)
        } else {
            format!("{} lines modified", self.lines_added)
        }
    }
}

/// Produce a unified `+`/`-` line diff of the two texts, truncated to stay
/// deliverable.
///
/// Diffs up to [`DIFF_LIMIT`] characters are returned whole. Longer diffs
/// keep the first [`DIFF_KEEP`] characters, then a warning line carrying the
/// full length, then the line-count summary.
pub fn safe_diff(old_text: &str, new_text: &str) -> SafeDiff {
    let diff = TextDiff::from_lines(old_text, new_text);

    let mut rendered = String::new();
    let mut lines_added = 0usize;
    let mut lines_removed = 0usize;
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => {
                lines_removed += 1;
                "- "
            }
            ChangeTag::Insert => {
                lines_added += 1;
                "+ "
            }
            ChangeTag::Equal => continue,
        };
        rendered.push_str(sign);
        rendered.push_str(change.value().trim_end_matches('\n'));
        rendered.push('\n');
    }
    let rendered = rendered.trim_end_matches('\n').to_string();

    if rendered.chars().count() <= DIFF_LIMIT {
        return SafeDiff {
            text: rendered,
            truncated: false,
            lines_added,
            lines_removed,
        };
    }

    let full_len = rendered.chars().count();
    let mut text: String = rendered.chars().take(DIFF_KEEP).collect();
    let partial = SafeDiff {
        text: String::new(),
        truncated: true,
        lines_added,
        lines_removed,
    };
    text.push_str(&format!(
        "\n… diff truncated ({full_len} characters total)\n{}",
        partial.summary()
    ));

    SafeDiff {
        text,
        truncated: true,
        lines_added,
        lines_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jaccard_identical_texts_is_one() {
        assert_eq!(jaccard("hello world", "hello world"), 1.0);
    }

    #[test]
    fn jaccard_is_case_insensitive() {
        assert_eq!(jaccard("Hello World", "hello world"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_texts_is_zero() {
        assert_eq!(jaccard("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn jaccard_both_empty_is_one() {
        assert_eq!(jaccard("", ""), 1.0);
    }

    #[test]
    fn jaccard_one_empty_is_zero() {
        assert_eq!(jaccard("something", ""), 0.0);
    }

    #[test]
    fn levenshtein_counts_substitutions() {
        assert_eq!(levenshtein("jumps", "leaps"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn edit_ratio_identical_is_one() {
        assert_eq!(edit_ratio("same text", "same text"), 1.0);
        assert_eq!(edit_ratio("", ""), 1.0);
    }

    #[test]
    fn edit_ratio_single_word_change_stays_high() {
        let old = "The quick brown fox jumps over the lazy dog";
        let new = "The quick brown fox leaps over the lazy dog";
        let ratio = edit_ratio(old, new);
        assert!(ratio > 0.9, "ratio {ratio} too low");
    }

    #[test]
    fn edit_ratio_large_texts_use_line_fallback() {
        let old = "line one\n".repeat(1000);
        let new = "line one\n".repeat(999) + "line two\n";
        let ratio = edit_ratio(&old, &new);
        assert!(ratio > 0.99, "ratio {ratio} too low");
    }

    #[test]
    fn structure_agreement_identical_is_one() {
        assert_eq!(structure_agreement("article:2,p:10", "article:2,p:10"), 1.0);
    }

    #[test]
    fn structure_agreement_disjoint_is_zero() {
        assert_eq!(structure_agreement("nav:1", "footer:1"), 0.0);
    }

    #[test]
    fn structure_agreement_partial_overlap() {
        // min(2,1) + min(10,10) = 11; max(2,1) + max(10,10) = 12
        let agreement = structure_agreement("article:2,p:10", "article:1,p:10");
        assert!((agreement - 11.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn structure_agreement_both_empty_is_one() {
        assert_eq!(structure_agreement("", ""), 1.0);
    }

    #[test]
    fn compare_weights_components() {
        let metrics = compare("a b c", "a b c", "p:1", "p:1");
        assert_eq!(metrics.final_score, 1.0);

        let metrics = compare("a b", "c d", "p:1", "div:1");
        assert_eq!(metrics.final_score, 0.0);
    }

    #[test]
    fn classify_above_threshold_is_none() {
        assert_eq!(classify(0.85, 0.85), None);
        assert_eq!(classify(0.99, 0.85), None);
    }

    #[test]
    fn classify_bands_are_inclusive_on_lower_side() {
        assert_eq!(classify(0.70, 0.85), Some(ChangeType::UiTweak));
        assert_eq!(classify(0.84, 0.85), Some(ChangeType::UiTweak));
        assert_eq!(classify(0.30, 0.85), Some(ChangeType::ContentUpdate));
        assert_eq!(classify(0.69, 0.85), Some(ChangeType::ContentUpdate));
        assert_eq!(classify(0.29, 0.85), Some(ChangeType::MajorOverhaul));
        assert_eq!(classify(0.0, 0.85), Some(ChangeType::MajorOverhaul));
    }

    #[test]
    fn classify_respects_custom_threshold() {
        // With a lax threshold, a 0.72 score is no longer an alert.
        assert_eq!(classify(0.72, 0.70), None);
        // With a strict threshold, even 0.95 alerts as a UI tweak.
        assert_eq!(classify(0.95, 0.99), Some(ChangeType::UiTweak));
    }

    #[test]
    fn change_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&ChangeType::MajorOverhaul).expect("serialize");
        assert_eq!(json, "\"MAJOR_OVERHAUL\"");
        assert_eq!(ChangeType::UiTweak.to_string(), "UI_TWEAK");
    }

    #[test]
    fn similarity_metrics_final_field_renamed() {
        let metrics = SimilarityMetrics {
            jaccard: 0.5,
            levenshtein_ratio: 0.5,
            semantic: 0.5,
            final_score: 0.5,
        };
        let json = serde_json::to_string(&metrics).expect("serialize");
        assert!(json.contains("\"final\":0.5"));
    }

    #[test]
    fn safe_diff_reports_changed_lines_only() {
        let diff = safe_diff("a\nb\nc", "a\nx\nc");
        assert_eq!(diff.text, "- b\n+ x");
        assert!(!diff.truncated);
        assert_eq!(diff.lines_added, 1);
        assert_eq!(diff.lines_removed, 1);
    }

    #[test]
    fn safe_diff_identical_texts_is_empty() {
        let diff = safe_diff("same\ntext", "same\ntext");
        assert_eq!(diff.text, "");
        assert!(!diff.truncated);
    }

    /// A one-line-each replacement renders as `- old\n+ new`:
    /// `2 + old_len + 1 + 2 + new_len` characters total.
    fn replacement_diff(old_len: usize, new_len: usize) -> SafeDiff {
        safe_diff(&"x".repeat(old_len), &"y".repeat(new_len))
    }

    #[test]
    fn safe_diff_at_exactly_limit_is_untruncated() {
        let diff = replacement_diff(1500, DIFF_LIMIT - 5 - 1500);
        assert_eq!(diff.text.chars().count(), DIFF_LIMIT);
        assert!(!diff.truncated);
    }

    #[test]
    fn safe_diff_one_past_limit_truncates_with_summary() {
        let diff = replacement_diff(1500, DIFF_LIMIT - 5 - 1500 + 1);
        assert!(diff.truncated);
        assert!(diff.text.contains("diff truncated"));
        assert!(diff.text.contains(&format!("{} characters total", DIFF_LIMIT + 1)));
        assert!(diff.text.contains("1 lines modified"));
        assert!(diff.text.starts_with("- xxx"));
        // The kept head plus the warning tail stays deliverable.
        assert!(diff.text.chars().count() <= DIFF_KEEP + 120);
    }

    #[test]
    fn safe_diff_summary_prefers_net_delta() {
        let added = SafeDiff {
            text: String::new(),
            truncated: false,
            lines_added: 5,
            lines_removed: 2,
        };
        assert_eq!(added.summary(), "+3 lines added");

        let removed = SafeDiff {
            text: String::new(),
            truncated: false,
            lines_added: 1,
            lines_removed: 4,
        };
        assert_eq!(removed.summary(), "3 lines removed");

        let modified = SafeDiff {
            text: String::new(),
            truncated: false,
            lines_added: 3,
            lines_removed: 3,
        };
        assert_eq!(modified.summary(), "3 lines modified");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn jaccard_stays_in_unit_interval(a in ".{0,200}", b in ".{0,200}") {
                let j = jaccard(&a, &b);
                prop_assert!((0.0..=1.0).contains(&j));
            }

            #[test]
            fn edit_ratio_stays_in_unit_interval(a in ".{0,300}", b in ".{0,300}") {
                let r = edit_ratio(&a, &b);
                prop_assert!((0.0..=1.0).contains(&r));
            }

            #[test]
            fn composite_is_symmetric_bounded(a in "[a-z ]{0,120}", b in "[a-z ]{0,120}") {
                let ab = compare(&a, &b, "", "");
                let ba = compare(&b, &a, "", "");
                prop_assert!((ab.final_score - ba.final_score).abs() < 1e-9);
                prop_assert!((0.0..=1.0).contains(&ab.final_score));
            }

            #[test]
            fn truncated_diffs_never_exceed_the_keep_limit(
                a in proptest::collection::vec("[a-z]{0,40}", 0..200),
                b in proptest::collection::vec("[a-z]{0,40}", 0..200),
            ) {
                let diff = safe_diff(&a.join("\n"), &b.join("\n"));
                if diff.truncated {
                    // Head + warning + summary stays comfortably deliverable.
                    prop_assert!(diff.text.chars().count() <= DIFF_KEEP + 120);
                } else {
                    prop_assert!(diff.text.chars().count() <= DIFF_LIMIT);
                }
            }
        }
    }
}
