//! Three-way line merge.
//!
//! The remote's changes since the base are diffed, cut into context
//! patches and replayed onto the local text. Wide context margins are
//! tried first; narrower ones tolerate more local drift. Every candidate
//! result must still contain each line the local side added relative to
//! the base, otherwise it is rejected.

mod diff;
mod encode;
mod patch;

pub use diff::{diff, DiffOp};
pub use encode::{encode_three, EncodedTriple, LineAlphabet};
pub use patch::{apply_all, make_hunks, Hunk, Patcher};

use std::collections::HashSet;
use tracing::debug;

/// How a merge result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// One side is unchanged or both sides agree.
    Trivial,
    /// Every hunk applied with this context margin.
    Margin(usize),
    /// Hunks applied one at a time; some were dropped.
    PerHunk { applied: usize, total: usize },
}

/// A validated merge result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub text: String,
    pub strategy: MergeStrategy,
}

/// Merge `local` and `remote` against their common `base`.
///
/// Returns None when no result preserving every local addition exists.
/// An empty base never merges. The same inputs always give the same output.
pub fn three_way_merge(
    base: &str,
    local: &str,
    remote: &str,
    margins: &[usize],
) -> Option<MergeResult> {
    if base.is_empty() {
        return None;
    }
    if local == remote || remote == base {
        return Some(trivial(local));
    }
    if local == base {
        return Some(trivial(remote));
    }

    let triple = encode_three(base, local, remote);
    let ops = diff(&triple.base, &triple.remote);

    for &margin in margins {
        let hunks = make_hunks(&ops, margin);
        let Some(symbols) = apply_all(&triple.local, &hunks) else {
            debug!(margin, "Patch did not apply");
            continue;
        };
        let text = triple.alphabet.decode(&symbols);
        if preserves_local_additions(base, local, &text) {
            return Some(MergeResult {
                text,
                strategy: MergeStrategy::Margin(margin),
            });
        }
        debug!(margin, "Merge dropped a local line, trying narrower context");
    }

    per_hunk(&triple, &ops, margins.last().copied().unwrap_or(0), base, local)
}

fn trivial(text: &str) -> MergeResult {
    MergeResult {
        text: text.to_string(),
        strategy: MergeStrategy::Trivial,
    }
}

fn per_hunk(
    triple: &EncodedTriple,
    ops: &[DiffOp],
    margin: usize,
    base: &str,
    local: &str,
) -> Option<MergeResult> {
    let hunks = make_hunks(ops, margin);
    let mut patcher = Patcher::new(&triple.local);
    let mut applied = 0;

    for hunk in &hunks {
        let mut attempt = patcher.clone();
        if !attempt.apply(hunk) {
            continue;
        }
        let text = triple.alphabet.decode(attempt.result());
        if preserves_local_additions(base, local, &text) {
            patcher = attempt;
            applied += 1;
        }
    }

    if applied == 0 {
        return None;
    }
    debug!(applied, total = hunks.len(), "Merged with per-hunk fallback");
    Some(MergeResult {
        text: triple.alphabet.decode(patcher.result()),
        strategy: MergeStrategy::PerHunk {
            applied,
            total: hunks.len(),
        },
    })
}

/// Whether every line present in `local` but absent from `base` also
/// appears in `merged`.
pub fn preserves_local_additions(base: &str, local: &str, merged: &str) -> bool {
    let base_lines: HashSet<&str> = base.lines().collect();
    let merged_lines: HashSet<&str> = merged.lines().collect();
    local
        .lines()
        .filter(|line| !base_lines.contains(line))
        .all(|line| merged_lines.contains(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MARGINS: &[usize] = &[4, 2, 1];

    #[test]
    fn test_local_edit_plus_remote_append() {
        let result = three_way_merge("A\nB\nC\n", "A\nB2\nC\n", "A\nB\nC\nD\n", MARGINS).unwrap();
        assert_eq!(result.text, "A\nB2\nC\nD\n");
        assert_eq!(result.strategy, MergeStrategy::Margin(1));
    }

    #[test]
    fn test_nearby_edits_need_narrow_margin() {
        let base = "1\n2\n3\n4\n5\n6\n";
        let local = "1\nL\n3\n4\n5\n6\n";
        let remote = "1\n2\n3\nR\n5\n6\n";
        let result = three_way_merge(base, local, remote, MARGINS).unwrap();
        assert_eq!(result.text, "1\nL\n3\nR\n5\n6\n");
        assert_eq!(result.strategy, MergeStrategy::Margin(1));
    }

    #[test]
    fn test_far_apart_edits_use_widest_margin() {
        let base: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let local = base.replace("line 3\n", "local 3\n");
        let remote = base.replace("line 25\n", "remote 25\n");
        let result = three_way_merge(&base, &local, &remote, MARGINS).unwrap();
        assert!(result.text.contains("local 3\n"));
        assert!(result.text.contains("remote 25\n"));
        assert_eq!(result.strategy, MergeStrategy::Margin(4));
    }

    #[test]
    fn test_empty_base_is_unmergeable() {
        assert!(three_way_merge("", "mine\n", "theirs\n", MARGINS).is_none());
    }

    #[test]
    fn test_trivial_cases() {
        assert_eq!(three_way_merge("a\n", "a\n", "b\n", MARGINS).unwrap().text, "b\n");
        assert_eq!(three_way_merge("a\n", "b\n", "a\n", MARGINS).unwrap().text, "b\n");
        assert_eq!(three_way_merge("a\n", "c\n", "c\n", MARGINS).unwrap().text, "c\n");
    }

    #[test]
    fn test_same_line_edited_both_sides_fails() {
        assert!(three_way_merge("A\nB\nC\n", "A\nX\nC\n", "A\nY\nC\n", MARGINS).is_none());
    }

    #[test]
    fn test_per_hunk_keeps_applicable_changes() {
        let base = "a\nb\nc\nd\ne\n";
        let local = "a\nb\nc\nd\nLOCAL\n";
        let remote = "a\nR\nc\nd\nREMOTE\n";
        let result = three_way_merge(base, local, remote, MARGINS).unwrap();
        assert_eq!(result.text, "a\nR\nc\nd\nLOCAL\n");
        assert_eq!(result.strategy, MergeStrategy::PerHunk { applied: 1, total: 2 });
    }

    #[test]
    fn test_validation_rejects_dropped_local_line() {
        assert!(preserves_local_additions("a\n", "a\nnew\n", "a\nnew\nmore\n"));
        assert!(!preserves_local_additions("a\n", "a\nnew\n", "a\nmore\n"));
    }

    fn text_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d", "e"]), 1..12)
            .prop_map(|lines| lines.iter().map(|l| format!("{}\n", l)).collect())
    }

    proptest! {
        #[test]
        fn merge_is_deterministic(
            base in text_strategy(),
            local in text_strategy(),
            remote in text_strategy(),
        ) {
            let first = three_way_merge(&base, &local, &remote, MARGINS);
            let second = three_way_merge(&base, &local, &remote, MARGINS);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn merge_never_drops_local_additions(
            base in text_strategy(),
            local in text_strategy(),
            remote in text_strategy(),
        ) {
            if let Some(result) = three_way_merge(&base, &local, &remote, MARGINS) {
                prop_assert!(preserves_local_additions(&base, &local, &result.text));
            }
        }
    }
}
