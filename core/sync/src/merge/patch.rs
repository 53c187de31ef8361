//! Context patches built from a diff and applied by pattern search.

use super::diff::DiffOp;

/// One contiguous change with up to `margin` lines of context on each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Index in the source stream where `deleted` starts.
    pub source_start: usize,
    pub before: Vec<u32>,
    pub deleted: Vec<u32>,
    pub inserted: Vec<u32>,
    pub after: Vec<u32>,
}

impl Hunk {
    fn pattern(&self) -> Vec<u32> {
        let mut pattern = self.before.clone();
        pattern.extend(&self.deleted);
        pattern.extend(&self.after);
        pattern
    }

    fn growth(&self) -> isize {
        self.inserted.len() as isize - self.deleted.len() as isize
    }
}

/// Turn a diff into hunks, taking context only from unchanged runs.
pub fn make_hunks(ops: &[DiffOp], margin: usize) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut source_pos = 0;
    let mut i = 0;

    while i < ops.len() {
        if let DiffOp::Equal(run) = &ops[i] {
            source_pos += run.len();
            i += 1;
            continue;
        }

        let before = match i.checked_sub(1).map(|j| &ops[j]) {
            Some(DiffOp::Equal(run)) => run[run.len().saturating_sub(margin)..].to_vec(),
            _ => Vec::new(),
        };

        let source_start = source_pos;
        let mut deleted = Vec::new();
        let mut inserted = Vec::new();
        while i < ops.len() {
            match &ops[i] {
                DiffOp::Delete(run) => {
                    deleted.extend(run);
                    source_pos += run.len();
                }
                DiffOp::Insert(run) => inserted.extend(run),
                DiffOp::Equal(_) => break,
            }
            i += 1;
        }

        let after = match ops.get(i) {
            Some(DiffOp::Equal(run)) => run[..margin.min(run.len())].to_vec(),
            _ => Vec::new(),
        };

        hunks.push(Hunk {
            source_start,
            before,
            deleted,
            inserted,
            after,
        });
    }

    hunks
}

/// Applies hunks in order onto a target stream, tracking how far the
/// target has drifted from the source positions the hunks were cut at.
#[derive(Debug, Clone)]
pub struct Patcher {
    target: Vec<u32>,
    drift: isize,
}

impl Patcher {
    /// Create a new patcher over a copy of `target`.
    pub fn new(target: &[u32]) -> Self {
        Self {
            target: target.to_vec(),
            drift: 0,
        }
    }

    /// Apply one hunk at the match of its context closest to where it is
    /// expected. Returns false, leaving the target untouched, if the
    /// context cannot be found.
    pub fn apply(&mut self, hunk: &Hunk) -> bool {
        let pattern = hunk.pattern();
        let expected = hunk.source_start as isize + self.drift - hunk.before.len() as isize;

        let Some(start) = find_closest(&self.target, &pattern, expected) else {
            return false;
        };

        let cut = start + hunk.before.len();
        self.target
            .splice(cut..cut + hunk.deleted.len(), hunk.inserted.iter().copied());
        self.drift = cut as isize - hunk.source_start as isize + hunk.growth();
        true
    }

    pub fn result(&self) -> &[u32] {
        &self.target
    }

    pub fn into_result(self) -> Vec<u32> {
        self.target
    }
}

/// Apply every hunk, or nothing.
pub fn apply_all(target: &[u32], hunks: &[Hunk]) -> Option<Vec<u32>> {
    let mut patcher = Patcher::new(target);
    for hunk in hunks {
        if !patcher.apply(hunk) {
            return None;
        }
    }
    Some(patcher.into_result())
}

fn find_closest(haystack: &[u32], pattern: &[u32], expected: isize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(expected.clamp(0, haystack.len() as isize) as usize);
    }
    if pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .enumerate()
        .filter(|(_, window)| *window == pattern)
        .map(|(pos, _)| pos)
        .min_by_key(|&pos| (pos as isize - expected).abs())
}
