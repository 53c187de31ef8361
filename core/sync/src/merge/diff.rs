//! Myers shortest-edit-script diff over symbol streams.

/// A run of consecutive edits of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Equal(Vec<u32>),
    Delete(Vec<u32>),
    Insert(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Equal(u32),
    Delete(u32),
    Insert(u32),
}

/// Diff `a` into `b`, grouping consecutive edits of the same kind.
///
/// Common prefix and suffix are stripped before the quadratic search.
pub fn diff(a: &[u32], b: &[u32]) -> Vec<DiffOp> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut steps: Vec<Step> = a[..prefix].iter().map(|&s| Step::Equal(s)).collect();
    steps.extend(myers(
        &a[prefix..a.len() - suffix],
        &b[prefix..b.len() - suffix],
    ));
    steps.extend(a[a.len() - suffix..].iter().map(|&s| Step::Equal(s)));

    group(steps)
}

fn myers(a: &[u32], b: &[u32]) -> Vec<Step> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    let offset = max;
    let idx = |k: isize| (offset + k) as usize;

    let mut v = vec![0isize; 2 * max as usize + 2];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let mut x = if k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]) {
                v[idx(k + 1)]
            } else {
                v[idx(k - 1)] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx(k)] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut steps = Vec::new();
    let (mut x, mut y) = (n, m);
    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[idx(prev_k)];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            steps.push(Step::Equal(a[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                steps.push(Step::Insert(b[(y - 1) as usize]));
            } else {
                steps.push(Step::Delete(a[(x - 1) as usize]));
            }
        }
        x = prev_x;
        y = prev_y;
    }

    steps.reverse();
    steps
}

fn group(steps: Vec<Step>) -> Vec<DiffOp> {
    let mut ops: Vec<DiffOp> = Vec::new();
    for step in steps {
        let extended = match (ops.last_mut(), step) {
            (Some(DiffOp::Equal(run)), Step::Equal(s))
            | (Some(DiffOp::Delete(run)), Step::Delete(s))
            | (Some(DiffOp::Insert(run)), Step::Insert(s)) => {
                run.push(s);
                true
            }
            _ => false,
        };
        if !extended {
            ops.push(match step {
                Step::Equal(s) => DiffOp::Equal(vec![s]),
                Step::Delete(s) => DiffOp::Delete(vec![s]),
                Step::Insert(s) => DiffOp::Insert(vec![s]),
            });
        }
    }
    ops
}
