//! Line-based Myers diff rendered in unified format.

use std::fmt::Write;

pub const DEFAULT_CONTEXT: usize = 3;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

/// Shortest edit script from `a` to `b`.
///
/// Common prefix and suffix are stripped first; only the window of the `V`
/// array each round can touch is kept for backtracking.
fn diff_lines<T: PartialEq>(a: &[T], b: &[T]) -> Vec<Edit> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut edits: Vec<Edit> = (0..prefix).map(|i| Edit::Equal(i, i)).collect();
    let middle = myers(&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);
    edits.extend(middle.into_iter().map(|edit| match edit {
        Edit::Equal(i, j) => Edit::Equal(i + prefix, j + prefix),
        Edit::Delete(i) => Edit::Delete(i + prefix),
        Edit::Insert(j) => Edit::Insert(j + prefix),
    }));
    let (a_tail, b_tail) = (a.len() - suffix, b.len() - suffix);
    edits.extend((0..suffix).map(|i| Edit::Equal(a_tail + i, b_tail + i)));
    edits
}

fn myers<T: PartialEq>(a: &[T], b: &[T]) -> Vec<Edit> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    let offset = max + 1;
    let mut v = vec![0isize; (2 * max + 3) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v[(offset - d - 1) as usize..=(offset + d + 1) as usize].to_vec());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);
    for (d, window) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let at = |k: isize| window[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal((x - 1) as usize, (y - 1) as usize));
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert((y - 1) as usize));
            } else {
                edits.push(Edit::Delete((x - 1) as usize));
            }
        }
        x = prev_x;
        y = prev_y;
    }
    edits.reverse();
    edits
}

fn hunk_range(start: usize, count: usize) -> String {
    match count {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, count),
    }
}

fn push_line(out: &mut String, sign: char, line: &str) {
    out.push(sign);
    out.push_str(line);
    if !line.ends_with('\n') {
        out.push('\n');
        out.push_str(NO_NEWLINE_MARKER);
        out.push('\n');
    }
}

/// Unified diff of `old` against `new` with `context` lines around each
/// change. Returns an empty string when the inputs are identical.
pub fn unified_diff(old: &str, new: &str, old_label: &str, new_label: &str, context: usize) -> String {
    let a: Vec<&str> = old.split_inclusive('\n').collect();
    let b: Vec<&str> = new.split_inclusive('\n').collect();
    let edits = diff_lines(&a, &b);

    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| !matches!(e, Edit::Equal(..)))
        .map(|(i, _)| i)
        .collect();
    let Some(&first) = changes.first() else {
        return String::new();
    };

    // Hunks as [start, end) ranges over `edits`.
    let mut hunks = Vec::new();
    let (mut start, mut end) = (first.saturating_sub(context), first + 1);
    for &pos in &changes[1..] {
        if pos - end <= 2 * context {
            end = pos + 1;
        } else {
            hunks.push((start, (end + context).min(edits.len())));
            start = pos - context;
            end = pos + 1;
        }
    }
    hunks.push((start, (end + context).min(edits.len())));

    // Lines of each side consumed before edit `i`.
    let mut consumed = Vec::with_capacity(edits.len() + 1);
    let (mut old_pos, mut new_pos) = (0, 0);
    for edit in &edits {
        consumed.push((old_pos, new_pos));
        match edit {
            Edit::Equal(..) => {
                old_pos += 1;
                new_pos += 1;
            }
            Edit::Delete(_) => old_pos += 1,
            Edit::Insert(_) => new_pos += 1,
        }
    }
    consumed.push((old_pos, new_pos));

    let mut out = String::new();
    let _ = writeln!(out, "--- {}", old_label);
    let _ = writeln!(out, "+++ {}", new_label);

    for (start, end) in hunks {
        let (old_start, new_start) = consumed[start];
        let (old_end, new_end) = consumed[end];
        let _ = writeln!(
            out,
            "@@ -{} +{} @@",
            hunk_range(old_start, old_end - old_start),
            hunk_range(new_start, new_end - new_start)
        );
        for edit in &edits[start..end] {
            match *edit {
                Edit::Equal(i, _) => push_line(&mut out, ' ', a[i]),
                Edit::Delete(i) => push_line(&mut out, '-', a[i]),
                Edit::Insert(j) => push_line(&mut out, '+', b[j]),
            }
        }
    }
    out
}
