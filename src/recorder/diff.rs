//! Output comparison and line diffs.

use serde::{Deserialize, Serialize};

/// Past this many line pairs the diff stops looking for common lines.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Comparison flags. All off means an exact comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    pub ignore_case: bool,
    /// Drop all whitespace within a line
    pub ignore_whitespace: bool,
    /// Treat runs of whitespace as one space, ignore trailing whitespace
    pub ignore_whitespace_changes: bool,
    pub ignore_blank_lines: bool,
}

impl DiffOptions {
    pub fn is_exact(&self) -> bool {
        *self == Self::default()
    }

    fn normalize(&self, line: &str) -> String {
        let line = if self.ignore_case {
            line.to_lowercase()
        } else {
            line.to_string()
        };
        if self.ignore_whitespace {
            line.split_whitespace().collect()
        } else if self.ignore_whitespace_changes {
            line.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            line
        }
    }

    /// Lines to compare, paired with their original text
    fn comparable_lines<'a>(&self, text: &'a str) -> Vec<(String, &'a str)> {
        text.lines()
            .map(|line| (self.normalize(line), line))
            .filter(|(norm, _)| !(self.ignore_blank_lines && norm.trim().is_empty()))
            .collect()
    }
}

/// Whether `actual` matches `expected` under `options`.
pub fn outputs_match(expected: &str, actual: &str, options: &DiffOptions) -> bool {
    if options.is_exact() {
        return expected == actual;
    }
    let expected = options.comparable_lines(expected);
    let actual = options.comparable_lines(actual);
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(&actual)
            .all(|((e, _), (a, _))| e == a)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub diff_pass: bool,
    /// Lines prefixed with "- " (expected only), "+ " (actual only) or "  "
    pub diff_content: Vec<String>,
}

/// Line diff of `expected` against `actual`.
pub fn diff(expected: &str, actual: &str, options: &DiffOptions) -> DiffResult {
    let diff_pass = outputs_match(expected, actual, options);
    let exp = options.comparable_lines(expected);
    let act = options.comparable_lines(actual);

    let prefix = exp
        .iter()
        .zip(&act)
        .take_while(|((e, _), (a, _))| e == a)
        .count();
    let suffix = exp[prefix..]
        .iter()
        .rev()
        .zip(act[prefix..].iter().rev())
        .take_while(|((e, _), (a, _))| e == a)
        .count();

    let mut content = Vec::with_capacity(exp.len().max(act.len()));
    content.extend(exp[..prefix].iter().map(|(_, line)| format!("  {}", line)));
    diff_middle(
        &exp[prefix..exp.len() - suffix],
        &act[prefix..act.len() - suffix],
        &mut content,
    );
    content.extend(
        exp[exp.len() - suffix..]
            .iter()
            .map(|(_, line)| format!("  {}", line)),
    );

    DiffResult {
        diff_pass,
        diff_content: content,
    }
}

fn diff_middle(exp: &[(String, &str)], act: &[(String, &str)], out: &mut Vec<String>) {
    let (n, m) = (exp.len(), act.len());
    if n == 0 || m == 0 || n.saturating_mul(m) > MAX_LCS_CELLS {
        out.extend(exp.iter().map(|(_, line)| format!("- {}", line)));
        out.extend(act.iter().map(|(_, line)| format!("+ {}", line)));
        return;
    }

    // lcs[i][j] = LCS length of exp[i..] and act[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if exp[i].0 == act[j].0 {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if exp[i].0 == act[j].0 {
            out.push(format!("  {}", exp[i].1));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("- {}", exp[i].1));
            i += 1;
        } else {
            out.push(format!("+ {}", act[j].1));
            j += 1;
        }
    }
    out.extend(exp[i..].iter().map(|(_, line)| format!("- {}", line)));
    out.extend(act[j..].iter().map(|(_, line)| format!("+ {}", line)));
}
