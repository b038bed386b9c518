//! Markdown changelog entry for a promoted candidate.

use crate::domain::{EvaluationResult, PromptVersion};
use crate::experiment::ExperimentOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineChange<'a> {
    Same(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Longest common subsequence of two line slices, as `(index_old, index_new)`
/// pairs in ascending order.
fn lcs_alignment(old: &[&str], new: &[&str]) -> Vec<(usize, usize)> {
    let m = old.len();
    let n = new.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    // dp[i][j] = LCS length of old[0..i] and new[0..j]
    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            dp[i][j] = if old[i - 1] == new[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i][j - 1].max(dp[i - 1][j])
            };
        }
    }

    let mut alignment = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if old[i - 1] == new[j - 1] {
            alignment.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[i][j - 1] > dp[i - 1][j] {
            j -= 1;
        } else {
            i -= 1;
        }
    }
    alignment.reverse();
    alignment
}

/// Line diff of two templates. Removals precede additions between matches.
pub fn diff_lines<'a>(old: &'a str, new: &'a str) -> Vec<LineChange<'a>> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let alignment = lcs_alignment(&old_lines, &new_lines);

    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    for (ai, aj) in alignment
        .into_iter()
        .chain(std::iter::once((old_lines.len(), new_lines.len())))
    {
        changes.extend(old_lines[i..ai].iter().map(|l| LineChange::Removed(*l)));
        changes.extend(new_lines[j..aj].iter().map(|l| LineChange::Added(*l)));
        if ai < old_lines.len() {
            changes.push(LineChange::Same(old_lines[ai]));
        }
        i = ai + 1;
        j = aj + 1;
    }
    changes
}

pub fn render_template_diff(old: &str, new: &str) -> String {
    let mut out = String::new();
    for change in diff_lines(old, new) {
        let (prefix, line) = match change {
            LineChange::Same(l) => (' ', l),
            LineChange::Removed(l) => ('-', l),
            LineChange::Added(l) => ('+', l),
        };
        out.push(prefix);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Changelog entry for promoting `outcome` over `baseline`.
pub fn render_promotion_summary(
    baseline: &PromptVersion,
    baseline_result: &EvaluationResult,
    outcome: &ExperimentOutcome,
) -> String {
    let candidate = &outcome.candidate_result;
    let mut out = String::new();
    out.push_str(&format!(
        "# Promotion: {} -> {}\n\n",
        baseline.version_id, outcome.candidate_version.version_id
    ));
    out.push_str(&format!(
        "- dataset: `{}`\n- aggregate: {:.4} -> {:.4} ({:+.4})\n- pass rate: {:.4} -> {:.4}\n",
        candidate.dataset_id,
        baseline_result.aggregate_score,
        candidate.aggregate_score,
        outcome.metrics.overall_delta,
        baseline_result.pass_rate(),
        candidate.pass_rate()
    ));
    if let Some(rate) = outcome.critical_pass_rate {
        out.push_str(&format!("- critical pass rate: {rate:.4}\n"));
    }
    if !outcome.candidate.rationale.is_empty() {
        out.push_str(&format!("- rationale: {}\n", outcome.candidate.rationale));
    }
    out.push('\n');

    out.push_str("## Dimensions\n");
    for (dim, delta) in &outcome.metrics.dimension_deltas {
        let before = baseline_result.dimension_means.get(dim).copied().unwrap_or_default();
        let after = candidate.dimension_means.get(dim).copied().unwrap_or_default();
        out.push_str(&format!("- {dim}: {before:.4} -> {after:.4} ({delta:+.4})\n"));
    }
    for dim in &outcome.metrics.unmatched_dimensions {
        out.push_str(&format!("- {dim}: scored on one side only\n"));
    }
    out.push('\n');

    out.push_str("## Template\n```diff\n");
    out.push_str(&render_template_diff(
        &baseline.template,
        &outcome.candidate_version.template,
    ));
    out.push_str("```\n");
    out
}
