//! Output formatting for coverage results.

use std::collections::HashMap;
use std::fmt::Write;

use crate::model::{CoverageResult, RenderOutcome};

const RULE_WIDTH: usize = 60;

/// Trait for formatting coverage results.
pub trait ReportFormatter {
    /// Format the result to a string.
    fn format(&self, result: &CoverageResult) -> String;
}

/// Format `result` with `formatter`.
#[must_use]
pub fn format_result(result: &CoverageResult, formatter: &dyn ReportFormatter) -> String {
    formatter.format(result)
}

/// Plain text formatter.
pub struct TextFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, result: &CoverageResult) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let summary = &result.summary;
        let mut out = String::new();

        writeln!(out, "{rule}").unwrap();
        writeln!(out, "Template Coverage Report").unwrap();
        writeln!(out, "{rule}").unwrap();
        writeln!(out, "Source: {}", result.source_path.as_deref().unwrap_or("(string)")).unwrap();
        if let Some(compiled) = &result.compiled_path {
            writeln!(out, "Compiled: {compiled}").unwrap();
        }
        writeln!(out, "Branches found: {}", result.branches.len()).unwrap();
        writeln!(out, "Permutations run: {}", result.permutation_count()).unwrap();
        if result.degraded {
            writeln!(out, "Isolated execution failed; coverage could not be measured.").unwrap();
        }

        out.push('\n');
        writeln!(out, "Coverage Results:").unwrap();
        writeln!(
            out,
            "  Line Coverage:   {:.1}% ({}/{} lines)",
            summary.line_coverage, summary.covered_lines, summary.total_lines
        )
        .unwrap();
        writeln!(
            out,
            "  Branch Coverage: {:.1}% ({}/{} arms)",
            summary.branch_coverage, summary.covered_branches, summary.total_branches
        )
        .unwrap();

        if !summary.uncovered_lines.is_empty() {
            let executable: Vec<u32> = result.line_hits.keys().copied().collect();
            out.push('\n');
            writeln!(out, "Uncovered Lines:").unwrap();
            writeln!(out, "  {}", format_line_ranges(&summary.uncovered_lines, &executable)).unwrap();
        }

        if !summary.uncovered_branches.is_empty() {
            out.push('\n');
            writeln!(out, "Uncovered Branches:").unwrap();
            for branch in &summary.uncovered_branches {
                writeln!(
                    out,
                    "  - Line {}: {} {} (site {})",
                    branch.line, branch.kind, branch.arm, branch.site_id
                )
                .unwrap();
            }
        }

        let failures: Vec<_> = result
            .outputs
            .iter()
            .filter_map(|o| match &o.outcome {
                RenderOutcome::Failed { error } => Some((&o.permutation, error)),
                RenderOutcome::Rendered { .. } => None,
            })
            .collect();
        if !failures.is_empty() {
            out.push('\n');
            writeln!(out, "Failed Permutations: {}", failures.len()).unwrap();
            for (permutation, error) in failures {
                writeln!(out, "  - {permutation}: {}", error.message).unwrap();
                if let Some(frame) = error.backtrace.first() {
                    writeln!(out, "      at {frame}").unwrap();
                }
            }
        }

        out.push('\n');
        if is_fully_covered(result) {
            writeln!(out, "✅ All branches covered!").unwrap();
        } else {
            writeln!(out, "❌ Some branches not covered").unwrap();
        }
        writeln!(out, "{rule}").unwrap();
        out
    }
}

/// Markdown formatter.
pub struct MarkdownFormatter;

impl ReportFormatter for MarkdownFormatter {
    fn format(&self, result: &CoverageResult) -> String {
        let summary = &result.summary;
        let mut md = String::new();

        writeln!(md, "### Template Coverage: {:.1}%\n", summary.branch_coverage).unwrap();
        let source = result.source_path.as_deref().unwrap_or("(string)");
        writeln!(
            md,
            "`{source}`: **{}** branch sites, **{}** permutations",
            result.branches.len(),
            result.permutation_count()
        )
        .unwrap();
        if result.degraded {
            md.push_str("\n> **Isolated execution failed**; coverage could not be measured.\n");
        }

        md.push_str("\n| Metric | Covered | Total | Rate |\n");
        md.push_str("|:-------|--------:|------:|-----:|\n");
        writeln!(
            md,
            "| Lines | {} | {} | {:.1}% |",
            summary.covered_lines, summary.total_lines, summary.line_coverage
        )
        .unwrap();
        writeln!(
            md,
            "| Branches | {} | {} | {:.1}% |",
            summary.covered_branches, summary.total_branches, summary.branch_coverage
        )
        .unwrap();

        if summary.uncovered_branches.is_empty() {
            md.push_str("\nAll branches are covered! 🎉\n");
        } else {
            md.push_str("\n| Line | Kind | Arm | Site |\n");
            md.push_str("|-----:|:-----|:----|-----:|\n");
            for branch in &summary.uncovered_branches {
                writeln!(
                    md,
                    "| {} | `{}` | {} | {} |",
                    branch.line, branch.kind, branch.arm, branch.site_id
                )
                .unwrap();
            }
        }

        if !summary.uncovered_lines.is_empty() {
            let executable: Vec<u32> = result.line_hits.keys().copied().collect();
            writeln!(
                md,
                "\n**Uncovered lines**: {}",
                format_line_ranges(&summary.uncovered_lines, &executable)
            )
            .unwrap();
        }

        let failed = result.failed_outputs();
        if failed > 0 {
            writeln!(md, "\n<details>\n<summary>{failed} failed permutations</summary>\n").unwrap();
            for output in &result.outputs {
                if let RenderOutcome::Failed { error } = &output.outcome {
                    writeln!(md, "- `{}`: {}", output.permutation, error.message).unwrap();
                }
            }
            md.push_str("\n</details>\n");
        }

        md
    }
}

/// The serialized [`CoverageResult`].
pub struct JsonFormatter;

impl ReportFormatter for JsonFormatter {
    fn format(&self, result: &CoverageResult) -> String {
        match serde_json::to_string_pretty(result) {
            Ok(mut json) => {
                json.push('\n');
                json
            }
            Err(e) => format!("{{\"error\": {:?}}}\n", e.to_string()),
        }
    }
}

/// LCOV tracefile of the merged hits.
pub struct LcovFormatter;

impl ReportFormatter for LcovFormatter {
    fn format(&self, result: &CoverageResult) -> String {
        let mut out = String::new();
        writeln!(out, "TN:").unwrap();
        let file = result
            .source_path
            .as_deref()
            .or(result.compiled_path.as_deref())
            .unwrap_or("(string)");
        writeln!(out, "SF:{file}").unwrap();

        let mut arm_index: HashMap<u32, u32> = HashMap::new();
        for arm in &result.arm_hits {
            let index = arm_index.entry(arm.site_id).or_insert(0);
            writeln!(out, "BRDA:{},{},{},{}", arm.line, arm.site_id, index, arm.hits).unwrap();
            *index += 1;
        }
        let taken = result.arm_hits.iter().filter(|a| a.hits > 0).count();
        writeln!(out, "BRF:{}", result.arm_hits.len()).unwrap();
        writeln!(out, "BRH:{taken}").unwrap();

        for (line, hits) in &result.line_hits {
            writeln!(out, "DA:{line},{hits}").unwrap();
        }
        let hit = result.line_hits.values().filter(|&&h| h > 0).count();
        writeln!(out, "LF:{}", result.line_hits.len()).unwrap();
        writeln!(out, "LH:{hit}").unwrap();
        writeln!(out, "end_of_record").unwrap();
        out
    }
}

/// Branch coverage is complete and the run was not degraded.
#[must_use]
pub fn is_fully_covered(result: &CoverageResult) -> bool {
    !result.degraded && result.summary.branch_coverage >= 100.0
}

/// Maximum number of consecutive non-executable lines that can be bridged
/// when coalescing uncovered ranges.
const MAX_BRIDGE_GAP: u32 = 2;

/// Coalesce sorted line numbers into `(start, end)` ranges, bridging gaps of
/// at most [`MAX_BRIDGE_GAP`] lines when no line in the gap is executable.
///
/// Both `lines` and `executable` must be sorted and deduplicated.
#[must_use]
pub fn coalesce_ranges(lines: &[u32], executable: &[u32]) -> Vec<(u32, u32)> {
    if lines.is_empty() {
        return Vec::new();
    }

    debug_assert!(
        lines.windows(2).all(|w| w[0] < w[1]),
        "coalesce_ranges requires sorted, deduplicated input"
    );

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut start = lines[0];
    let mut end = lines[0];

    for &line in &lines[1..] {
        let gap = line - end - 1;
        if gap <= MAX_BRIDGE_GAP && (end + 1..line).all(|l| executable.binary_search(&l).is_err()) {
            end = line;
        } else {
            ranges.push((start, end));
            start = line;
            end = line;
        }
    }

    ranges.push((start, end));
    ranges
}

/// Format line numbers into compact range notation, e.g. "1, 3-5, 8".
#[must_use]
pub fn format_line_ranges(lines: &[u32], executable: &[u32]) -> String {
    coalesce_ranges(lines, executable)
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
