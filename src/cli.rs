//! Command handler functions for the tmplcov CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::exec::Locals;
use crate::isolate;
use crate::report::{self, JsonFormatter, LcovFormatter, MarkdownFormatter, ReportFormatter, TextFormatter};
use crate::runner::CoverageRunner;

/// Output format for the `run` command.
#[derive(Clone, Debug, ValueEnum)]
pub enum Format {
    Text,
    Markdown,
    Json,
    Lcov,
}

impl Format {
    fn formatter(&self) -> &'static dyn ReportFormatter {
        match self {
            Format::Text => &TextFormatter,
            Format::Markdown => &MarkdownFormatter,
            Format::Json => &JsonFormatter,
            Format::Lcov => &LcovFormatter,
        }
    }
}

fn read_template(template: &Path) -> Result<String> {
    fs::read_to_string(template).with_context(|| format!("Failed to read template {}", template.display()))
}

/// Read a JSON object of explicit locals.
pub fn load_locals(path: &Path) -> Result<Locals> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read locals {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} must contain a JSON object", path.display()))
}

/// Full coverage run. With `targeted`, arms left uncovered are fed back as
/// targeted permutations and the run is repeated once.
pub fn cmd_run(
    runner: &CoverageRunner,
    template: &Path,
    locals: Option<&Path>,
    format: &Format,
    targeted: bool,
) -> Result<String> {
    let source = read_template(template)?;
    let locals = match locals {
        Some(path) => load_locals(path)?,
        None => Locals::new(),
    };

    let mut result = runner
        .run(&source, Some(template), &locals)
        .context("Coverage run failed")?;
    if targeted && !result.degraded && !result.summary.uncovered_branches.is_empty() {
        let extra = runner.targeted_permutations(&source, &result)?;
        if !extra.is_empty() {
            result = runner
                .run_with_extra(&source, Some(template), &locals, extra)
                .context("Targeted coverage run failed")?;
        }
    }
    Ok(report::format_result(&result, format.formatter()))
}

pub fn cmd_branches(runner: &CoverageRunner, template: &Path) -> Result<String> {
    let analysis = runner.analyze(&read_template(template)?)?;

    if analysis.branches.is_empty() {
        return Ok(format!("No branches in '{}'\n", template.display()));
    }

    let mut out = String::new();
    writeln!(out, "{:>6}  {:<8} {:>5}  CONDITION", "LINE", "KIND", "SITE").unwrap();
    writeln!(out, "{}", "-".repeat(60)).unwrap();
    for branch in &analysis.branches {
        writeln!(
            out,
            "{:>6}  {:<8} {:>5}  {}",
            branch.line,
            branch.kind.to_string(),
            branch.site_id,
            branch.condition
        )
        .unwrap();
    }
    writeln!(out, "\nConditional variables ({}):", analysis.conditional_variables.len()).unwrap();
    for var in &analysis.conditional_variables {
        writeln!(out, "  {var}").unwrap();
    }
    Ok(out)
}

pub fn cmd_facts(runner: &CoverageRunner, template: &Path) -> Result<String> {
    let facts = runner.analyze(&read_template(template)?)?.facts;

    if facts.is_empty() {
        return Ok(format!("No structural facts in '{}'\n", template.display()));
    }

    let mut out = String::new();
    if !facts.case_facts.is_empty() {
        writeln!(out, "Case values:").unwrap();
        for fact in &facts.case_facts {
            writeln!(out, "  {}: {}", fact.subject, quoted(&fact.values)).unwrap();
        }
    }
    if !facts.block_facts.is_empty() {
        writeln!(out, "Block conditions:").unwrap();
        for fact in &facts.block_facts {
            writeln!(
                out,
                "  {} |{}|: {}",
                fact.iterator,
                fact.variable,
                fact.conditions.join(", ")
            )
            .unwrap();
        }
    }
    if !facts.computed_variables.is_empty() {
        writeln!(out, "Computed variables:").unwrap();
        for fact in &facts.computed_variables {
            let deps = if fact.dependencies.is_empty() {
                "(no forced dependencies)".to_string()
            } else {
                fact.dependencies.join(", ")
            };
            writeln!(out, "  {} <- {deps}", fact.name).unwrap();
        }
    }
    if !facts.string_comparisons.is_empty() {
        writeln!(out, "String comparisons:").unwrap();
        for fact in &facts.string_comparisons {
            writeln!(out, "  {} == {}", fact.subject, quoted(&fact.values)).unwrap();
        }
    }
    Ok(out)
}

fn quoted(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("{v:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn cmd_permutations(runner: &CoverageRunner, template: &Path, json: bool) -> Result<String> {
    let permutations = runner.analyze(&read_template(template)?)?.permutations;

    if json {
        let mut out = serde_json::to_string_pretty(&permutations)?;
        out.push('\n');
        return Ok(out);
    }

    let mut out = String::new();
    writeln!(out, "{} permutations:", permutations.len()).unwrap();
    for (i, permutation) in permutations.iter().enumerate() {
        writeln!(out, "{:>4}. {permutation}", i + 1).unwrap();
    }
    Ok(out)
}

pub fn cmd_compile(runner: &CoverageRunner, template: &Path) -> Result<String> {
    let source = read_template(template)?;
    let unit = runner
        .compiler()
        .compile(&source, Some(template))
        .context("Failed to compile template")?;

    let mut out = String::new();
    writeln!(out, "# {} -> {}", template.display(), unit.artifact_path.display()).unwrap();
    out.push_str(&unit.code);
    if !unit.code.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

pub fn cmd_clean(runner: &CoverageRunner) -> Result<String> {
    let dir = runner.compiler().artifact_dir();
    runner.compiler().clean().context("Failed to clear artifact directory")?;
    Ok(format!("Cleared {}\n", dir.display()))
}

/// Child side of the isolation boundary: request on stdin, reply on stdout.
pub fn cmd_exec_isolated() -> Result<()> {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    isolate::serve_stdio(stdin, stdout)?;
    Ok(())
}
