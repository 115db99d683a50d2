//! One coverage run: compile, analyze, synthesize, execute, aggregate.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::branches::{collect_identifiers, BranchExtractor};
use crate::compiler::{translate, CompiledUnit, Compiler};
use crate::config::Config;
use crate::coverage::{CoverageMap, Hits};
use crate::error::{RenderError, Result};
use crate::exec::{execute_permutation, Locals};
use crate::isolate::{run_subprocess, IsolatedRequest, Isolation};
use crate::lang::ast::walk;
use crate::lang::{Expr, ExprKind, Program};
use crate::model::{
    block_item_path, ArmKind, BranchKind, ConditionalBranch, CoverageResult, CoverageSummary, ForcedValue,
    Permutation, PermutationOutput, RenderOutcome, StructuralFacts, NO_MATCH,
};
use crate::structure;
use crate::synth::Synthesizer;

/// Everything known about a template before it is executed.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub code: String,
    pub program: Program,
    pub branches: Vec<ConditionalBranch>,
    pub conditional_variables: Vec<String>,
    pub facts: StructuralFacts,
    pub permutations: Vec<Permutation>,
}

#[derive(Debug, Clone)]
pub struct CoverageRunner {
    config: Config,
    compiler: Compiler,
    isolation: Isolation,
}

impl CoverageRunner {
    pub fn new(config: Config, isolation: Isolation) -> Self {
        let compiler = Compiler::new(config.artifact_dir.clone());
        Self {
            config,
            compiler,
            isolation,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Extract branches from the compiled form, facts from the template and
    /// synthesize permutations, without writing an artifact.
    pub fn analyze(&self, source: &str) -> Result<Analysis> {
        let code = translate(source)?;
        self.analyze_code(source, code)
    }

    fn analyze_code(&self, template: &str, code: String) -> Result<Analysis> {
        let extractor = BranchExtractor::new(&code)?;
        let conditional_variables = extractor.conditional_variables();
        let (program, branches) = extractor.into_parts();
        let facts = structure::analyze(template);
        let permutations = Synthesizer::new(&conditional_variables, &facts, &self.config).permutations();
        debug!(
            branches = branches.len(),
            variables = conditional_variables.len(),
            permutations = permutations.len(),
            "analyzed template"
        );
        Ok(Analysis {
            code,
            program,
            branches,
            conditional_variables,
            facts,
            permutations,
        })
    }

    /// Full coverage run over the synthesized permutations.
    pub fn run(&self, source: &str, path: Option<&Path>, locals: &Locals) -> Result<CoverageResult> {
        self.run_with_extra(source, path, locals, Vec::new())
    }

    /// Like [`Self::run`], with `extra` appended to the synthesized
    /// permutations. Duplicates are dropped, first occurrence wins.
    pub fn run_with_extra(
        &self,
        source: &str,
        path: Option<&Path>,
        locals: &Locals,
        extra: Vec<Permutation>,
    ) -> Result<CoverageResult> {
        let unit = self.compiler.compile(source, path)?;
        let analysis = self.analyze_code(source, unit.code.clone())?;

        let mut seen = HashSet::new();
        let permutations: Vec<Permutation> = analysis
            .permutations
            .iter()
            .cloned()
            .chain(extra)
            .filter(|p| seen.insert(p.clone()))
            .collect();

        let map = CoverageMap::from_program(&analysis.program);
        let source_path = path.map(|p| p.display().to_string());
        let compiled_path = Some(unit.artifact_path.display().to_string());

        match self.execute(&unit, &analysis.program, &map, locals, &permutations) {
            Ok((outputs, hits)) => {
                let summary = map.summarize(&hits);
                debug!(
                    permutations = outputs.len(),
                    line_coverage = summary.line_coverage,
                    branch_coverage = summary.branch_coverage,
                    "coverage run finished"
                );
                Ok(CoverageResult {
                    source_path,
                    compiled_path,
                    outputs,
                    summary,
                    line_hits: map.line_hits(&hits),
                    arm_hits: map.arm_hits(&hits),
                    branches: analysis.branches,
                    facts: analysis.facts,
                    degraded: false,
                })
            }
            Err(e) => {
                warn!(error = %e, "isolated execution failed; reporting zero coverage");
                Ok(CoverageResult {
                    source_path,
                    compiled_path,
                    outputs: vec![PermutationOutput {
                        permutation: Permutation::new(),
                        outcome: RenderOutcome::Failed {
                            error: RenderError::new(e.to_string()),
                        },
                    }],
                    summary: CoverageSummary::default(),
                    line_hits: Default::default(),
                    arm_hits: Vec::new(),
                    branches: analysis.branches,
                    facts: analysis.facts,
                    degraded: true,
                })
            }
        }
    }

    fn execute(
        &self,
        unit: &CompiledUnit,
        program: &Program,
        map: &CoverageMap,
        locals: &Locals,
        permutations: &[Permutation],
    ) -> Result<(Vec<PermutationOutput>, Hits)> {
        let mut outputs = Vec::with_capacity(permutations.len());
        let mut hits = Hits::default();
        for (i, permutation) in permutations.iter().enumerate() {
            debug!(index = i, total = permutations.len(), "executing permutation");
            match &self.isolation {
                Isolation::InProcess => {
                    let (output, permutation_hits) = execute_permutation(program, map, locals, permutation);
                    outputs.push(output);
                    hits.merge(&permutation_hits);
                }
                Isolation::Subprocess { program: exe } => {
                    let request = IsolatedRequest {
                        artifact_path: unit.artifact_path.clone(),
                        locals: locals.clone(),
                        permutations: vec![permutation.clone()],
                    };
                    let reply = run_subprocess(exe, &request, self.config.permutation_timeout())?;
                    outputs.extend(reply.outputs);
                    hits.merge(&reply.hits);
                }
            }
        }
        Ok((outputs, hits))
    }

    /// Permutations aimed at the branch arms `result` left uncovered. Each
    /// starts from the all-true seed and forces the missed branch's
    /// variables in the direction that takes the missed arm.
    pub fn targeted_permutations(&self, source: &str, result: &CoverageResult) -> Result<Vec<Permutation>> {
        let analysis = self.analyze(source)?;
        let seed = Synthesizer::new(&analysis.conditional_variables, &analysis.facts, &self.config).all_true();
        let targeter = Targeter {
            code: &analysis.code,
            program: &analysis.program,
            facts: &analysis.facts,
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for uncovered in &result.summary.uncovered_branches {
            let Some(branch) = analysis.branches.iter().find(|b| b.site_id == uncovered.site_id) else {
                continue;
            };
            let mut perm = seed.clone();
            let forced = match branch.kind {
                BranchKind::If | BranchKind::Unless => {
                    let want = (uncovered.arm == ArmKind::Then) != (branch.kind == BranchKind::Unless);
                    targeter.force_condition(&branch.identifiers, want, &mut perm);
                    true
                }
                BranchKind::Case => targeter.force_case(branch.site_id, uncovered.arm, &mut perm),
            };
            if forced && seen.insert(perm.clone()) {
                out.push(perm);
            }
        }
        debug!(
            uncovered = result.summary.uncovered_branches.len(),
            targeted = out.len(),
            "built targeted permutations"
        );
        Ok(out)
    }
}

struct Targeter<'a> {
    code: &'a str,
    program: &'a Program,
    facts: &'a StructuralFacts,
}

impl Targeter<'_> {
    /// Force every identifier of a condition so the condition reads `want`.
    fn force_condition(&self, identifiers: &[String], want: bool, perm: &mut Permutation) {
        for ident in identifiers {
            if self.facts.case_facts.iter().any(|f| &f.subject == ident) {
                continue;
            }
            if let Some(fact) = self.facts.computed_variables.iter().find(|f| &f.name == ident) {
                for dep in &fact.dependencies {
                    perm.insert(dep.as_str(), ForcedValue::Bool(want));
                }
                continue;
            }
            if let Some((subject, op)) = ident.rsplit_once('.') {
                if let Some(fact) = self.facts.string_comparisons.iter().find(|f| f.subject == subject) {
                    let equal = match op {
                        "==" => Some(want),
                        "!=" => Some(!want),
                        _ => None,
                    };
                    if let Some(equal) = equal {
                        let value = match fact.values.first() {
                            Some(first) if equal => first.clone(),
                            _ => NO_MATCH.to_string(),
                        };
                        perm.insert(subject, ForcedValue::Str(value));
                        continue;
                    }
                }
                if let Some(block) = self
                    .facts
                    .block_facts
                    .iter()
                    .find(|b| b.variable == subject && b.conditions.iter().any(|c| c == op))
                {
                    perm.insert(block_item_path(&block.iterator, op), ForcedValue::Bool(want));
                    continue;
                }
            }
            perm.insert(ident.as_str(), ForcedValue::Bool(want));
        }
    }

    /// Force a `case` site into `arm`. False when the site cannot be steered.
    fn force_case(&self, site: u32, arm: ArmKind, perm: &mut Permutation) -> bool {
        let mut found = None;
        walk(&self.program.body, &mut |expr| {
            if let ExprKind::Case(node) = &expr.kind {
                if node.site == site {
                    found = Some(node);
                }
            }
        });
        let Some(node) = found else {
            return false;
        };

        match (&node.subject, arm) {
            (Some(subject), ArmKind::When(i)) => {
                let Some(value) = node.whens.get(i as usize).and_then(|w| w.values.first()) else {
                    return false;
                };
                let key = subject.span.text(self.code).trim();
                perm.insert(key, ForcedValue::from_literal(&self.literal(value)));
                true
            }
            (Some(subject), _) => {
                perm.insert(subject.span.text(self.code).trim(), ForcedValue::Unmatched);
                true
            }
            (None, ArmKind::When(i)) => {
                let Some(when) = node.whens.get(i as usize) else {
                    return false;
                };
                let mut identifiers = Vec::new();
                for value in &when.values {
                    collect_identifiers(value, self.code, &mut identifiers);
                }
                self.force_condition(&identifiers, true, perm);
                true
            }
            (None, _) => {
                let mut identifiers = Vec::new();
                for value in node.whens.iter().flat_map(|w| &w.values) {
                    collect_identifiers(value, self.code, &mut identifiers);
                }
                self.force_condition(&identifiers, false, perm);
                true
            }
        }
    }

    fn literal(&self, value: &Expr) -> String {
        match &value.kind {
            ExprKind::Str(s) => s.clone(),
            ExprKind::Sym(s) => format!(":{s}"),
            _ => value.span.text(self.code).trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(dir: &Path) -> CoverageRunner {
        let config = Config {
            artifact_dir: dir.to_path_buf(),
            ..Config::default()
        };
        CoverageRunner::new(config, Isolation::InProcess)
    }

    #[test]
    fn test_single_if_is_fully_covered() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path())
            .run("<% if show %>\nyes\n<% end %>\n", None, &Locals::new())
            .unwrap();
        assert!(!result.degraded);
        assert_eq!(result.permutation_count(), 2);
        assert_eq!(result.summary.branch_coverage, 100.0);
        assert_eq!(result.summary.line_coverage, 100.0);
        assert!(result.compiled_path.is_some());
    }

    #[test]
    fn test_no_branches_is_full_branch_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path()).run("plain <%= 1 %>", None, &Locals::new()).unwrap();
        assert_eq!(result.summary.total_branches, 0);
        assert_eq!(result.summary.branch_coverage, 100.0);
        assert_eq!(result.permutation_count(), 1);
    }

    #[test]
    fn test_failures_do_not_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let result = runner(dir.path())
            .run("<% if boom %><%= nil.explode %><% else %>ok<% end %>", None, &Locals::new())
            .unwrap();
        assert_eq!(result.permutation_count(), 2);
        assert_eq!(result.failed_outputs(), 1);
        assert!(!result.degraded);
    }

    #[test]
    fn test_spawn_failure_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            artifact_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let runner = CoverageRunner::new(
            config,
            Isolation::Subprocess {
                program: "/nonexistent/tmplcov".into(),
            },
        );
        let result = runner.run("<% if a %>x<% end %>", None, &Locals::new()).unwrap();
        assert!(result.degraded);
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.summary, CoverageSummary::default());
        assert_eq!(result.branches.len(), 1);
    }

    #[test]
    fn test_parse_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(runner(dir.path()).run("<%= (1 + %>", None, &Locals::new()).is_err());
    }

    #[test]
    fn test_targeted_permutations_raise_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            artifact_dir: dir.path().to_path_buf(),
            pairwise_limit: 0,
            triple_limit: 0,
            ..Config::default()
        };
        let runner = CoverageRunner::new(config, Isolation::InProcess);
        let source = "<% if z %><% if x || y %>A<% else %>B<% end %><% end %>";
        let first = runner.run(source, None, &Locals::new()).unwrap();
        assert!(first.summary.branch_coverage < 100.0);

        let extra = runner.targeted_permutations(source, &first).unwrap();
        assert!(!extra.is_empty());
        let second = runner.run_with_extra(source, None, &Locals::new(), extra).unwrap();
        assert!(second.summary.branch_coverage > first.summary.branch_coverage);
        assert_eq!(second.summary.branch_coverage, 100.0);
    }

    #[test]
    fn test_targeted_case_else_uses_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let source = "<% case kind %>\n<% when \"a\" %>A\n<% else %>Z\n<% end %>\n";
        let mut result = runner.run(source, None, &Locals::new()).unwrap();
        assert_eq!(result.summary.branch_coverage, 100.0);

        // Pretend the else arm was missed.
        let else_arm = result.arm_hits.iter().find(|a| a.arm == ArmKind::Else).unwrap();
        result.summary.uncovered_branches = vec![crate::model::UncoveredBranch {
            line: else_arm.line,
            kind: else_arm.kind,
            arm: else_arm.arm,
            site_id: else_arm.site_id,
            arm_id: else_arm.arm_id,
        }];
        let extra = runner.targeted_permutations(source, &result).unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].get("kind"), Some(&ForcedValue::Unmatched));
    }

    #[test]
    fn test_extra_duplicates_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let source = "<% if a %>x<% end %>";
        let analysis = runner.analyze(source).unwrap();
        let result = runner
            .run_with_extra(source, None, &Locals::new(), analysis.permutations.clone())
            .unwrap();
        assert_eq!(result.permutation_count(), analysis.permutations.len());
    }
}
