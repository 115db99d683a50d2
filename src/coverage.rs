//! Static coverage map of a compiled program and the hit counts recorded
//! against it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::lang::{Expr, ExprKind, Program};
use crate::model::{percent, ArmHit, ArmKind, BranchKind, CoverageSummary, UncoveredBranch};

/// Raw line and arm hit counts, summed across permutations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hits {
    pub lines: BTreeMap<u32, u64>,
    pub arms: BTreeMap<u32, u64>,
}

impl Hits {
    pub fn hit_line(&mut self, line: u32) {
        *self.lines.entry(line).or_default() += 1;
    }

    pub fn hit_arm(&mut self, arm_id: u32) {
        *self.arms.entry(arm_id).or_default() += 1;
    }

    pub fn merge(&mut self, other: &Hits) {
        for (line, count) in &other.lines {
            *self.lines.entry(*line).or_default() += count;
        }
        for (arm, count) in &other.arms {
            *self.arms.entry(*arm).or_default() += count;
        }
    }
}

/// One arm of one branch site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmSite {
    pub arm_id: u32,
    pub site_id: u32,
    pub line: u32,
    pub kind: BranchKind,
    pub arm: ArmKind,
}

/// Executable lines and branch arms of a program.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    lines: BTreeSet<u32>,
    arms: Vec<ArmSite>,
    index: HashMap<(u32, ArmKind), u32>,
}

impl CoverageMap {
    pub fn from_program(program: &Program) -> Self {
        let mut map = CoverageMap::default();
        map.statements(&program.body);
        crate::lang::ast::walk(&program.body, &mut |expr| match &expr.kind {
            ExprKind::If(node) => {
                let kind = if node.negated {
                    BranchKind::Unless
                } else {
                    BranchKind::If
                };
                map.add_arm(node.site, expr.line(), kind, ArmKind::Then);
                map.add_arm(node.site, expr.line(), kind, ArmKind::Else);
            }
            ExprKind::Case(node) => {
                for i in 0..node.whens.len() {
                    map.add_arm(node.site, expr.line(), BranchKind::Case, ArmKind::When(i as u32));
                }
                map.add_arm(node.site, expr.line(), BranchKind::Case, ArmKind::Else);
            }
            _ => {}
        });
        map
    }

    fn add_arm(&mut self, site_id: u32, line: u32, kind: BranchKind, arm: ArmKind) {
        let arm_id = self.arms.len() as u32;
        self.index.insert((site_id, arm), arm_id);
        self.arms.push(ArmSite {
            arm_id,
            site_id,
            line,
            kind,
            arm,
        });
    }

    fn statements(&mut self, body: &[Expr]) {
        for stmt in body {
            self.lines.insert(stmt.line());
            self.nested(stmt);
        }
    }

    fn nested(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::If(node) => {
                self.nested(&node.cond);
                self.statements(&node.then_body);
                if let Some(body) = &node.else_body {
                    self.statements(body);
                }
            }
            ExprKind::Case(node) => {
                if let Some(subject) = &node.subject {
                    self.nested(subject);
                }
                for when in &node.whens {
                    when.values.iter().for_each(|v| self.nested(v));
                    self.statements(&when.body);
                }
                if let Some(body) = &node.else_body {
                    self.statements(body);
                }
            }
            ExprKind::Call(call) => {
                if let Some(receiver) = &call.receiver {
                    self.nested(receiver);
                }
                call.args.iter().for_each(|a| self.nested(a));
                if let Some(block) = &call.block {
                    self.statements(&block.body);
                }
            }
            _ => expr.for_each_child(&mut |child| self.nested(child)),
        }
    }

    pub fn executable_lines(&self) -> &BTreeSet<u32> {
        &self.lines
    }

    pub fn arms(&self) -> &[ArmSite] {
        &self.arms
    }

    pub fn arm_id(&self, site_id: u32, arm: ArmKind) -> Option<u32> {
        self.index.get(&(site_id, arm)).copied()
    }

    /// Hit count for every executable line, zero included.
    pub fn line_hits(&self, hits: &Hits) -> BTreeMap<u32, u64> {
        self.lines
            .iter()
            .map(|line| (*line, hits.lines.get(line).copied().unwrap_or(0)))
            .collect()
    }

    pub fn arm_hits(&self, hits: &Hits) -> Vec<ArmHit> {
        self.arms
            .iter()
            .map(|site| ArmHit {
                site_id: site.site_id,
                arm_id: site.arm_id,
                line: site.line,
                kind: site.kind,
                arm: site.arm,
                hits: hits.arms.get(&site.arm_id).copied().unwrap_or(0),
            })
            .collect()
    }

    /// Percentages and uncovered items. Nothing to cover counts as 100%.
    pub fn summarize(&self, hits: &Hits) -> CoverageSummary {
        let line_hits = self.line_hits(hits);
        let covered_lines = line_hits.values().filter(|&&c| c > 0).count() as u64;
        let uncovered_lines: Vec<u32> = line_hits
            .iter()
            .filter(|(_, &c)| c == 0)
            .map(|(line, _)| *line)
            .collect();

        let arm_hits = self.arm_hits(hits);
        let covered_branches = arm_hits.iter().filter(|a| a.hits > 0).count() as u64;
        let uncovered_branches = arm_hits
            .iter()
            .filter(|a| a.hits == 0)
            .map(|a| UncoveredBranch {
                line: a.line,
                kind: a.kind,
                arm: a.arm,
                site_id: a.site_id,
                arm_id: a.arm_id,
            })
            .collect();

        let total_lines = line_hits.len() as u64;
        let total_branches = arm_hits.len() as u64;
        CoverageSummary {
            line_coverage: percent(covered_lines, total_lines),
            branch_coverage: percent(covered_branches, total_branches),
            total_lines,
            covered_lines,
            total_branches,
            covered_branches,
            uncovered_lines,
            uncovered_branches,
        }
    }
}
