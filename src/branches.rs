//! Conditional branch extraction over compiled code.
//!
//! Every `if`/`unless`/ternary/modifier and `case` site becomes one
//! [`ConditionalBranch`] carrying the identifiers its condition reads, in the
//! dotted/bracketed path notation the binder understands.

use crate::error::{Error, Result};
use crate::lang::ast::{walk, AssignOp, ExprKind, Target};
use crate::lang::{parse_program, Expr, Program};
use crate::model::{BranchKind, ConditionalBranch, ForcedValue, Permutation};

/// Above this many variables the exhaustive cartesian product is refused.
pub const MAX_EXHAUSTIVE_VARIABLES: usize = 12;

/// Parsed compiled code plus the branch sites found in it.
#[derive(Debug, Clone)]
pub struct BranchExtractor {
    program: Program,
    branches: Vec<ConditionalBranch>,
}

impl BranchExtractor {
    /// Parse `source` and extract its branches. A parse failure is fatal.
    pub fn new(source: &str) -> Result<Self> {
        let program = parse_program(source)?;
        let branches = extract(&program, source);
        Ok(Self { program, branches })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn branches(&self) -> &[ConditionalBranch] {
        &self.branches
    }

    pub fn into_parts(self) -> (Program, Vec<ConditionalBranch>) {
        (self.program, self.branches)
    }

    /// Union of every branch's identifiers, first-seen order.
    #[must_use]
    pub fn conditional_variables(&self) -> Vec<String> {
        conditional_variables(&self.branches)
    }

    /// Every true/false combination over the conditional variables. Only a
    /// baseline: refuses more than [`MAX_EXHAUSTIVE_VARIABLES`] variables.
    pub fn generate_permutations(&self) -> Result<Vec<Permutation>> {
        let vars = self.conditional_variables();
        if vars.len() > MAX_EXHAUSTIVE_VARIABLES {
            return Err(Error::TooManyVariables {
                count: vars.len(),
                limit: MAX_EXHAUSTIVE_VARIABLES,
            });
        }
        let n = vars.len();
        Ok((0..1u32 << n)
            .map(|combo| {
                vars.iter()
                    .enumerate()
                    .map(|(j, var)| {
                        let bit = (combo >> (n - 1 - j)) & 1;
                        (var.clone(), ForcedValue::Bool(bit == 0))
                    })
                    .collect()
            })
            .collect())
    }
}

/// De-duplicated union of branch identifiers in first-seen order.
#[must_use]
pub fn conditional_variables(branches: &[ConditionalBranch]) -> Vec<String> {
    let mut vars = Vec::new();
    for branch in branches {
        for ident in &branch.identifiers {
            push_unique(&mut vars, ident.clone());
        }
    }
    vars
}

fn extract(program: &Program, source: &str) -> Vec<ConditionalBranch> {
    let mut branches = Vec::new();
    walk(&program.body, &mut |expr| match &expr.kind {
        ExprKind::If(node) => {
            let mut identifiers = Vec::new();
            collect_identifiers(&node.cond, source, &mut identifiers);
            branches.push(ConditionalBranch {
                kind: if node.negated {
                    BranchKind::Unless
                } else {
                    BranchKind::If
                },
                condition: node.cond.span.text(source).to_string(),
                identifiers,
                line: expr.line(),
                site_id: node.site,
            });
        }
        ExprKind::Case(node) => {
            let mut identifiers = Vec::new();
            let condition = match &node.subject {
                Some(subject) => {
                    collect_identifiers(subject, source, &mut identifiers);
                    subject.span.text(source).to_string()
                }
                None => {
                    for value in node.whens.iter().flat_map(|w| &w.values) {
                        collect_identifiers(value, source, &mut identifiers);
                    }
                    String::new()
                }
            };
            branches.push(ConditionalBranch {
                kind: BranchKind::Case,
                condition,
                identifiers,
                line: expr.line(),
                site_id: node.site,
            });
        }
        _ => {}
    });
    branches
}

pub(crate) fn push_unique(vars: &mut Vec<String>, ident: String) {
    if !vars.contains(&ident) {
        vars.push(ident);
    }
}

/// Collect the identifiers a condition expression reads.
pub fn collect_identifiers(expr: &Expr, source: &str, vars: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Ident(name) | ExprKind::IVar(name) | ExprKind::GVar(name) | ExprKind::Const(name) => {
            push_unique(vars, name.clone());
        }
        ExprKind::ConstPath(..) | ExprKind::Index { .. } => {
            push_unique(vars, call_path(expr, source));
        }
        ExprKind::Call(call) => {
            push_unique(vars, call_path(expr, source));
            for arg in &call.args {
                collect_identifiers(arg, source, vars);
            }
        }
        ExprKind::OpAssign {
            target,
            op: AssignOp::Or,
            ..
        } => {
            if let Some(path) = target_path(target, source) {
                push_unique(vars, path);
            }
        }
        // Negation reads the same identifiers as its operand.
        ExprKind::Not(inner) => collect_identifiers(inner, source, vars),
        ExprKind::And(l, r) | ExprKind::Or(l, r) => {
            collect_identifiers(l, source, vars);
            collect_identifiers(r, source, vars);
        }
        ExprKind::Paren(body) => {
            for stmt in body {
                collect_identifiers(stmt, source, vars);
            }
        }
        ExprKind::BlockPass(_) | ExprKind::SelfRef | ExprKind::Next | ExprKind::Break => {}
        _ if expr.is_literal() => {}
        _ => expr.for_each_child(&mut |child| collect_identifiers(child, source, vars)),
    }
}

/// Dotted/bracketed path of a receiver chain, e.g. `user.profile.active?` or
/// `params[:q].present?`. Receivers that are not names, calls or index reads
/// fall back to their source text.
#[must_use]
pub fn call_path(expr: &Expr, source: &str) -> String {
    match &expr.kind {
        ExprKind::Ident(name) | ExprKind::IVar(name) | ExprKind::GVar(name) | ExprKind::Const(name) => {
            name.clone()
        }
        ExprKind::SelfRef => "self".to_string(),
        ExprKind::Call(call) => match &call.receiver {
            Some(recv) => format!("{}.{}", call_path(recv, source), call.name),
            None => call.name.clone(),
        },
        ExprKind::Index { receiver, args } => {
            format!("{}[{}]", call_path(receiver, source), index_key(args, source))
        }
        _ => expr.span.text(source).trim().to_string(),
    }
}

fn index_key(args: &[Expr], source: &str) -> String {
    args.iter()
        .map(|arg| match &arg.kind {
            ExprKind::Sym(name) => format!(":{name}"),
            _ => arg.span.text(source).trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Path written by an or-assignment target (`flash[:notice]`, `o.attr`, `x`).
fn target_path(target: &Target, source: &str) -> Option<String> {
    match target {
        Target::Local(name) | Target::IVar(name) | Target::GVar(name) => Some(name.clone()),
        Target::Index { receiver, args } => Some(format!(
            "{}[{}]",
            call_path(receiver, source),
            index_key(args, source)
        )),
        Target::Attr { receiver, name } => Some(format!("{}.{}", call_path(receiver, source), name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(source: &str) -> Vec<String> {
        BranchExtractor::new(source).unwrap().conditional_variables()
    }

    #[test]
    fn test_predicate_chain_and_connectives() {
        assert_eq!(
            idents("if user.active? && user.premium?\nend"),
            vec!["user.active?", "user.premium?"]
        );
    }

    #[test]
    fn test_variable_kinds_keep_sigils() {
        assert_eq!(
            idents("if @shown || $debug || admin? || Feature::Flag.on?\nend"),
            vec!["@shown", "$debug", "admin?", "Feature::Flag.on?"]
        );
    }

    #[test]
    fn test_branch_kinds_and_conditions() {
        let extractor =
            BranchExtractor::new("unless items.any?\nend\ncase status\nwhen \"a\"\nend\nx = a ? 1 : 2")
                .unwrap();
        let branches = extractor.branches();
        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0].kind, BranchKind::Unless);
        assert_eq!(branches[0].condition, "items.any?");
        assert_eq!(branches[1].kind, BranchKind::Case);
        assert_eq!(branches[1].identifiers, vec!["status"]);
        assert_eq!(branches[2].kind, BranchKind::If);
        assert_eq!(branches[2].line, 6);
    }

    #[test]
    fn test_nested_branches_are_all_found() {
        let extractor = BranchExtractor::new("if a\n  if b\n  elsif c\n  end\nend").unwrap();
        let conditions: Vec<_> = extractor
            .branches()
            .iter()
            .map(|b| b.condition.as_str())
            .collect();
        assert_eq!(conditions, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_index_or_assign_in_condition() {
        assert_eq!(
            idents("if (flash[:notice] ||= \"default\")\nend\nif flash[:notice] ||= \"x\"\nend"),
            vec!["flash[:notice]"]
        );
    }

    #[test]
    fn test_attr_or_assign_in_condition() {
        assert_eq!(idents("if (form.title ||= \"x\")\nend"), vec!["form.title"]);
    }

    #[test]
    fn test_index_read_uses_brackets() {
        assert_eq!(
            idents("if params[:q].present? && session[\"id\"]\nend"),
            vec!["params[:q].present?", "session[\"id\"]"]
        );
    }

    #[test]
    fn test_operator_calls_and_arguments() {
        assert_eq!(
            idents("if count > limit && can?(:edit, post)\nend"),
            vec!["count.>", "limit", "can?", "post"]
        );
    }

    #[test]
    fn test_negation_is_transparent() {
        assert_eq!(idents("if !user.guest?\nend"), vec!["user.guest?"]);
        assert_eq!(idents("if not ready\nend"), vec!["ready"]);
    }

    #[test]
    fn test_literal_receiver_falls_back_to_source() {
        assert_eq!(
            idents("if [1, 2].include?(level)\nend"),
            vec!["[1, 2].include?", "level"]
        );
    }

    #[test]
    fn test_literal_condition_has_no_identifiers() {
        let extractor = BranchExtractor::new("if true\nend").unwrap();
        assert!(extractor.branches()[0].identifiers.is_empty());
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let source = "if a && b.c?\nend\nunless d\nend";
        let first = BranchExtractor::new(source).unwrap();
        let second = BranchExtractor::new(source).unwrap();
        assert_eq!(first.branches(), second.branches());
    }

    #[test]
    fn test_parse_failure_is_fatal() {
        assert!(BranchExtractor::new("if a\n").is_err());
    }

    #[test]
    fn test_generate_permutations_cartesian() {
        let extractor = BranchExtractor::new("if a && b\nend").unwrap();
        let perms = extractor.generate_permutations().unwrap();
        assert_eq!(perms.len(), 4);
        assert_eq!(perms[0].get("a"), Some(&ForcedValue::Bool(true)));
        assert_eq!(perms[0].get("b"), Some(&ForcedValue::Bool(true)));
        assert_eq!(perms[1].get("b"), Some(&ForcedValue::Bool(false)));
        assert_eq!(perms[3].get("a"), Some(&ForcedValue::Bool(false)));
    }

    #[test]
    fn test_generate_permutations_empty() {
        let extractor = BranchExtractor::new("x = 1").unwrap();
        assert_eq!(extractor.generate_permutations().unwrap(), vec![Permutation::new()]);
    }

    #[test]
    fn test_generate_permutations_refuses_large_sets() {
        let cond: Vec<String> = (0..=MAX_EXHAUSTIVE_VARIABLES).map(|i| format!("v{i}")).collect();
        let source = format!("if {}\nend", cond.join(" && "));
        let err = BranchExtractor::new(&source)
            .unwrap()
            .generate_permutations()
            .unwrap_err();
        assert!(matches!(err, Error::TooManyVariables { .. }));
    }
}
