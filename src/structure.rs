//! Structural analysis of the original template.
//!
//! The compiled form loses which tags belonged together; this pass walks the
//! tag tree from [`parse_template`] and re-parses each code fragment on its
//! own to recover `case` value sets, loop-variable conditions, computed
//! variables and string comparisons.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::branches::{call_path, push_unique};
use crate::lang::ast::{walk, AssignOp, Target};
use crate::lang::{parse_program, Expr, ExprKind, Program};
use crate::model::{
    BlockConditionalFact, CaseFact, ComputedVariableFact, StringComparisonFact, StructuralFacts,
};
use crate::template::{parse_template, ClauseKind, Control, ControlKind, Node};

static EACH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(@?[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\.\s*each(?:_with_index)?\s+do\s*\|\s*([A-Za-z_][A-Za-z0-9_]*)",
    )
    .unwrap()
});

static ITERATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap());

static QUOTED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"^(?s)["'](.*)["']$"#).unwrap());

/// Recover structural facts from template source. Never fails: an unreadable
/// template or fragment simply contributes nothing.
pub fn analyze(source: &str) -> StructuralFacts {
    let nodes = match parse_template(source) {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "template structure unreadable, no structural facts");
            return StructuralFacts::default();
        }
    };
    let mut analyzer = Analyzer::default();
    analyzer.visit_nodes(&nodes);
    debug!(
        cases = analyzer.facts.case_facts.len(),
        blocks = analyzer.facts.block_facts.len(),
        computed = analyzer.facts.computed_variables.len(),
        comparisons = analyzer.facts.string_comparisons.len(),
        "structural analysis complete"
    );
    analyzer.facts
}

#[derive(Default)]
struct Analyzer {
    facts: StructuralFacts,
}

impl Analyzer {
    fn visit_nodes(&mut self, nodes: &[Node]) {
        for node in nodes {
            match node {
                Node::Text(_) => {}
                Node::Code { code, line } | Node::Output { code, line } => self.fragment(code, *line),
                Node::Control(control) => self.control(control),
            }
        }
    }

    fn control(&mut self, control: &Control) {
        match control.kind {
            ControlKind::If | ControlKind::Unless => {
                self.fragment(&format!("{}\nend", control.head), control.line);
            }
            ControlKind::Case => {
                let subject = strip_keyword(&control.head, "case");
                if !subject.is_empty() {
                    let values: Vec<String> = control
                        .clauses
                        .iter()
                        .filter(|c| c.kind == ClauseKind::When)
                        .flat_map(|c| when_values(strip_keyword(&c.head, "when")))
                        .collect();
                    self.record_case(subject, values);
                    self.fragment(subject, control.line);
                }
            }
            ControlKind::Block => {
                self.block_control(control);
                let head = &control.head;
                let closed = [format!("{head}\nend"), format!("{head}\n}}")];
                match closed
                    .iter()
                    .find_map(|code| parse_program(code).ok().map(|program| (program, code)))
                {
                    Some((program, code)) => self.program(&program, code),
                    None => debug!(line = control.line, "skipping unparsable block head"),
                }
            }
        }

        self.visit_nodes(&control.body);
        for clause in &control.clauses {
            if clause.kind == ClauseKind::Elsif {
                let cond = strip_keyword(&clause.head, "elsif");
                self.fragment(&format!("if {cond}\nend"), clause.line);
            }
            self.visit_nodes(&clause.body);
        }
    }

    fn fragment(&mut self, code: &str, line: u32) {
        match parse_program(code) {
            Ok(program) => self.program(&program, code),
            Err(e) => debug!(line, error = %e, "skipping unparsable code fragment"),
        }
    }

    fn program(&mut self, program: &Program, source: &str) {
        walk(&program.body, &mut |expr| match &expr.kind {
            ExprKind::Assign { target, value } => {
                if let Target::Local(name) = target.as_ref() {
                    if is_complex(value) {
                        self.record_computed(name, value, source);
                    }
                }
            }
            ExprKind::OpAssign {
                target,
                op: AssignOp::Or,
                value,
            } => {
                if let Target::Local(name) = target.as_ref() {
                    if is_complex(value) {
                        self.record_computed(name, value, source);
                    }
                }
            }
            ExprKind::MultiAssign { targets, value } => {
                for target in targets {
                    if let Target::Local(name) = target {
                        self.record_computed(name, value, source);
                    }
                }
            }
            ExprKind::Case(node) => {
                if let Some(subject) = &node.subject {
                    let values = node
                        .whens
                        .iter()
                        .flat_map(|w| &w.values)
                        .map(|v| match &v.kind {
                            ExprKind::Str(s) => s.clone(),
                            ExprKind::Sym(s) => format!(":{s}"),
                            _ => v.span.text(source).trim().to_string(),
                        })
                        .collect();
                    self.record_case(subject.span.text(source).trim(), values);
                }
            }
            ExprKind::Call(call) => {
                if call.name == "==" && call.args.len() == 1 {
                    if let (ExprKind::Str(literal), Some(receiver)) = (&call.args[0].kind, &call.receiver) {
                        if let Some(subject) = comparison_subject(receiver, source) {
                            self.record_comparison(subject, literal);
                        }
                    }
                }
                if let (Some(block), Some(receiver)) = (&call.block, &call.receiver) {
                    if matches!(call.name.as_str(), "each" | "each_with_index") {
                        let iterator = call_path(receiver, source);
                        if let Some(variable) = block.params.first() {
                            if ITERATOR_RE.is_match(&iterator) {
                                let mut conditions = Vec::new();
                                loop_conditions(&block.body, variable, &mut conditions);
                                self.record_block(iterator, variable.clone(), conditions);
                            }
                        }
                    }
                }
            }
            _ => {}
        });
    }

    fn block_control(&mut self, control: &Control) {
        let Some(caps) = EACH_RE.captures(&control.head) else {
            return;
        };
        let iterator = caps[1].to_string();
        let variable = caps[2].to_string();
        let mut conditions = Vec::new();
        tree_loop_conditions(&control.body, &variable, &mut conditions);
        for clause in &control.clauses {
            tree_loop_conditions(&clause.body, &variable, &mut conditions);
        }
        self.record_block(iterator, variable, conditions);
    }

    fn record_case(&mut self, subject: &str, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        let index = match self.facts.case_facts.iter().position(|f| f.subject == subject) {
            Some(index) => index,
            None => {
                self.facts.case_facts.push(CaseFact {
                    subject: subject.to_string(),
                    values: Vec::new(),
                });
                self.facts.case_facts.len() - 1
            }
        };
        let fact = &mut self.facts.case_facts[index];
        for value in values {
            push_unique(&mut fact.values, value);
        }
    }

    fn record_block(&mut self, iterator: String, variable: String, conditions: Vec<String>) {
        if conditions.is_empty() {
            return;
        }
        match self
            .facts
            .block_facts
            .iter_mut()
            .find(|f| f.iterator == iterator && f.variable == variable)
        {
            Some(fact) => {
                for condition in conditions {
                    push_unique(&mut fact.conditions, condition);
                }
            }
            None => self.facts.block_facts.push(BlockConditionalFact {
                iterator,
                variable,
                conditions,
            }),
        }
    }

    fn record_computed(&mut self, name: &str, value: &Expr, source: &str) {
        let mut dependencies = Vec::new();
        predicate_dependencies(value, source, &mut dependencies);
        match self.facts.computed_variables.iter_mut().find(|f| f.name == name) {
            Some(fact) => {
                for dep in dependencies {
                    push_unique(&mut fact.dependencies, dep);
                }
            }
            None => self.facts.computed_variables.push(ComputedVariableFact {
                name: name.to_string(),
                dependencies,
            }),
        }
    }

    fn record_comparison(&mut self, subject: String, literal: &str) {
        match self
            .facts
            .string_comparisons
            .iter_mut()
            .find(|f| f.subject == subject)
        {
            Some(fact) => push_unique(&mut fact.values, literal.to_string()),
            None => self.facts.string_comparisons.push(StringComparisonFact {
                subject,
                values: vec![literal.to_string()],
            }),
        }
    }
}

fn strip_keyword<'a>(head: &'a str, keyword: &str) -> &'a str {
    head.strip_prefix(keyword).unwrap_or(head).trim()
}

/// Split a `when` clause's value list on top-level commas and normalize each
/// value: quoted strings are unquoted, symbols keep their colon, anything
/// else stays as written.
fn when_values(list: &str) -> Vec<String> {
    let list = list.trim();
    let list = match list.strip_suffix("then") {
        Some(rest) if rest.ends_with(char::is_whitespace) => rest.trim_end(),
        _ => list,
    };

    let mut values = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    for c in list.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                values.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    values.push(current);

    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| match QUOTED_RE.captures(v) {
            Some(caps) => caps[1].to_string(),
            None => v.to_string(),
        })
        .collect()
}

/// A right-hand side whose value comes from running code rather than a
/// literal or a plain variable read.
fn is_complex(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Call(call) => call.receiver.is_some() || !call.args.is_empty() || call.safe_nav,
        ExprKind::Index { .. }
        | ExprKind::Not(_)
        | ExprKind::If(_)
        | ExprKind::And(..)
        | ExprKind::Or(..) => true,
        ExprKind::Paren(body) => body.iter().any(is_complex),
        _ => {
            let mut found = false;
            expr.for_each_child(&mut |child| found = found || is_complex(child));
            found
        }
    }
}

fn is_predicate_name(name: &str) -> bool {
    name.ends_with('?')
        || name.contains("enabled")
        || name.contains("visible")
        || name.contains("writable")
}

/// Predicate-looking call paths read by a computed expression.
fn predicate_dependencies(expr: &Expr, source: &str, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::Call(call) => {
            if !call.operator && is_predicate_name(&call.name) {
                push_unique(out, call_path(expr, source));
            }
            if let Some(receiver) = &call.receiver {
                predicate_dependencies(receiver, source, out);
            }
            for arg in &call.args {
                predicate_dependencies(arg, source, out);
            }
        }
        ExprKind::Ident(name) if is_predicate_name(name) => push_unique(out, name.clone()),
        _ => expr.for_each_child(&mut |child| predicate_dependencies(child, source, out)),
    }
}

fn comparison_subject(receiver: &Expr, source: &str) -> Option<String> {
    match &receiver.kind {
        ExprKind::Ident(name) | ExprKind::IVar(name) => Some(name.clone()),
        ExprKind::Call(call) if !call.operator => Some(call_path(receiver, source)),
        ExprKind::Index { .. } => Some(call_path(receiver, source)),
        _ => None,
    }
}

/// `var.method` with no arguments, as tested by a loop-body conditional.
fn loop_variable_method(cond: &Expr, variable: &str) -> Option<String> {
    let ExprKind::Call(call) = &cond.kind else {
        return None;
    };
    if call.operator || !call.args.is_empty() || call.block.is_some() {
        return None;
    }
    match call.receiver.as_ref().map(|r| &r.kind) {
        Some(ExprKind::Ident(name)) if name == variable => Some(call.name.clone()),
        _ => None,
    }
}

/// Conditions on `variable` in parsed code, stopping at nested blocks.
fn loop_conditions(body: &[Expr], variable: &str, out: &mut Vec<String>) {
    fn visit(expr: &Expr, variable: &str, out: &mut Vec<String>) {
        if let ExprKind::If(node) = &expr.kind {
            if let Some(method) = loop_variable_method(&node.cond, variable) {
                push_unique(out, method);
            }
        }
        match &expr.kind {
            ExprKind::Call(call) if call.block.is_some() => {
                if let Some(receiver) = &call.receiver {
                    visit(receiver, variable, out);
                }
                for arg in &call.args {
                    visit(arg, variable, out);
                }
            }
            _ => expr.for_each_child(&mut |child| visit(child, variable, out)),
        }
    }
    for expr in body {
        visit(expr, variable, out);
    }
}

/// Conditions on `variable` in a block's tag tree, stopping at nested blocks.
fn tree_loop_conditions(nodes: &[Node], variable: &str, out: &mut Vec<String>) {
    let head_condition = |cond: &str, out: &mut Vec<String>| {
        if let Ok(program) = parse_program(cond) {
            if let [expr] = program.body.as_slice() {
                if let Some(method) = loop_variable_method(expr, variable) {
                    push_unique(out, method);
                }
            }
        }
    };

    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Code { code, .. } | Node::Output { code, .. } => {
                if let Ok(program) = parse_program(code) {
                    loop_conditions(&program.body, variable, out);
                }
            }
            Node::Control(control) => {
                match control.kind {
                    ControlKind::Block => continue,
                    ControlKind::If => head_condition(strip_keyword(&control.head, "if"), out),
                    ControlKind::Unless => head_condition(strip_keyword(&control.head, "unless"), out),
                    ControlKind::Case => {}
                }
                tree_loop_conditions(&control.body, variable, out);
                for clause in &control.clauses {
                    if clause.kind == ClauseKind::Elsif {
                        head_condition(strip_keyword(&clause.head, "elsif"), out);
                    }
                    tree_loop_conditions(&clause.body, variable, out);
                }
            }
        }
    }
}
