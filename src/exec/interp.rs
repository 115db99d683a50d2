//! Tree-walking evaluator for compiled templates.
//!
//! Records a line hit per executed statement and an arm hit per taken
//! branch arm, against the ids of a [`CoverageMap`].

use std::cmp::Ordering;
use std::collections::HashMap;

use super::builtins::Helper;
use super::context::ExecutionContext;
use super::value::{case_eq, values_eq, MockOp, MockObject, MockValue, Seed, Value, SIZE_LIMIT};
use crate::compiler::OUT_CALL;
use crate::coverage::{CoverageMap, Hits};
use crate::error::RenderError;
use crate::lang::ast::{AssignOp, Block, Call, CaseExpr, IfExpr, StrPart, Target};
use crate::lang::{Expr, ExprKind, Program};
use crate::model::ArmKind;

/// Statements executed before a render is abandoned.
pub const STEP_LIMIT: u64 = 1_000_000;

/// Non-local exits unwinding through evaluation.
#[derive(Debug)]
enum Interrupt {
    Error(RenderError),
    Next(Value),
    Break(Value),
}

impl From<RenderError> for Interrupt {
    fn from(e: RenderError) -> Self {
        Interrupt::Error(e)
    }
}

impl Interrupt {
    fn at_line(self, line: u32) -> Self {
        match self {
            Interrupt::Error(e) => Interrupt::Error(e.at_line(line)),
            other => other,
        }
    }
}

type Eval = Result<Value, Interrupt>;
type MaybeEval = Result<Option<Value>, Interrupt>;

/// Something a method can yield to.
#[derive(Debug, Clone)]
enum Callable<'p> {
    Block(&'p Block),
    /// `&:name`
    Symbol(String),
}

/// An assignable location, with receiver and arguments already evaluated.
enum Place {
    Local(String),
    Var(String),
    Index(Value, Vec<Value>),
    Attr(Value, String),
}

/// Render `program` against `ctx`, returning the output (or the error that
/// stopped it) and the hits recorded up to that point.
pub fn render(
    program: &Program,
    map: &CoverageMap,
    ctx: &mut ExecutionContext,
) -> (Result<String, RenderError>, Hits) {
    let mut interp = Interpreter {
        map,
        ctx,
        out: vec![String::new()],
        scopes: vec![HashMap::new()],
        hits: Hits::default(),
        steps: 0,
    };
    let result = match interp.exec_body(&program.body) {
        Ok(_) => Ok(interp.out.pop().unwrap_or_default()),
        Err(Interrupt::Error(e)) => Err(e),
        Err(Interrupt::Next(_) | Interrupt::Break(_)) => {
            Err(RenderError::new("Invalid next or break outside of a block"))
        }
    };
    (result, interp.hits)
}

struct Interpreter<'p, 'c> {
    map: &'p CoverageMap,
    ctx: &'c mut ExecutionContext,
    /// Output buffers; the last one is written to.
    out: Vec<String>,
    scopes: Vec<HashMap<String, Value>>,
    hits: Hits,
    steps: u64,
}

fn error(message: impl Into<String>) -> Interrupt {
    Interrupt::Error(RenderError::new(message))
}

fn no_method(name: &str, recv: &Value) -> Interrupt {
    let target = match recv.resolved() {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("an instance of {}", other.type_name()),
    };
    error(format!("undefined method '{name}' for {target}"))
}

fn blank(value: &Value) -> bool {
    match value.resolved() {
        Value::Nil | Value::Bool(false) => true,
        Value::Str(s) => s.trim().is_empty(),
        Value::Array(items) => items.borrow().is_empty(),
        Value::Hash(pairs) => pairs.borrow().is_empty(),
        _ => false,
    }
}

/// Ordering used by `sort`, `min`, `max` and the comparison operators.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.resolved(), b.resolved()) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.to_f()?.partial_cmp(&b.to_f()?)
        }
        (Value::Str(x), Value::Str(y)) | (Value::Sym(x), Value::Sym(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            for (p, q) in x.iter().zip(y.iter()) {
                match compare(p, q)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => None,
    }
}

fn compare_or_fail(a: &Value, b: &Value) -> Result<Ordering, Interrupt> {
    compare(a, b).ok_or_else(|| {
        error(format!(
            "comparison of {} with {} failed",
            a.type_name(),
            b.inspect()
        ))
    })
}

fn index_of(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    (0..len as i64).contains(&idx).then_some(idx as usize)
}

/// Ruby-style slice bounds for `start, length` or a range.
fn slice_bounds(len: usize, start: i64, count: i64) -> Option<(usize, usize)> {
    let start = if start < 0 { len as i64 + start } else { start };
    if start < 0 || start > len as i64 || count < 0 {
        return None;
    }
    let end = start.saturating_add(count).min(len as i64);
    Some((start as usize, end as usize))
}

fn range_slice(len: usize, start: i64, end: i64, exclusive: bool) -> Option<(usize, usize)> {
    let s = if start < 0 { len as i64 + start } else { start };
    let mut e = if end < 0 { len as i64 + end } else { end };
    if !exclusive {
        e = e.saturating_add(1);
    }
    slice_bounds(len, s, e.saturating_sub(s).max(0))
}

fn overflow(op: &str, a: i64) -> Interrupt {
    error(format!("integer overflow in {op} of {a}"))
}

impl<'p, 'c> Interpreter<'p, 'c> {
    fn write(&mut self, text: &str) {
        if let Some(buf) = self.out.last_mut() {
            buf.push_str(text);
        }
    }

    fn exec_body(&mut self, body: &'p [Expr]) -> Eval {
        let mut last = Value::Nil;
        for stmt in body {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(error("execution step limit exceeded").at_line(stmt.line()));
            }
            self.hits.hit_line(stmt.line());
            last = self.eval(stmt).map_err(|e| e.at_line(stmt.line()))?;
        }
        Ok(last)
    }

    fn hit_arm(&mut self, site: u32, arm: ArmKind) {
        if let Some(id) = self.map.arm_id(site, arm) {
            self.hits.hit_arm(id);
        }
    }

    fn local(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn set_local(&mut self, name: String, value: Value) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(&name) {
                *slot = value;
                return;
            }
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, value);
        }
    }

    fn eval(&mut self, expr: &'p Expr) -> Eval {
        match &expr.kind {
            ExprKind::Nil => Ok(Value::Nil),
            ExprKind::True => Ok(Value::Bool(true)),
            ExprKind::False => Ok(Value::Bool(false)),
            ExprKind::SelfRef => Ok(Value::mock("self")),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Sym(s) => Ok(Value::Sym(s.clone())),
            ExprKind::Interp(parts) => {
                let mut s = String::new();
                for part in parts {
                    match part {
                        StrPart::Lit(lit) => s.push_str(lit),
                        StrPart::Code(code) => s.push_str(&self.eval(code)?.to_s()),
                    }
                }
                Ok(Value::Str(s))
            }
            ExprKind::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::array(items))
            }
            ExprKind::Hash(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((self.eval(k)?, self.eval(v)?));
                }
                Ok(Value::hash(out))
            }
            ExprKind::Range {
                start,
                end,
                exclusive,
            } => {
                let (s, e) = (self.eval(start)?, self.eval(end)?);
                match (s.resolved(), e.resolved()) {
                    (Value::Int(s), Value::Int(e)) => Ok(Value::Range {
                        start: *s,
                        end: *e,
                        exclusive: *exclusive,
                    }),
                    _ => Err(error("bad value for range")),
                }
            }
            ExprKind::Ident(name) => match self.local(name) {
                Some(value) => Ok(value.clone()),
                None => self.call_function(name, Vec::new(), None),
            },
            ExprKind::IVar(name) | ExprKind::GVar(name) => Ok(self.ctx.resolve(name)),
            ExprKind::Const(name) => Ok(self
                .ctx
                .lookup(name)
                .cloned()
                .unwrap_or_else(|| Value::Const(name.clone()))),
            ExprKind::ConstPath(parent, name) => {
                let parent = self.eval(parent)?;
                match parent.resolved() {
                    Value::Const(path) => {
                        let full = format!("{path}::{name}");
                        Ok(self.ctx.lookup(&full).cloned().unwrap_or(Value::Const(full)))
                    }
                    _ => self.call_method(parent, name, Vec::new(), None),
                }
            }
            ExprKind::Call(call) => self.eval_call(call),
            ExprKind::Index { receiver, args } => {
                let recv = self.eval(receiver)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call_method(recv, "[]", args, None)
            }
            ExprKind::And(l, r) => {
                let left = self.eval(l)?;
                if left.truthy() {
                    self.eval(r)
                } else {
                    Ok(left)
                }
            }
            ExprKind::Or(l, r) => {
                let left = self.eval(l)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.eval(r)
                }
            }
            ExprKind::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.truthy())),
            ExprKind::If(node) => self.eval_if(node),
            ExprKind::Case(node) => self.eval_case(node),
            ExprKind::Assign { target, value } => {
                let value = self.eval(value)?;
                let place = self.place(target)?;
                self.write_place(place, value.clone())?;
                Ok(value)
            }
            ExprKind::OpAssign { target, op, value } => self.eval_op_assign(target, *op, value),
            ExprKind::MultiAssign { targets, value } => {
                let value = self.eval(value)?;
                let items = match value.resolved() {
                    Value::Array(items) => items.borrow().clone(),
                    _ => vec![value.clone()],
                };
                for (i, target) in targets.iter().enumerate() {
                    let place = self.place(target)?;
                    self.write_place(place, items.get(i).cloned().unwrap_or(Value::Nil))?;
                }
                Ok(value)
            }
            ExprKind::Paren(body) => {
                let mut last = Value::Nil;
                for stmt in body {
                    last = self.eval(stmt)?;
                }
                Ok(last)
            }
            ExprKind::BlockPass(_) => Err(error("block argument outside of a call")),
            ExprKind::Next => Err(Interrupt::Next(Value::Nil)),
            ExprKind::Break => Err(Interrupt::Break(Value::Nil)),
        }
    }

    fn eval_if(&mut self, node: &'p IfExpr) -> Eval {
        let cond = self.eval(&node.cond)?.truthy();
        let take_then = cond != node.negated;
        if take_then {
            self.hit_arm(node.site, ArmKind::Then);
            self.exec_body(&node.then_body)
        } else {
            self.hit_arm(node.site, ArmKind::Else);
            match &node.else_body {
                Some(body) => self.exec_body(body),
                None => Ok(Value::Nil),
            }
        }
    }

    fn eval_case(&mut self, node: &'p CaseExpr) -> Eval {
        let subject = match &node.subject {
            Some(subject) => Some(self.eval(subject)?),
            None => None,
        };
        for (i, when) in node.whens.iter().enumerate() {
            for value in &when.values {
                let pattern = self.eval(value)?;
                let matched = match &subject {
                    Some(subject) => case_eq(&pattern, subject),
                    None => pattern.truthy(),
                };
                if matched {
                    self.hit_arm(node.site, ArmKind::When(i as u32));
                    return self.exec_body(&when.body);
                }
            }
        }
        self.hit_arm(node.site, ArmKind::Else);
        match &node.else_body {
            Some(body) => self.exec_body(body),
            None => Ok(Value::Nil),
        }
    }

    fn eval_op_assign(&mut self, target: &'p Target, op: AssignOp, value: &'p Expr) -> Eval {
        let place = self.place(target)?;
        let current = self.read_place(&place)?;
        let truthy = current.as_ref().is_some_and(Value::truthy);
        let next = match op {
            AssignOp::Or if truthy => current.unwrap_or(Value::Nil),
            AssignOp::And if !truthy => return Ok(current.unwrap_or(Value::Nil)),
            AssignOp::Or | AssignOp::And => self.eval(value)?,
            AssignOp::Add | AssignOp::Sub => {
                let rhs = self.eval(value)?;
                let name = if op == AssignOp::Add { "+" } else { "-" };
                self.call_method(current.unwrap_or(Value::Nil), name, vec![rhs], None)?
            }
        };
        self.write_place(place, next.clone())?;
        Ok(next)
    }

    fn place(&mut self, target: &'p Target) -> Result<Place, Interrupt> {
        Ok(match target {
            Target::Local(name) => Place::Local(name.clone()),
            Target::IVar(name) | Target::GVar(name) => Place::Var(name.clone()),
            Target::Index { receiver, args } => {
                let recv = self.eval(receiver)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                Place::Index(recv, args)
            }
            Target::Attr { receiver, name } => Place::Attr(self.eval(receiver)?, name.clone()),
        })
    }

    /// Current value of a place; `None` for an unassigned variable. An
    /// unassigned local falls back to a context binding of the same name.
    fn read_place(&mut self, place: &Place) -> Result<Option<Value>, Interrupt> {
        Ok(match place {
            Place::Local(name) => self
                .local(name)
                .or_else(|| self.ctx.lookup(name))
                .cloned(),
            Place::Var(name) => self.ctx.lookup(name).cloned(),
            Place::Index(recv, args) => Some(self.call_method(recv.clone(), "[]", args.clone(), None)?),
            Place::Attr(recv, name) => Some(self.call_method(recv.clone(), name, Vec::new(), None)?),
        })
    }

    fn write_place(&mut self, place: Place, value: Value) -> Result<(), Interrupt> {
        match place {
            Place::Local(name) => self.set_local(name, value),
            Place::Var(name) => self.ctx.bind(name, value),
            Place::Index(recv, mut args) => {
                args.push(value);
                self.call_method(recv, "[]=", args, None)?;
            }
            Place::Attr(recv, name) => {
                self.call_method(recv, &format!("{name}="), vec![value], None)?;
            }
        }
        Ok(())
    }

    fn eval_args(
        &mut self,
        args: &'p [Expr],
        block: Option<&'p Block>,
    ) -> Result<(Vec<Value>, Option<Callable<'p>>), Interrupt> {
        let mut values = Vec::with_capacity(args.len());
        let mut callable = block.map(Callable::Block);
        for arg in args {
            match &arg.kind {
                ExprKind::BlockPass(inner) => match &inner.kind {
                    ExprKind::Sym(name) => callable = Some(Callable::Symbol(name.clone())),
                    _ => return Err(error("unsupported block argument")),
                },
                _ => values.push(self.eval(arg)?),
            }
        }
        Ok((values, callable))
    }

    fn eval_call(&mut self, call: &'p Call) -> Eval {
        let receiver = match &call.receiver {
            Some(r) => Some(self.eval(r)?),
            None => None,
        };
        let (args, block) = self.eval_args(&call.args, call.block.as_ref())?;
        let has_block = block.is_some();
        let result = match receiver {
            None => self.call_function(&call.name, args, block),
            Some(recv) if call.safe_nav && matches!(recv.resolved(), Value::Nil) => Ok(Value::Nil),
            Some(recv) => self.call_method(recv, &call.name, args, block),
        };
        match result {
            // `break` leaves the method its block was given to.
            Err(Interrupt::Break(value)) if has_block => Ok(value),
            other => other,
        }
    }

    /// Receiverless call: output, bindings, helpers, then the mock fallback.
    fn call_function(&mut self, name: &str, args: Vec<Value>, block: Option<Callable<'p>>) -> Eval {
        if name == OUT_CALL {
            let text = args.first().map(Value::to_s).unwrap_or_default();
            self.write(&text);
            return Ok(Value::Nil);
        }
        if let Some(value) = self.ctx.lookup(name) {
            return Ok(value.clone());
        }
        if let Some(helper) = Helper::lookup(name) {
            let captured = match &block {
                Some(b) if helper.captures_block() => Some(self.capture(b, Vec::new())?),
                _ => None,
            };
            return Ok(helper.call(&args, captured, self.ctx)?);
        }
        match name {
            "block_given?" => Ok(Value::Bool(false)),
            "raise" => Err(error(
                args.first()
                    .map_or_else(|| "unhandled exception".to_string(), Value::to_s),
            )),
            _ => Ok(self.ctx.missing(name)),
        }
    }

    /// Run a block with its output going to a fresh buffer, returning that
    /// buffer (or the block's string value when it wrote nothing).
    fn capture(&mut self, block: &Callable<'p>, args: Vec<Value>) -> Result<String, Interrupt> {
        self.out.push(String::new());
        let result = self.call_block(block, args);
        let buf = self.out.pop().unwrap_or_default();
        let value = result?;
        Ok(match value.resolved() {
            Value::Str(s) if buf.is_empty() => s.clone(),
            _ => buf,
        })
    }

    fn call_block(&mut self, callable: &Callable<'p>, args: Vec<Value>) -> Eval {
        match callable {
            Callable::Symbol(name) => {
                let mut args = args.into_iter();
                let recv = args.next().unwrap_or(Value::Nil);
                self.call_method(recv, name, args.collect(), None)
            }
            Callable::Block(block) => {
                // A single array argument spreads over several parameters.
                let spread = match (block.params.len(), args.as_slice()) {
                    (n, [single]) if n > 1 => match single.resolved() {
                        Value::Array(items) => Some(items.borrow().clone()),
                        _ => None,
                    },
                    _ => None,
                };
                let args = spread.unwrap_or(args);
                let scope = block
                    .params
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.clone(), args.get(i).cloned().unwrap_or(Value::Nil)))
                    .collect();
                self.scopes.push(scope);
                let result = self.exec_body(&block.body);
                self.scopes.pop();
                match result {
                    Err(Interrupt::Next(value)) => Ok(value),
                    other => other,
                }
            }
        }
    }

    fn call_method(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Callable<'p>>,
    ) -> Eval {
        match recv {
            Value::Mock(MockValue {
                seed: Seed::Seeded(inner),
                ..
            }) => self.call_method(*inner, name, args, block),
            Value::Mock(mock) => Ok(mock.answer(MockOp::for_member(name), name, &args)),
            Value::Object(obj) => self.object_method(obj, name, args, block),
            Value::Const(path) => Ok(const_method(&path, name, &args)),
            other => {
                if let Some(value) = self.common_method(&other, name, &args, block.as_ref())? {
                    return Ok(value);
                }
                let found = match &other {
                    Value::Int(_) | Value::Float(_) => self.numeric_method(&other, name, &args, block.as_ref())?,
                    Value::Str(s) => string_method(s, name, &args)?,
                    Value::Sym(s) => symbol_method(s, name),
                    Value::Bool(b) => bool_method(*b, name, &args),
                    Value::Nil => nil_method(name),
                    Value::Hash(_) => match self.hash_method(&other, name, &args, block.as_ref())? {
                        Some(value) => Some(value),
                        None => self.enumerable_method(&other, name, &args, block.as_ref())?,
                    },
                    _ => self.enumerable_method(&other, name, &args, block.as_ref())?,
                };
                found.ok_or_else(|| no_method(name, &other))
            }
        }
    }

    fn object_method(
        &mut self,
        obj: std::rc::Rc<MockObject>,
        name: &str,
        args: Vec<Value>,
        block: Option<Callable<'p>>,
    ) -> Eval {
        if let Some(value) = obj.method(name) {
            return Ok(value.clone());
        }
        if name == "[]" {
            let key = args.first().cloned().unwrap_or(Value::Nil);
            return Ok(match obj.key(&key) {
                Some(value) => value.clone(),
                None => Value::mock(format!("{}[{}]", obj.label, key.inspect())),
            });
        }
        if let Some(items) = obj.items.clone() {
            let list = Value::array(items);
            if let Some(value) = self.enumerable_method(&list, name, &args, block.as_ref())? {
                return Ok(match name {
                    "each" | "each_with_index" => Value::Object(obj),
                    _ => value,
                });
            }
        }
        let this = Value::Object(obj.clone());
        Ok(match name {
            "==" | "eql?" | "equal?" => Value::Bool(args.first().is_some_and(|a| values_eq(&this, a))),
            "!=" => Value::Bool(!args.first().is_some_and(|a| values_eq(&this, a))),
            "[]=" => args.last().cloned().unwrap_or(Value::Nil),
            n if n.ends_with('=') && !n.starts_with(['=', '<', '>', '!']) => {
                args.first().cloned().unwrap_or(Value::Nil)
            }
            "presence" | "itself" => this,
            _ => MockValue::unseeded(obj.label.clone()).answer(MockOp::for_member(name), name, &args),
        })
    }

    /// Methods every plain value answers.
    fn common_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Callable<'p>>,
    ) -> MaybeEval {
        let arg0 = args.first();
        Ok(Some(match name {
            "nil?" => Value::Bool(matches!(recv, Value::Nil)),
            "to_s" => Value::Str(recv.to_s()),
            "inspect" => Value::Str(recv.inspect()),
            "==" | "eql?" | "equal?" => Value::Bool(arg0.is_some_and(|a| values_eq(recv, a))),
            "!=" => Value::Bool(!arg0.is_some_and(|a| values_eq(recv, a))),
            "!" => Value::Bool(!recv.truthy()),
            "===" => Value::Bool(arg0.is_some_and(|a| case_eq(recv, a))),
            "present?" => Value::Bool(!blank(recv)),
            "blank?" => Value::Bool(blank(recv)),
            "presence" => {
                if blank(recv) {
                    Value::Nil
                } else {
                    recv.clone()
                }
            }
            "respond_to?" => Value::Bool(true),
            "is_a?" | "kind_of?" | "instance_of?" => Value::Bool(match arg0.map(Value::resolved) {
                Some(Value::Const(path)) => {
                    let class = path.rsplit("::").next().unwrap_or(path);
                    class == recv.type_name() || class == "Object"
                }
                _ => false,
            }),
            "class" => Value::Const(recv.type_name().to_string()),
            "freeze" | "dup" | "clone" | "itself" | "html_safe" | "to_param" => recv.clone(),
            "in?" => Value::Bool(
                arg0.and_then(Value::items)
                    .is_some_and(|items| items.iter().any(|i| values_eq(i, recv))),
            ),
            "then" | "yield_self" => match block {
                Some(b) => self.call_block(b, vec![recv.clone()])?,
                None => recv.clone(),
            },
            "tap" => {
                if let Some(b) = block {
                    self.call_block(b, vec![recv.clone()])?;
                }
                recv.clone()
            }
            "try" => match recv {
                Value::Nil => Value::Nil,
                _ => {
                    let method = arg0.map(Value::to_s).unwrap_or_default();
                    self.call_method(recv.clone(), &method, args[1.min(args.len())..].to_vec(), None)?
                }
            },
            _ => return Ok(None),
        }))
    }

    fn numeric_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Callable<'p>>,
    ) -> MaybeEval {
        if let Some(arg) = args.first() {
            // A mock operand coerces the receiver into a mock.
            if arg.is_unseeded_mock()
                && matches!(name, "+" | "-" | "*" | "/" | "%" | "**" | "<" | ">" | "<=" | ">=" | "<=>")
            {
                let coerced = MockValue {
                    label: None,
                    seed: Seed::Unseeded,
                };
                return Ok(Some(coerced.answer(MockOp::for_member(name), name, args)));
            }
            match name {
                "+" | "-" | "*" | "/" | "%" | "**" => return arithmetic(recv, name, arg).map(Some),
                "<" | ">" | "<=" | ">=" => {
                    let ord = compare_or_fail(recv, arg)?;
                    return Ok(Some(Value::Bool(match name {
                        "<" => ord == Ordering::Less,
                        ">" => ord == Ordering::Greater,
                        "<=" => ord != Ordering::Greater,
                        _ => ord != Ordering::Less,
                    })));
                }
                "<=>" => {
                    return Ok(Some(compare(recv, arg).map_or(Value::Nil, |o| Value::Int(o as i64))));
                }
                _ => {}
            }
        }
        let int = match recv.resolved() {
            Value::Int(i) => Some(*i),
            _ => None,
        };
        let float = recv.to_f().unwrap_or(0.0);
        Ok(Some(match name {
            "-@" => match int {
                Some(i) => Value::Int(i.checked_neg().ok_or_else(|| overflow("-@", i))?),
                None => Value::Float(-float),
            },
            "to_i" | "to_int" | "floor" | "truncate" => Value::Int(int.unwrap_or(float.floor() as i64)),
            "ceil" => Value::Int(int.unwrap_or(float.ceil() as i64)),
            "round" => Value::Int(int.unwrap_or(float.round() as i64)),
            "to_f" => Value::Float(float),
            "abs" => match int {
                Some(i) => Value::Int(i.checked_abs().ok_or_else(|| overflow("abs", i))?),
                None => Value::Float(float.abs()),
            },
            "zero?" => Value::Bool(float == 0.0),
            "positive?" => Value::Bool(float > 0.0),
            "negative?" => Value::Bool(float < 0.0),
            "even?" => Value::Bool(int.is_some_and(|i| i % 2 == 0)),
            "odd?" => Value::Bool(int.is_some_and(|i| i % 2 != 0)),
            "succ" | "next" => {
                let i = int.unwrap_or(0);
                Value::Int(i.checked_add(1).ok_or_else(|| overflow(name, i))?)
            }
            "pred" => {
                let i = int.unwrap_or(0);
                Value::Int(i.checked_sub(1).ok_or_else(|| overflow(name, i))?)
            }
            "between?" => {
                let (lo, hi) = (args.first().cloned().unwrap_or(Value::Nil), args.get(1).cloned().unwrap_or(Value::Nil));
                Value::Bool(
                    compare_or_fail(recv, &lo)? != Ordering::Less
                        && compare_or_fail(recv, &hi)? != Ordering::Greater,
                )
            }
            "times" => {
                let n = int.unwrap_or(0).max(0);
                let range = Value::Range {
                    start: 0,
                    end: n,
                    exclusive: true,
                };
                match self.enumerable_method(&range, "each", &[], block)? {
                    Some(_) => recv.clone(),
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        }))
    }

    fn hash_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Callable<'p>>,
    ) -> MaybeEval {
        let Value::Hash(pairs) = recv else {
            return Ok(None);
        };
        let arg0 = args.first().cloned().unwrap_or(Value::Nil);
        let get = |key: &Value| {
            pairs
                .borrow()
                .iter()
                .find(|(k, _)| values_eq(k, key))
                .map(|(_, v)| v.clone())
        };
        Ok(Some(match name {
            "[]" => get(&arg0).unwrap_or(Value::Nil),
            "fetch" => match get(&arg0) {
                Some(value) => value,
                None => match (args.get(1), block) {
                    (Some(default), _) => default.clone(),
                    (None, Some(b)) => self.call_block(b, vec![arg0])?,
                    (None, None) => return Err(error(format!("key not found: {}", arg0.inspect()))),
                },
            },
            "dig" => {
                let mut current = recv.clone();
                for key in args {
                    if matches!(current.resolved(), Value::Nil) {
                        break;
                    }
                    current = self.call_method(current, "[]", vec![key.clone()], None)?;
                }
                current
            }
            "key?" | "has_key?" | "include?" | "member?" => Value::Bool(get(&arg0).is_some()),
            "keys" => Value::array(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
            "values" => Value::array(pairs.borrow().iter().map(|(_, v)| v.clone()).collect()),
            "[]=" | "store" => {
                let value = args.get(1).cloned().unwrap_or(Value::Nil);
                let mut pairs = pairs.borrow_mut();
                match pairs.iter_mut().find(|(k, _)| values_eq(k, &arg0)) {
                    Some(slot) => slot.1 = value.clone(),
                    None => pairs.push((arg0, value.clone())),
                }
                value
            }
            "merge" => {
                let mut merged = pairs.borrow().clone();
                if let Value::Hash(other) = arg0.resolved() {
                    for (k, v) in other.borrow().iter() {
                        match merged.iter_mut().find(|(mk, _)| values_eq(mk, k)) {
                            Some(slot) => slot.1 = v.clone(),
                            None => merged.push((k.clone(), v.clone())),
                        }
                    }
                }
                Value::hash(merged)
            }
            "each" | "each_pair" => {
                let Some(b) = block else { return Ok(None) };
                let snapshot = pairs.borrow().clone();
                for (k, v) in snapshot {
                    self.call_block(b, vec![k, v])?;
                }
                recv.clone()
            }
            "to_h" | "symbolize_keys" | "with_indifferent_access" => recv.clone(),
            _ => return Ok(None),
        }))
    }

    /// Methods over the items of arrays, ranges and hashes.
    fn enumerable_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Callable<'p>>,
    ) -> MaybeEval {
        if let Value::Range { start, end, .. } = recv.resolved() {
            if end.saturating_sub(*start) >= SIZE_LIMIT as i64 {
                return Err(error("range too large to enumerate"));
            }
        }
        let Some(items) = recv.items() else {
            return Ok(None);
        };
        let arg0 = args.first().cloned().unwrap_or(Value::Nil);
        let count = items.len();

        if let Some(b) = block {
            let value = match name {
                "each" => {
                    for item in items {
                        self.call_block(b, vec![item])?;
                    }
                    recv.clone()
                }
                "each_with_index" => {
                    for (i, item) in items.into_iter().enumerate() {
                        self.call_block(b, vec![item, Value::Int(i as i64)])?;
                    }
                    recv.clone()
                }
                "each_with_object" => {
                    for item in items {
                        self.call_block(b, vec![item, arg0.clone()])?;
                    }
                    arg0
                }
                "each_slice" => {
                    let size = arg0.to_i().unwrap_or(1).max(1) as usize;
                    for chunk in items.chunks(size) {
                        self.call_block(b, vec![Value::array(chunk.to_vec())])?;
                    }
                    Value::Nil
                }
                "map" | "collect" | "flat_map" | "filter_map" => {
                    let mut out = Vec::with_capacity(count);
                    for item in items {
                        let mapped = self.call_block(b, vec![item])?;
                        match (name, mapped.resolved()) {
                            ("flat_map", Value::Array(inner)) => out.extend(inner.borrow().iter().cloned()),
                            ("filter_map", _) if !mapped.truthy() => {}
                            _ => out.push(mapped),
                        }
                    }
                    Value::array(out)
                }
                "select" | "filter" | "reject" => {
                    let keep = name != "reject";
                    let mut out = Vec::new();
                    for item in items {
                        if self.call_block(b, vec![item.clone()])?.truthy() == keep {
                            out.push(item);
                        }
                    }
                    Value::array(out)
                }
                "find" | "detect" => {
                    for item in items {
                        if self.call_block(b, vec![item.clone()])?.truthy() {
                            return Ok(Some(item));
                        }
                    }
                    Value::Nil
                }
                "any?" | "all?" | "none?" | "count" => {
                    let mut hits = 0usize;
                    for item in items {
                        if self.call_block(b, vec![item])?.truthy() {
                            hits += 1;
                        }
                    }
                    match name {
                        "any?" => Value::Bool(hits > 0),
                        "all?" => Value::Bool(hits == count),
                        "none?" => Value::Bool(hits == 0),
                        _ => Value::Int(hits as i64),
                    }
                }
                "sort_by" | "min_by" | "max_by" => {
                    let mut keyed = Vec::with_capacity(count);
                    for item in items {
                        keyed.push((self.call_block(b, vec![item.clone()])?, item));
                    }
                    let mut failed = None;
                    keyed.sort_by(|(a, _), (b, _)| {
                        compare(a, b).unwrap_or_else(|| {
                            failed.get_or_insert_with(|| (a.clone(), b.clone()));
                            Ordering::Equal
                        })
                    });
                    if let Some((a, b)) = failed {
                        compare_or_fail(&a, &b)?;
                    }
                    match name {
                        "min_by" => keyed.first().map_or(Value::Nil, |(_, v)| v.clone()),
                        "max_by" => keyed.last().map_or(Value::Nil, |(_, v)| v.clone()),
                        _ => Value::array(keyed.into_iter().map(|(_, v)| v).collect()),
                    }
                }
                "group_by" | "partition" => {
                    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
                    for item in items {
                        let key = self.call_block(b, vec![item.clone()])?;
                        let key = if name == "partition" { Value::Bool(key.truthy()) } else { key };
                        match groups.iter_mut().find(|(k, _)| values_eq(k, &key)) {
                            Some((_, group)) => group.push(item),
                            None => groups.push((key, vec![item])),
                        }
                    }
                    if name == "partition" {
                        let take = |flag: bool| {
                            groups
                                .iter()
                                .find(|(k, _)| values_eq(k, &Value::Bool(flag)))
                                .map_or_else(Vec::new, |(_, g)| g.clone())
                        };
                        Value::array(vec![Value::array(take(true)), Value::array(take(false))])
                    } else {
                        Value::hash(groups.into_iter().map(|(k, g)| (k, Value::array(g))).collect())
                    }
                }
                "inject" | "reduce" | "sum" => {
                    let mut iter = items.into_iter();
                    let mut acc = match (args.first(), name) {
                        (Some(init), _) => init.clone(),
                        (None, "sum") => Value::Int(0),
                        (None, _) => iter.next().unwrap_or(Value::Nil),
                    };
                    for item in iter {
                        acc = if name == "sum" {
                            let mapped = self.call_block(b, vec![item])?;
                            self.call_method(acc, "+", vec![mapped], None)?
                        } else {
                            self.call_block(b, vec![acc, item])?
                        };
                    }
                    acc
                }
                _ => return Ok(None),
            };
            return Ok(Some(value));
        }

        Ok(Some(match name {
            "each" | "map" | "collect" | "each_with_index" | "select" | "filter" => {
                Value::array(items.clone())
            }
            "to_a" | "entries" => Value::array(items),
            "size" | "length" | "count" if args.is_empty() => Value::Int(count as i64),
            "count" => Value::Int(items.iter().filter(|i| values_eq(i, &arg0)).count() as i64),
            "empty?" => Value::Bool(items.is_empty()),
            "any?" => Value::Bool(items.iter().any(Value::truthy)),
            "all?" => Value::Bool(items.iter().all(Value::truthy)),
            "none?" => Value::Bool(!items.iter().any(Value::truthy)),
            "first" | "last" if args.is_empty() => {
                let item = if name == "first" { items.first() } else { items.last() };
                item.cloned().unwrap_or(Value::Nil)
            }
            "first" | "take" => {
                let n = arg0.to_i().unwrap_or(0).max(0) as usize;
                Value::array(items.into_iter().take(n).collect())
            }
            "last" => {
                let n = arg0.to_i().unwrap_or(0).max(0) as usize;
                Value::array(items[count.saturating_sub(n)..].to_vec())
            }
            "drop" => {
                let n = arg0.to_i().unwrap_or(0).max(0) as usize;
                Value::array(items.into_iter().skip(n).collect())
            }
            "include?" | "member?" | "cover?" => Value::Bool(items.iter().any(|i| values_eq(i, &arg0))),
            "join" => {
                let sep = match arg0.resolved() {
                    Value::Nil => String::new(),
                    other => other.to_s(),
                };
                Value::Str(items.iter().map(Value::to_s).collect::<Vec<_>>().join(&sep))
            }
            "compact" => Value::array(
                items
                    .into_iter()
                    .filter(|i| !matches!(i.resolved(), Value::Nil))
                    .collect(),
            ),
            "flatten" => {
                let mut out = Vec::new();
                flatten_into(&items, &mut out);
                Value::array(out)
            }
            "uniq" => {
                let mut out: Vec<Value> = Vec::new();
                for item in items {
                    if !out.iter().any(|o| values_eq(o, &item)) {
                        out.push(item);
                    }
                }
                Value::array(out)
            }
            "reverse" => Value::array(items.into_iter().rev().collect()),
            "sort" | "min" | "max" => {
                let mut sorted = items;
                for pair in sorted.windows(2) {
                    compare_or_fail(&pair[0], &pair[1])?;
                }
                sorted.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
                match name {
                    "min" => sorted.first().cloned().unwrap_or(Value::Nil),
                    "max" => sorted.last().cloned().unwrap_or(Value::Nil),
                    _ => Value::array(sorted),
                }
            }
            "sum" => {
                let mut acc = args.first().cloned().unwrap_or(Value::Int(0));
                for item in items {
                    acc = self.call_method(acc, "+", vec![item], None)?;
                }
                acc
            }
            "sample" => items.first().cloned().unwrap_or(Value::Nil),
            "+" => match arg0.items() {
                Some(more) if matches!(arg0.resolved(), Value::Array(_)) => {
                    Value::array(items.into_iter().chain(more).collect())
                }
                _ => return Err(error(format!("no implicit conversion of {} into Array", arg0.type_name()))),
            },
            "-" => {
                let remove = arg0.items().unwrap_or_default();
                Value::array(
                    items
                        .into_iter()
                        .filter(|i| !remove.iter().any(|r| values_eq(r, i)))
                        .collect(),
                )
            }
            "[]" => match (arg0.resolved(), args.get(1)) {
                (Value::Int(start), Some(len)) => slice_of(&items, slice_bounds(count, *start, len.to_i().unwrap_or(0))),
                (Value::Int(i), None) => index_of(*i, count).map_or(Value::Nil, |i| items[i].clone()),
                (
                    Value::Range {
                        start,
                        end,
                        exclusive,
                    },
                    None,
                ) => slice_of(&items, range_slice(count, *start, *end, *exclusive)),
                _ => return Err(error(format!("no implicit conversion of {} into Integer", arg0.type_name()))),
            },
            "[]=" | "push" | "<<" | "append" | "pop" | "shift" | "unshift" | "concat" => {
                let Value::Array(cell) = recv.resolved() else {
                    return Ok(None);
                };
                let mut list = cell.borrow_mut();
                match name {
                    "[]=" => {
                        let value = args.get(1).cloned().unwrap_or(Value::Nil);
                        let idx = arg0.to_i().unwrap_or(0);
                        let idx = if idx < 0 { list.len() as i64 + idx } else { idx };
                        if idx < 0 {
                            return Err(error(format!("index {} too small for array", arg0.to_s())));
                        }
                        let idx = idx as usize;
                        if idx >= SIZE_LIMIT {
                            return Err(error(format!("index {idx} too big for array")));
                        }
                        if idx >= list.len() {
                            list.resize(idx + 1, Value::Nil);
                        }
                        list[idx] = value.clone();
                        return Ok(Some(value));
                    }
                    "pop" => return Ok(Some(list.pop().unwrap_or(Value::Nil))),
                    "shift" => {
                        return Ok(Some(if list.is_empty() {
                            Value::Nil
                        } else {
                            list.remove(0)
                        }))
                    }
                    "unshift" => {
                        for (i, v) in args.iter().enumerate() {
                            list.insert(i, v.clone());
                        }
                    }
                    "concat" => {
                        for arg in args {
                            list.extend(arg.items().unwrap_or_default());
                        }
                    }
                    _ => list.extend(args.iter().cloned()),
                }
                recv.clone()
            }
            _ => return Ok(None),
        }))
    }
}

fn slice_of(items: &[Value], bounds: Option<(usize, usize)>) -> Value {
    bounds.map_or(Value::Nil, |(s, e)| Value::array(items[s..e].to_vec()))
}

fn flatten_into(items: &[Value], out: &mut Vec<Value>) {
    for item in items {
        match item.resolved() {
            Value::Array(inner) => flatten_into(&inner.borrow(), out),
            _ => out.push(item.clone()),
        }
    }
}

fn arithmetic(recv: &Value, op: &str, arg: &Value) -> Eval {
    match (recv.resolved(), arg.resolved()) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            if matches!(op, "/" | "%") && b == 0 {
                return Err(error("divided by 0"));
            }
            let value = match op {
                "+" => a.checked_add(b),
                "-" => a.checked_sub(b),
                "*" => a.checked_mul(b),
                "/" => a.checked_div(b).map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }),
                "%" => a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
                _ => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            };
            value
                .map(Value::Int)
                .ok_or_else(|| error(format!("integer overflow in {a} {op} {b}")))
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (a, b) = (recv.to_f().unwrap_or(0.0), arg.to_f().unwrap_or(0.0));
            Ok(Value::Float(match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                "%" => a - b * (a / b).floor(),
                _ => a.powf(b),
            }))
        }
        _ => Err(error(format!(
            "{} can't be coerced into {}",
            arg.type_name(),
            recv.type_name()
        ))),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> MaybeEval {
    let arg0 = args.first().cloned().unwrap_or(Value::Nil);
    let arg_str = || match arg0.resolved() {
        Value::Str(a) => Ok(a.clone()),
        Value::Mock(_) | Value::Object(_) => Ok(arg0.to_s()),
        other => Err(error(format!(
            "no implicit conversion of {} into String",
            other.type_name()
        ))),
    };
    Ok(Some(match name {
        "+" | "concat" | "<<" => Value::Str(format!("{s}{}", arg_str()?)),
        "*" => {
            let times = arg0.to_i().unwrap_or(0);
            if times < 0 {
                return Err(error("negative argument"));
            }
            let times = usize::try_from(times).unwrap_or(usize::MAX);
            match s.len().checked_mul(times) {
                Some(size) if size <= SIZE_LIMIT => Value::Str(s.repeat(times)),
                _ => return Err(error("argument too big")),
            }
        }
        "<" | ">" | "<=" | ">=" => {
            let ord = compare_or_fail(&Value::str(s), &arg0)?;
            Value::Bool(match name {
                "<" => ord == Ordering::Less,
                ">" => ord == Ordering::Greater,
                "<=" => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
        "<=>" => compare(&Value::str(s), &arg0).map_or(Value::Nil, |o| Value::Int(o as i64)),
        "length" | "size" => Value::Int(s.chars().count() as i64),
        "empty?" => Value::Bool(s.is_empty()),
        "upcase" => Value::Str(s.to_uppercase()),
        "downcase" => Value::Str(s.to_lowercase()),
        "capitalize" => Value::Str(capitalize(&s.to_lowercase())),
        "titleize" => Value::Str(
            s.split(['_', ' '])
                .filter(|w| !w.is_empty())
                .map(capitalize)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        "humanize" => Value::Str(capitalize(&s.replace('_', " ").to_lowercase())),
        "parameterize" => Value::Str(
            s.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join("-"),
        ),
        "strip" => Value::Str(s.trim().to_string()),
        "squish" => Value::Str(s.split_whitespace().collect::<Vec<_>>().join(" ")),
        "chomp" => Value::Str(s.strip_suffix('\n').unwrap_or(s).to_string()),
        "reverse" => Value::Str(s.chars().rev().collect()),
        "include?" => Value::Bool(s.contains(arg_str()?.as_str())),
        "start_with?" | "end_with?" => {
            let mut found = false;
            for arg in args {
                let prefix = arg.to_s();
                found |= if name == "start_with?" {
                    s.starts_with(&prefix)
                } else {
                    s.ends_with(&prefix)
                };
            }
            Value::Bool(found)
        }
        "split" => {
            let parts: Vec<Value> = match arg0.resolved() {
                Value::Nil => s.split_whitespace().map(Value::str).collect(),
                other => s.split(other.to_s().as_str()).map(Value::str).collect(),
            };
            Value::array(parts)
        }
        "chars" => Value::array(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        "lines" => Value::array(s.split_inclusive('\n').map(Value::str).collect()),
        "to_sym" => Value::Sym(s.to_string()),
        "to_str" => Value::str(s),
        "to_i" => Value::Int(Value::str(s).to_i().unwrap_or(0)),
        "to_f" => Value::Float(Value::str(s).to_f().unwrap_or(0.0)),
        "gsub" | "sub" => {
            let pattern = arg0.to_s();
            let replacement = args.get(1).map(Value::to_s).unwrap_or_default();
            Value::Str(if name == "gsub" {
                s.replace(&pattern, &replacement)
            } else {
                s.replacen(&pattern, &replacement, 1)
            })
        }
        "truncate" => {
            let n = arg0.to_i().unwrap_or(30).max(0) as usize;
            if s.chars().count() <= n {
                Value::str(s)
            } else {
                let keep: String = s.chars().take(n.saturating_sub(3)).collect();
                Value::Str(format!("{keep}..."))
            }
        }
        "pluralize" => Value::Str(format!("{s}s")),
        "[]" => {
            let chars: Vec<char> = s.chars().collect();
            let bounds = match (arg0.resolved(), args.get(1)) {
                (Value::Int(start), Some(len)) => slice_bounds(chars.len(), *start, len.to_i().unwrap_or(0)),
                (Value::Int(i), None) => index_of(*i, chars.len()).map(|i| (i, i + 1)),
                (
                    Value::Range {
                        start,
                        end,
                        exclusive,
                    },
                    None,
                ) => range_slice(chars.len(), *start, *end, *exclusive),
                (Value::Str(sub), None) => {
                    return Ok(Some(if s.contains(sub.as_str()) {
                        Value::str(sub.clone())
                    } else {
                        Value::Nil
                    }))
                }
                _ => return Err(error("no implicit conversion into Integer")),
            };
            bounds.map_or(Value::Nil, |(a, b)| Value::Str(chars[a..b].iter().collect()))
        }
        "=~" | "match" => Value::Nil,
        "match?" => Value::Bool(false),
        _ => return Ok(None),
    }))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn symbol_method(s: &str, name: &str) -> Option<Value> {
    Some(match name {
        "to_sym" => Value::Sym(s.to_string()),
        "length" | "size" => Value::Int(s.chars().count() as i64),
        "upcase" => Value::Sym(s.to_uppercase()),
        "downcase" => Value::Sym(s.to_lowercase()),
        "empty?" => Value::Bool(s.is_empty()),
        _ => return None,
    })
}

fn bool_method(b: bool, name: &str, args: &[Value]) -> Option<Value> {
    let other = args.first().is_some_and(Value::truthy);
    Some(Value::Bool(match name {
        "&" => b && other,
        "|" => b || other,
        "^" => b != other,
        _ => return None,
    }))
}

fn nil_method(name: &str) -> Option<Value> {
    Some(match name {
        "to_a" => Value::array(Vec::new()),
        "to_h" => Value::hash(Vec::new()),
        "to_i" => Value::Int(0),
        "to_f" => Value::Float(0.0),
        "&" => Value::Bool(false),
        _ => return None,
    })
}

/// Members of a constant stub.
fn const_method(path: &str, name: &str, args: &[Value]) -> Value {
    match name {
        "new" => Value::mock(path),
        "name" | "to_s" => Value::str(path),
        "==" => Value::Bool(args.first().is_some_and(|a| values_eq(&Value::Const(path.to_string()), a))),
        "===" => Value::Bool(args.first().is_some_and(|a| case_eq(&Value::Const(path.to_string()), a))),
        _ => Value::mock(format!("{path}.{name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_program;

    fn run_with(code: &str, ctx: &mut ExecutionContext) -> (Result<String, RenderError>, Hits, CoverageMap) {
        let program = parse_program(code).unwrap();
        let map = CoverageMap::from_program(&program);
        let (result, hits) = render(&program, &map, ctx);
        (result, hits, map)
    }

    fn out(code: &str) -> String {
        run_with(code, &mut ExecutionContext::new()).0.unwrap()
    }

    fn err(code: &str) -> RenderError {
        run_with(code, &mut ExecutionContext::new()).0.unwrap_err()
    }

    #[test]
    fn test_output_and_interpolation() {
        assert_eq!(out("__out(\"a\"); x = 2; __out((\"n=#{x + 1}\"))"), "an=3");
    }

    #[test]
    fn test_unbound_names_are_chainable_mocks() {
        let mut ctx = ExecutionContext::new();
        let (result, _, _) = run_with("__out((user.profile.name)); __out((@items.count))", &mut ctx);
        assert_eq!(result.unwrap(), "[mock:user.profile.name]0");
        assert_eq!(ctx.accessed_mocks(), ["user", "@items"]);
    }

    #[test]
    fn test_unless_any_on_mock_takes_body() {
        let (result, hits, map) = run_with(
            "unless items.any?\n  __out(\"empty\")\nend",
            &mut ExecutionContext::new(),
        );
        assert_eq!(result.unwrap(), "empty");
        let then_arm = map.arm_id(0, ArmKind::Then).unwrap();
        assert_eq!(hits.arms.get(&then_arm), Some(&1));
        assert_eq!(hits.lines.get(&2), Some(&1));
    }

    #[test]
    fn test_if_else_arms() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("show", Value::Bool(false));
        let (result, hits, map) = run_with("if show\n__out(\"y\")\nelse\n__out(\"n\")\nend", &mut ctx);
        assert_eq!(result.unwrap(), "n");
        assert!(hits.arms.contains_key(&map.arm_id(0, ArmKind::Else).unwrap()));
        assert!(!hits.arms.contains_key(&map.arm_id(0, ArmKind::Then).unwrap()));
    }

    #[test]
    fn test_case_arms() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("status", Value::str("b"));
        let code = "case status\nwhen \"a\" then __out(\"A\")\nwhen \"b\", \"c\" then __out(\"B\")\nelse __out(\"?\")\nend";
        let (result, hits, map) = run_with(code, &mut ctx);
        assert_eq!(result.unwrap(), "B");
        assert!(hits.arms.contains_key(&map.arm_id(0, ArmKind::When(1)).unwrap()));

        let (result, _, _) = run_with(code, &mut ExecutionContext::new());
        assert_eq!(result.unwrap(), "?");
    }

    #[test]
    fn test_block_iteration_and_scoping() {
        assert_eq!(
            out("total = 0; [1, 2, 3].each do |n| total += n end; __out((total))"),
            "6"
        );
        assert_eq!(out("__out(([1, 2, 3].map { |n| n * 2 }.join(\",\")))"), "2,4,6");
        assert_eq!(out("__out(([\"a\", \"b\"].map(&:upcase).join))"), "AB");
        assert_eq!(out("[1, 2].each_with_index do |n, i| __out((\"#{i}:#{n} \")) end"), "0:1 1:2 ");
    }

    #[test]
    fn test_next_and_break() {
        assert_eq!(
            out("[1, 2, 3].each do |n|\nnext if n == 2\n__out((n))\nend"),
            "13"
        );
        assert_eq!(out("x = [1, 2, 3].each do |n|\nbreak if n == 2\n__out((n))\nend\n__out((x.inspect))"), "1nil");
    }

    #[test]
    fn test_object_items_iterate() {
        let mut ctx = ExecutionContext::new();
        let mut item = MockObject::new("item");
        item.methods.insert("in_stock?".into(), Value::Bool(false));
        let mut products = MockObject::new("@products");
        products.items = Some(vec![Value::Object(std::rc::Rc::new(item))]);
        ctx.bind("@products", Value::Object(std::rc::Rc::new(products)));
        let code = "@products.each do |p|\nif p.in_stock?\n__out(\"in\")\nelse\n__out(\"out\")\nend\nend";
        assert_eq!(run_with(code, &mut ctx).0.unwrap(), "out");
    }

    #[test]
    fn test_or_assign_consults_bindings() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("title", Value::str("Bound"));
        assert_eq!(run_with("title ||= \"Default\"\n__out((title))", &mut ctx).0.unwrap(), "Bound");
        assert_eq!(out("title ||= \"Default\"\n__out((title))"), "Default");
    }

    #[test]
    fn test_hash_and_array_access() {
        assert_eq!(out("h = { a: 1 }; h[:b] ||= 2; __out((h[:a] + h[:b]))"), "3");
        assert_eq!(out("a = [1, 2, 3]; __out((a[-1])); __out((a[0, 2].inspect))"), "3[1, 2]");
        assert_eq!(out("first, second = [1, 2]; __out((second))"), "2");
    }

    #[test]
    fn test_helpers_and_shadowing() {
        assert_eq!(out("__out((link_to(\"Home\", \"/\")))"), "<a href=\"/\">Home</a>");
        assert_eq!(out("x = capture do __out(\"inner\") end; __out((x.upcase))"), "INNER");
        let mut ctx = ExecutionContext::new();
        ctx.bind("t", Value::str("shadowed"));
        assert_eq!(run_with("__out((t(\"key\")))", &mut ctx).0.unwrap(), "shadowed");
    }

    #[test]
    fn test_const_stubs() {
        assert_eq!(out("__out((Feature::Flag.on?))"), "[mock:Feature::Flag.on?]");
        assert_eq!(out("__out((User.new))"), "[mock:User]");
    }

    #[test]
    fn test_errors_carry_backtrace() {
        let e = err("x = 1\n\ny = nil.upcase");
        assert_eq!(e.message, "undefined method 'upcase' for nil");
        assert_eq!(e.backtrace, vec!["compiled:3"]);

        let e = err("[1].each do |n|\n  n / 0\nend");
        assert_eq!(e.message, "divided by 0");
        assert_eq!(e.backtrace, vec!["compiled:2", "compiled:1"]);
    }

    #[test]
    fn test_errors_keep_partial_hits() {
        let (result, hits, _) = run_with("__out(\"a\")\nnil.foo\n__out(\"b\")", &mut ExecutionContext::new());
        assert!(result.is_err());
        assert_eq!(hits.lines.get(&1), Some(&1));
        assert_eq!(hits.lines.get(&2), Some(&1));
        assert_eq!(hits.lines.get(&3), None);
    }

    #[test]
    fn test_step_limit() {
        let e = err("(1..1500).each do |i|\n(1..1000).each do |j|\nx = j\nend\nend");
        assert!(e.message.contains("step limit"));
        let e = err("(1..10000000000).each do |i| end");
        assert!(e.message.contains("too large"));
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let min = "(0 - 9223372036854775807 - 1)";
        for code in [
            format!("__out(({min} / -1))"),
            format!("__out(({min} % -1))"),
            format!("__out(({min}.abs))"),
            format!("__out((-{min}))"),
            "__out((9223372036854775807.succ))".to_string(),
            "__out((9223372036854775807 + 1))".to_string(),
        ] {
            assert!(err(&code).message.contains("integer overflow"), "{code}");
        }
        assert_eq!(out("__out((9223372036854775806 % 9223372036854775807))"), "9223372036854775806");
        assert_eq!(out("__out((-1 % 9223372036854775807))"), "9223372036854775806");
    }

    #[test]
    fn test_extreme_slices_clamp() {
        assert_eq!(out("__out(([1, 2][1, 9223372036854775807].inspect))"), "[2]");
        assert_eq!(out("__out(([1, 2][0..9223372036854775807].inspect))"), "[1, 2]");
        assert_eq!(out("__out((\"abc\"[1, 9223372036854775807]))"), "bc");
    }

    #[test]
    fn test_oversized_values_are_errors() {
        assert_eq!(err("__out((\"ab\" * 9223372036854775807))").message, "argument too big");
        assert_eq!(err("__out((\"ab\" * -1))").message, "negative argument");
        assert_eq!(out("__out((\"ab\" * 3))"), "ababab");
        assert!(err("a = [1]\na[100000000000] = 1").message.contains("too big"));
        assert!(err("__out(([1] + (1..9223372036854775807).to_a).size)").message.contains("too large"));
    }

    #[test]
    fn test_safe_navigation_and_numeric() {
        assert_eq!(out("x = nil; __out((x&.name.inspect))"), "nil");
        assert_eq!(out("__out((7 / 2)); __out((-7 / 2)); __out((7 % -3)); __out((2 ** 10))"), "3-4-21024");
        assert_eq!(out("__out((1.5 + 1))"), "2.5");
    }

    #[test]
    fn test_seeded_values_delegate() {
        let mut ctx = ExecutionContext::new();
        ctx.bind("role", Value::Mock(MockValue::seeded("role", Value::str("admin"))));
        let code = "if role == \"admin\"\n__out((role.upcase))\nend";
        assert_eq!(run_with(code, &mut ctx).0.unwrap(), "ADMIN");
    }
}
