//! Syntax tree for the embedded code layer.
//!
//! Operators other than the boolean connectives are plain [`Call`]s on their
//! left operand (`a == b` is `a.==(b)`), which keeps evaluation and identifier
//! collection uniform.

/// Byte-offset span plus the 1-based line the node starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32) -> Self {
        Self { start, end, line }
    }

    /// Span from the start of `self` to the end of `other`.
    #[must_use]
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end.max(self.end),
            line: self.line,
        }
    }

    /// Source text covered by this span.
    pub fn text(self, source: &str) -> &str {
        source.get(self.start..self.end).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Expr>,
    /// Number of branch sites; site ids are `0..site_count` in parse order.
    pub site_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn line(&self) -> u32 {
        self.span.line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    True,
    False,
    SelfRef,
    Int(i64),
    Float(f64),
    Str(String),
    /// Double-quoted string with `#{}` interpolation.
    Interp(Vec<StrPart>),
    Sym(String),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        exclusive: bool,
    },
    /// Bare name: a local read or a receiverless call without arguments.
    Ident(String),
    IVar(String),
    GVar(String),
    Const(String),
    ConstPath(Box<Expr>, String),
    Call(Box<Call>),
    Index {
        receiver: Box<Expr>,
        args: Vec<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    If(Box<IfExpr>),
    Case(Box<CaseExpr>),
    Assign {
        target: Box<Target>,
        value: Box<Expr>,
    },
    OpAssign {
        target: Box<Target>,
        op: AssignOp,
        value: Box<Expr>,
    },
    MultiAssign {
        targets: Vec<Target>,
        value: Box<Expr>,
    },
    /// `( stmt; stmt )`
    Paren(Vec<Expr>),
    /// `&:sym` or `&block` in an argument list.
    BlockPass(Box<Expr>),
    Next,
    Break,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(String),
    Code(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub receiver: Option<Expr>,
    pub name: String,
    pub args: Vec<Expr>,
    pub block: Option<Block>,
    pub safe_nav: bool,
    /// Binary or unary operator call (`a + b`, `-a`).
    pub operator: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub params: Vec<String>,
    pub body: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfForm {
    Block,
    Elsif,
    Ternary,
    Modifier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfExpr {
    pub form: IfForm,
    /// `unless` rather than `if`.
    pub negated: bool,
    pub cond: Expr,
    pub then_body: Vec<Expr>,
    pub else_body: Option<Vec<Expr>>,
    pub site: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhenClause {
    pub values: Vec<Expr>,
    pub body: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseExpr {
    pub subject: Option<Expr>,
    pub whens: Vec<WhenClause>,
    pub else_body: Option<Vec<Expr>>,
    pub site: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Local(String),
    IVar(String),
    GVar(String),
    Index { receiver: Expr, args: Vec<Expr> },
    Attr { receiver: Expr, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Or,
    And,
    Add,
    Sub,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Or => "||=",
            AssignOp::And => "&&=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
        }
    }
}

impl Expr {
    /// Visit every direct child expression, including block bodies and
    /// assignment target receivers.
    pub fn for_each_child<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match &self.kind {
            ExprKind::Nil
            | ExprKind::True
            | ExprKind::False
            | ExprKind::SelfRef
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Sym(_)
            | ExprKind::Ident(_)
            | ExprKind::IVar(_)
            | ExprKind::GVar(_)
            | ExprKind::Const(_)
            | ExprKind::Next
            | ExprKind::Break => {}
            ExprKind::Interp(parts) => {
                for part in parts {
                    if let StrPart::Code(e) = part {
                        f(e);
                    }
                }
            }
            ExprKind::Array(items) | ExprKind::Paren(items) => items.iter().for_each(|e| f(e)),
            ExprKind::Hash(pairs) => {
                for (k, v) in pairs {
                    f(k);
                    f(v);
                }
            }
            ExprKind::Range { start, end, .. } => {
                f(start);
                f(end);
            }
            ExprKind::ConstPath(parent, _) => f(parent),
            ExprKind::Call(call) => {
                if let Some(recv) = &call.receiver {
                    f(recv);
                }
                call.args.iter().for_each(|e| f(e));
                if let Some(block) = &call.block {
                    block.body.iter().for_each(|e| f(e));
                }
            }
            ExprKind::Index { receiver, args } => {
                f(receiver);
                args.iter().for_each(|e| f(e));
            }
            ExprKind::And(l, r) | ExprKind::Or(l, r) => {
                f(l);
                f(r);
            }
            ExprKind::Not(e) | ExprKind::BlockPass(e) => f(e),
            ExprKind::If(node) => {
                f(&node.cond);
                node.then_body.iter().for_each(|e| f(e));
                if let Some(body) = &node.else_body {
                    body.iter().for_each(|e| f(e));
                }
            }
            ExprKind::Case(node) => {
                if let Some(subject) = &node.subject {
                    f(subject);
                }
                for when in &node.whens {
                    when.values.iter().for_each(|e| f(e));
                    when.body.iter().for_each(|e| f(e));
                }
                if let Some(body) = &node.else_body {
                    body.iter().for_each(|e| f(e));
                }
            }
            ExprKind::Assign { target, value } | ExprKind::OpAssign { target, value, .. } => {
                target.for_each_expr(f);
                f(value);
            }
            ExprKind::MultiAssign { targets, value } => {
                for target in targets {
                    target.for_each_expr(f);
                }
                f(value);
            }
        }
    }

    /// Whether this is a literal with no identifiers in it.
    pub fn is_literal(&self) -> bool {
        match &self.kind {
            ExprKind::Nil
            | ExprKind::True
            | ExprKind::False
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Sym(_) => true,
            ExprKind::Array(items) => items.iter().all(Expr::is_literal),
            ExprKind::Hash(pairs) => pairs.iter().all(|(k, v)| k.is_literal() && v.is_literal()),
            ExprKind::Range { start, end, .. } => start.is_literal() && end.is_literal(),
            _ => false,
        }
    }
}

impl Target {
    fn for_each_expr<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        match self {
            Target::Index { receiver, args } => {
                f(receiver);
                args.iter().for_each(|e| f(e));
            }
            Target::Attr { receiver, .. } => f(receiver),
            Target::Local(_) | Target::IVar(_) | Target::GVar(_) => {}
        }
    }

    /// Name bound by a simple variable target.
    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Target::Local(n) | Target::IVar(n) | Target::GVar(n) => Some(n),
            _ => None,
        }
    }
}

/// Depth-first pre-order walk over `body` and everything beneath it.
pub fn walk<'a>(body: &'a [Expr], f: &mut dyn FnMut(&'a Expr)) {
    fn visit<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Expr)) {
        f(expr);
        expr.for_each_child(&mut |child| visit(child, f));
    }
    for expr in body {
        visit(expr, f);
    }
}
