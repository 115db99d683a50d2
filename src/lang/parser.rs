use std::mem::discriminant;

use super::ast::*;
use super::lexer::{lex_range, LineIndex, Tok, Token};
use crate::error::{Error, Result};

/// Parse a whole unit of embedded code.
pub fn parse_program(source: &str) -> Result<Program> {
    let index = LineIndex::new(source);
    let tokens = lex_range(source, 0, source.len(), &index)?;
    let mut parser = Parser::new(source, &index, tokens);
    let body = parser.program()?;
    Ok(Program {
        body,
        site_count: parser.next_site,
    })
}

struct Parser<'a> {
    source: &'a str,
    index: &'a LineIndex,
    tokens: Vec<Tok>,
    pos: usize,
    next_site: u32,
    /// Non-zero while parsing parenthesis-free command arguments, where a
    /// `do` belongs to the outer call.
    no_do: u32,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, index: &'a LineIndex, tokens: Vec<Tok>) -> Self {
        Self {
            source,
            index,
            tokens,
            pos: 0,
            next_site: 0,
            no_do: 0,
        }
    }

    // -- token helpers ------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_tok(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn at(&self, token: &Token) -> bool {
        self.peek().is_some_and(|t| discriminant(t) == discriminant(token))
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<Tok> {
        if self.at(token) {
            let tok = self.tokens[self.pos].clone();
            self.pos += 1;
            Ok(tok)
        } else {
            Err(self.unexpected(&format!("expected {what}")))
        }
    }

    fn skip_newlines(&mut self) {
        while self.at(&Token::Newline) {
            self.pos += 1;
        }
    }

    fn skip_terms(&mut self) {
        while matches!(self.peek(), Some(Token::Newline | Token::Semi)) {
            self.pos += 1;
        }
    }

    fn text(&self, span: Span) -> &'a str {
        span.text(self.source)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or_else(Span::default, |t| t.span)
    }

    fn current_span(&self) -> Span {
        self.peek_tok().map_or_else(
            || {
                let end = self.source.len();
                Span::new(end, end, self.index.line_of(end))
            },
            |t| t.span,
        )
    }

    fn unexpected(&self, expected: &str) -> Error {
        match self.peek_tok() {
            Some(tok) => Error::parse(
                tok.span.line,
                format!("{expected}, found '{}'", self.text(tok.span).escape_debug()),
            ),
            None => Error::parse(
                self.current_span().line,
                format!("{expected}, found end of input"),
            ),
        }
    }

    fn site(&mut self) -> u32 {
        let site = self.next_site;
        self.next_site += 1;
        site
    }

    /// The token after the current one begins immediately where it ends.
    fn next_is_adjacent(&self, token: &Token) -> bool {
        match (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)) {
            (Some(cur), Some(next)) => {
                discriminant(&next.token) == discriminant(token) && next.span.start == cur.span.end
            }
            _ => false,
        }
    }

    fn is_word(&self, tok: &Tok) -> bool {
        self.text(tok.span)
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && !matches!(tok.token, Token::Symbol | Token::IVar | Token::GVar)
    }

    // -- statements ---------------------------------------------------------

    fn program(&mut self) -> Result<Vec<Expr>> {
        let body = self.statements(&[])?;
        if self.peek().is_some() {
            return Err(self.unexpected("expected end of input"));
        }
        Ok(body)
    }

    fn statements(&mut self, terminators: &[Token]) -> Result<Vec<Expr>> {
        let is_term = |t: &Token| terminators.iter().any(|x| discriminant(x) == discriminant(t));
        let mut body = Vec::new();
        loop {
            self.skip_terms();
            match self.peek() {
                None => break,
                Some(t) if is_term(t) => break,
                _ => {}
            }
            body.push(self.statement()?);
            match self.peek() {
                None | Some(Token::Newline | Token::Semi) => {}
                Some(t) if is_term(t) => {}
                _ => return Err(self.unexpected("expected end of statement")),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Expr> {
        let mut expr = self.expr_stmt()?;
        loop {
            let negated = match self.peek() {
                Some(Token::If) => false,
                Some(Token::Unless) => true,
                _ => break,
            };
            self.pos += 1;
            let cond = self.expr_stmt()?;
            let span = expr.span.to(cond.span);
            let site = self.site();
            expr = Expr::new(
                ExprKind::If(Box::new(IfExpr {
                    form: IfForm::Modifier,
                    negated,
                    cond,
                    then_body: vec![expr],
                    else_body: None,
                    site,
                })),
                span,
            );
        }
        Ok(expr)
    }

    fn expr_stmt(&mut self) -> Result<Expr> {
        let mut left = self.not_expr()?;
        loop {
            let is_and = match self.peek() {
                Some(Token::And) => true,
                Some(Token::Or) => false,
                _ => break,
            };
            self.pos += 1;
            self.skip_newlines();
            let right = self.not_expr()?;
            let span = left.span.to(right.span);
            let kind = if is_and {
                ExprKind::And(Box::new(left), Box::new(right))
            } else {
                ExprKind::Or(Box::new(left), Box::new(right))
            };
            left = Expr::new(kind, span);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.at(&Token::Not) {
            let start = self.current_span();
            self.pos += 1;
            let inner = self.not_expr()?;
            let span = start.to(inner.span);
            return Ok(Expr::new(ExprKind::Not(Box::new(inner)), span));
        }
        self.expr()
    }

    // -- expressions --------------------------------------------------------

    fn expr(&mut self) -> Result<Expr> {
        if self.multi_assign_ahead() {
            return self.multi_assign();
        }

        let lhs = self.ternary()?;
        let op = match self.peek() {
            Some(Token::Assign) => None,
            Some(Token::OrAssign) => Some(AssignOp::Or),
            Some(Token::AndAssign) => Some(AssignOp::And),
            Some(Token::PlusAssign) => Some(AssignOp::Add),
            Some(Token::MinusAssign) => Some(AssignOp::Sub),
            _ => return Ok(lhs),
        };
        let start = lhs.span;
        let Some(target) = into_target(lhs) else {
            return Err(self.unexpected("invalid assignment target"));
        };
        self.pos += 1;
        self.skip_newlines();
        let value = self.expr()?;
        let span = start.to(value.span);
        let kind = match op {
            None => ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            Some(op) => ExprKind::OpAssign {
                target: Box::new(target),
                op,
                value: Box::new(value),
            },
        };
        Ok(Expr::new(kind, span))
    }

    fn multi_assign_ahead(&self) -> bool {
        let mut i = self.pos;
        let mut names = 0;
        loop {
            match self.tokens.get(i).map(|t| &t.token) {
                Some(Token::Ident | Token::IVar | Token::GVar) => names += 1,
                _ => return false,
            }
            i += 1;
            match self.tokens.get(i).map(|t| &t.token) {
                Some(Token::Comma) => i += 1,
                Some(Token::Assign) => return names > 1,
                _ => return false,
            }
        }
    }

    fn multi_assign(&mut self) -> Result<Expr> {
        let start = self.current_span();
        let mut targets = Vec::new();
        loop {
            let Some(tok) = self.advance() else {
                return Err(self.unexpected("expected assignment target"));
            };
            let name = self.text(tok.span).to_string();
            targets.push(match tok.token {
                Token::IVar => Target::IVar(name),
                Token::GVar => Target::GVar(name),
                _ => Target::Local(name),
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Assign, "'='")?;
        self.skip_newlines();
        let first = self.expr()?;
        let value = if self.at(&Token::Comma) {
            let mut items = vec![first];
            while self.eat(&Token::Comma) {
                self.skip_newlines();
                items.push(self.expr()?);
            }
            let span = items[0].span.to(self.prev_span());
            Expr::new(ExprKind::Array(items), span)
        } else {
            first
        };
        let span = start.to(value.span);
        Ok(Expr::new(
            ExprKind::MultiAssign {
                targets,
                value: Box::new(value),
            },
            span,
        ))
    }

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.range()?;
        if !self.at(&Token::Question) {
            return Ok(cond);
        }
        self.pos += 1;
        let site = self.site();
        self.skip_newlines();
        let then = self.ternary()?;
        self.skip_newlines();
        self.expect(&Token::Colon, "':' in ternary")?;
        self.skip_newlines();
        let otherwise = self.ternary()?;
        let span = cond.span.to(otherwise.span);
        Ok(Expr::new(
            ExprKind::If(Box::new(IfExpr {
                form: IfForm::Ternary,
                negated: false,
                cond,
                then_body: vec![then],
                else_body: Some(vec![otherwise]),
                site,
            })),
            span,
        ))
    }

    fn range(&mut self) -> Result<Expr> {
        let start = self.or_expr()?;
        let exclusive = match self.peek() {
            Some(Token::DotDot) => false,
            Some(Token::DotDotDot) => true,
            _ => return Ok(start),
        };
        self.pos += 1;
        let end = self.or_expr()?;
        let span = start.span.to(end.span);
        Ok(Expr::new(
            ExprKind::Range {
                start: Box::new(start),
                end: Box::new(end),
                exclusive,
            },
            span,
        ))
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            self.skip_newlines();
            let right = self.and_expr()?;
            let span = left.span.to(right.span);
            left = Expr::new(ExprKind::Or(Box::new(left), Box::new(right)), span);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            self.skip_newlines();
            let right = self.equality()?;
            let span = left.span.to(right.span);
            left = Expr::new(ExprKind::And(Box::new(left), Box::new(right)), span);
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(Token, &'static str)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, name) in ops {
                if self.at(token) {
                    self.pos += 1;
                    self.skip_newlines();
                    let right = next(self)?;
                    left = operator_call(left, name, right);
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::EqEq, "=="),
                (Token::NotEq, "!="),
                (Token::EqEqEq, "==="),
                (Token::Match, "=~"),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                (Token::Spaceship, "<=>"),
                (Token::LtEq, "<="),
                (Token::GtEq, ">="),
                (Token::Lt, "<"),
                (Token::Gt, ">"),
            ],
            Self::shift,
        )
    }

    fn shift(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::Shl, "<<")], Self::additive)
    }

    fn additive(&mut self) -> Result<Expr> {
        self.binary_level(&[(Token::Plus, "+"), (Token::Minus, "-")], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            &[(Token::Star, "*"), (Token::Slash, "/"), (Token::Percent, "%")],
            Self::power,
        )
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.unary()?;
        if self.eat(&Token::Pow) {
            let exponent = self.power()?;
            return Ok(operator_call(base, "**", exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr> {
        let start = self.current_span();
        match self.peek() {
            Some(Token::Bang) => {
                self.pos += 1;
                let inner = self.unary()?;
                let span = start.to(inner.span);
                Ok(Expr::new(ExprKind::Not(Box::new(inner)), span))
            }
            Some(Token::Minus) => {
                let adjacent_number = self.next_is_adjacent(&Token::Int(0))
                    || self.next_is_adjacent(&Token::Float(0.0));
                self.pos += 1;
                let inner = self.unary()?;
                let span = start.to(inner.span);
                Ok(match inner.kind {
                    ExprKind::Int(n) if adjacent_number => Expr::new(ExprKind::Int(-n), span),
                    ExprKind::Float(f) if adjacent_number => Expr::new(ExprKind::Float(-f), span),
                    _ => Expr::new(
                        ExprKind::Call(Box::new(Call {
                            receiver: Some(inner),
                            name: "-@".to_string(),
                            args: Vec::new(),
                            block: None,
                            safe_nav: false,
                            operator: true,
                        })),
                        span,
                    ),
                })
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot | Token::SafeNav) => expr = self.method_call(expr)?,
                Some(Token::Newline) if self.chain_continues() => self.skip_newlines(),
                Some(Token::ColonColon) => {
                    self.pos += 1;
                    let Some(tok) = self.advance() else {
                        return Err(self.unexpected("expected name after '::'"));
                    };
                    let name = self.text(tok.span).to_string();
                    let span = expr.span.to(tok.span);
                    expr = if matches!(tok.token, Token::Const) && !self.at(&Token::LParen) {
                        Expr::new(ExprKind::ConstPath(Box::new(expr), name), span)
                    } else {
                        self.finish_call(Some(expr), name, false, span)?
                    };
                }
                Some(Token::LBracket) if !self.peek_tok().is_some_and(|t| t.space_before) => {
                    self.pos += 1;
                    let args = self.call_args(Some(Token::RBracket))?;
                    let span = expr.span.to(self.prev_span());
                    expr = Expr::new(
                        ExprKind::Index {
                            receiver: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// A newline followed by `.name` continues a method chain.
    fn chain_continues(&self) -> bool {
        self.tokens[self.pos..]
            .iter()
            .find(|t| !matches!(t.token, Token::Newline))
            .is_some_and(|t| matches!(t.token, Token::Dot | Token::SafeNav))
    }

    fn method_call(&mut self, receiver: Expr) -> Result<Expr> {
        let safe_nav = matches!(self.advance().map(|t| t.token), Some(Token::SafeNav));
        self.skip_newlines();
        let tok = match self.peek_tok() {
            Some(tok) if self.is_word(tok) => tok.clone(),
            _ => return Err(self.unexpected("expected method name")),
        };
        self.pos += 1;
        let name = self.text(tok.span).to_string();
        let span = receiver.span.to(tok.span);
        self.finish_call(Some(receiver), name, safe_nav, span)
    }

    /// Parse optional arguments and block after a method name.
    fn finish_call(
        &mut self,
        receiver: Option<Expr>,
        name: String,
        safe_nav: bool,
        span: Span,
    ) -> Result<Expr> {
        let args = if self.at(&Token::LParen) && !self.peek_tok().is_some_and(|t| t.space_before) {
            self.pos += 1;
            self.call_args(Some(Token::RParen))?
        } else if self.command_arg_start() {
            self.no_do += 1;
            let args = self.call_args(None);
            self.no_do -= 1;
            args?
        } else {
            Vec::new()
        };
        let block = self.block_opt()?;
        let end = block.as_ref().map_or_else(|| self.prev_span(), |b| b.span);
        Ok(Expr::new(
            ExprKind::Call(Box::new(Call {
                receiver,
                name,
                args,
                block,
                safe_nav,
                operator: false,
            })),
            span.to(end),
        ))
    }

    /// Whether the current token can begin a parenthesis-free argument.
    fn command_arg_start(&self) -> bool {
        let Some(tok) = self.peek_tok() else {
            return false;
        };
        if !tok.space_before {
            return false;
        }
        match tok.token {
            Token::DqString
            | Token::SqString
            | Token::WordArray
            | Token::Symbol
            | Token::DqSymbol
            | Token::Int(_)
            | Token::Float(_)
            | Token::IVar
            | Token::GVar
            | Token::Const
            | Token::Ident
            | Token::Nil
            | Token::True
            | Token::False
            | Token::SelfKw
            | Token::LBracket
            | Token::LParen => true,
            Token::Bang | Token::Amp | Token::ColonColon => self
                .tokens
                .get(self.pos + 1)
                .is_some_and(|next| next.span.start == tok.span.end),
            _ => false,
        }
    }

    fn label_ahead(&self) -> bool {
        match self.peek_tok() {
            Some(tok) if self.is_word(tok) || matches!(tok.token, Token::DqString | Token::SqString) => {
                self.next_is_adjacent(&Token::Colon)
            }
            _ => false,
        }
    }

    fn label(&mut self) -> Result<Expr> {
        let Some(tok) = self.advance() else {
            return Err(self.unexpected("expected label"));
        };
        self.pos += 1;
        let name = match tok.token {
            Token::DqString | Token::SqString => unescape(&self.text(tok.span)[1..tok.span.end - tok.span.start - 1]),
            _ => self.text(tok.span).to_string(),
        };
        Ok(Expr::new(ExprKind::Sym(name), tok.span))
    }

    /// Arguments up to `close` (consumed), or a parenthesis-free list when
    /// `close` is `None`. Trailing `key: value` pairs collect into one hash.
    fn call_args(&mut self, close: Option<Token>) -> Result<Vec<Expr>> {
        let saved = self.no_do;
        if close.is_some() {
            self.no_do = 0;
            self.skip_newlines();
        }
        let mut args = Vec::new();
        let mut pairs: Vec<(Expr, Expr)> = Vec::new();
        loop {
            if close.as_ref().is_some_and(|c| self.at(c)) {
                break;
            }
            if self.label_ahead() {
                let key = self.label()?;
                self.skip_newlines();
                let value = self.expr()?;
                pairs.push((key, value));
            } else if self.at(&Token::Amp) {
                let start = self.current_span();
                self.pos += 1;
                let inner = self.unary()?;
                let span = start.to(inner.span);
                args.push(Expr::new(ExprKind::BlockPass(Box::new(inner)), span));
            } else {
                if matches!(self.peek(), Some(Token::Star | Token::Pow)) {
                    self.pos += 1;
                }
                let value = self.expr()?;
                if self.eat(&Token::FatArrow) {
                    self.skip_newlines();
                    let v = self.expr()?;
                    pairs.push((value, v));
                } else {
                    args.push(value);
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
            self.skip_newlines();
        }
        if !pairs.is_empty() {
            let span = pairs[0].0.span.to(pairs[pairs.len() - 1].1.span);
            args.push(Expr::new(ExprKind::Hash(pairs), span));
        }
        if let Some(close) = close {
            self.skip_newlines();
            self.expect(&close, "closing bracket")?;
        }
        self.no_do = saved;
        Ok(args)
    }

    fn block_opt(&mut self) -> Result<Option<Block>> {
        match self.peek() {
            Some(Token::LBrace) => Ok(Some(self.block(Token::RBrace)?)),
            Some(Token::Do) if self.no_do == 0 => Ok(Some(self.block(Token::End)?)),
            _ => Ok(None),
        }
    }

    fn block(&mut self, close: Token) -> Result<Block> {
        let open = self.current_span();
        self.pos += 1;
        let mut params = Vec::new();
        if self.eat(&Token::OrOr) {
            // `||` is an empty parameter list
        } else if self.eat(&Token::Pipe) {
            while !self.eat(&Token::Pipe) {
                match self.advance() {
                    Some(tok) if matches!(tok.token, Token::Ident) => {
                        params.push(self.text(tok.span).to_string());
                    }
                    Some(tok)
                        if matches!(
                            tok.token,
                            Token::Comma | Token::LParen | Token::RParen | Token::Star | Token::Amp
                        ) => {}
                    _ => return Err(self.unexpected("expected block parameter")),
                }
            }
        }
        let saved = self.no_do;
        self.no_do = 0;
        let body = self.statements(std::slice::from_ref(&close));
        self.no_do = saved;
        let body = body?;
        let end = self.expect(&close, "end of block")?;
        Ok(Block {
            params,
            body,
            span: open.to(end.span),
        })
    }

    // -- primaries ----------------------------------------------------------

    fn primary(&mut self) -> Result<Expr> {
        let Some(tok) = self.peek_tok().cloned() else {
            return Err(self.unexpected("expected expression"));
        };
        let span = tok.span;
        let literal = |kind| Ok(Expr::new(kind, span));
        match tok.token {
            Token::Nil => {
                self.pos += 1;
                literal(ExprKind::Nil)
            }
            Token::True => {
                self.pos += 1;
                literal(ExprKind::True)
            }
            Token::False => {
                self.pos += 1;
                literal(ExprKind::False)
            }
            Token::SelfKw => {
                self.pos += 1;
                literal(ExprKind::SelfRef)
            }
            Token::Next => {
                self.pos += 1;
                literal(ExprKind::Next)
            }
            Token::Break => {
                self.pos += 1;
                literal(ExprKind::Break)
            }
            Token::Int(n) => {
                self.pos += 1;
                literal(ExprKind::Int(n))
            }
            Token::Float(f) => {
                self.pos += 1;
                literal(ExprKind::Float(f))
            }
            Token::DqString => {
                self.pos += 1;
                self.double_quoted(span)
            }
            Token::SqString => {
                self.pos += 1;
                let raw = self.text(span);
                literal(ExprKind::Str(unescape_single(&raw[1..raw.len() - 1])))
            }
            Token::WordArray => {
                self.pos += 1;
                let raw = self.text(span);
                let words = raw[3..raw.len() - 1]
                    .split_whitespace()
                    .map(|w| Expr::new(ExprKind::Str(w.to_string()), span))
                    .collect();
                literal(ExprKind::Array(words))
            }
            Token::Symbol => {
                self.pos += 1;
                literal(ExprKind::Sym(self.text(span)[1..].to_string()))
            }
            Token::DqSymbol => {
                self.pos += 1;
                let raw = self.text(span);
                literal(ExprKind::Sym(unescape(&raw[2..raw.len() - 1])))
            }
            Token::IVar => {
                self.pos += 1;
                literal(ExprKind::IVar(self.text(span).to_string()))
            }
            Token::GVar => {
                self.pos += 1;
                literal(ExprKind::GVar(self.text(span).to_string()))
            }
            Token::Const => {
                self.pos += 1;
                let name = self.text(span).to_string();
                if self.at(&Token::LParen) && !self.peek_tok().is_some_and(|t| t.space_before) {
                    self.finish_call(None, name, false, span)
                } else {
                    literal(ExprKind::Const(name))
                }
            }
            Token::ColonColon => {
                self.pos += 1;
                let name = self.expect(&Token::Const, "constant after '::'")?;
                Ok(Expr::new(
                    ExprKind::Const(self.text(name.span).to_string()),
                    span.to(name.span),
                ))
            }
            Token::Ident => {
                self.pos += 1;
                self.identifier(tok)
            }
            Token::LParen => {
                self.pos += 1;
                let saved = self.no_do;
                self.no_do = 0;
                let body = self.statements(&[Token::RParen]);
                self.no_do = saved;
                let body = body?;
                let end = self.expect(&Token::RParen, "')'")?;
                Ok(Expr::new(ExprKind::Paren(body), span.to(end.span)))
            }
            Token::LBracket => {
                self.pos += 1;
                let items = self.call_args(Some(Token::RBracket))?;
                Ok(Expr::new(ExprKind::Array(items), span.to(self.prev_span())))
            }
            Token::LBrace => {
                self.pos += 1;
                self.hash_literal(span)
            }
            Token::If => self.if_expr(false, IfForm::Block),
            Token::Unless => self.if_expr(true, IfForm::Block),
            Token::Case => self.case_expr(),
            _ => Err(self.unexpected("expected expression")),
        }
    }

    fn identifier(&mut self, tok: Tok) -> Result<Expr> {
        let name = self.text(tok.span).to_string();
        let call_follows = (self.at(&Token::LParen)
            && !self.peek_tok().is_some_and(|t| t.space_before))
            || self.command_arg_start()
            || self.at(&Token::LBrace)
            || (self.at(&Token::Do) && self.no_do == 0);
        if call_follows {
            self.finish_call(None, name, false, tok.span)
        } else {
            Ok(Expr::new(ExprKind::Ident(name), tok.span))
        }
    }

    fn hash_literal(&mut self, open: Span) -> Result<Expr> {
        let saved = self.no_do;
        self.no_do = 0;
        let mut pairs = Vec::new();
        self.skip_newlines();
        while !self.at(&Token::RBrace) {
            if self.label_ahead() {
                let key = self.label()?;
                self.skip_newlines();
                let value = self.expr()?;
                pairs.push((key, value));
            } else {
                let key = self.expr()?;
                self.skip_newlines();
                self.expect(&Token::FatArrow, "'=>' in hash literal")?;
                self.skip_newlines();
                let value = self.expr()?;
                pairs.push((key, value));
            }
            self.skip_newlines();
            if !self.eat(&Token::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.no_do = saved;
        let end = self.expect(&Token::RBrace, "'}'")?;
        Ok(Expr::new(ExprKind::Hash(pairs), open.to(end.span)))
    }

    fn if_expr(&mut self, negated: bool, form: IfForm) -> Result<Expr> {
        let start = self.current_span();
        self.pos += 1;
        let cond = self.expr_stmt()?;
        self.eat(&Token::Then);
        let site = self.site();
        let then_body = self.statements(&[Token::Elsif, Token::Else, Token::End])?;
        let else_body = match self.peek() {
            Some(Token::Elsif) if !negated => Some(vec![self.if_expr(false, IfForm::Elsif)?]),
            Some(Token::Else) => {
                self.pos += 1;
                Some(self.statements(&[Token::End])?)
            }
            _ => None,
        };
        // An elsif chain shares the outermost `end`.
        if form != IfForm::Elsif {
            self.expect(&Token::End, "'end'")?;
        }
        let span = start.to(self.prev_span());
        Ok(Expr::new(
            ExprKind::If(Box::new(IfExpr {
                form,
                negated,
                cond,
                then_body,
                else_body,
                site,
            })),
            span,
        ))
    }

    fn case_expr(&mut self) -> Result<Expr> {
        let start = self.current_span();
        self.pos += 1;
        let subject = if matches!(self.peek(), Some(Token::Newline | Token::Semi)) {
            None
        } else {
            Some(self.expr_stmt()?)
        };
        let site = self.site();
        self.skip_terms();

        let mut whens = Vec::new();
        while self.at(&Token::When) {
            let when_span = self.current_span();
            self.pos += 1;
            let mut values = vec![self.ternary()?];
            while self.eat(&Token::Comma) {
                self.skip_newlines();
                values.push(self.ternary()?);
            }
            self.eat(&Token::Then);
            let body = self.statements(&[Token::When, Token::Else, Token::End])?;
            whens.push(WhenClause {
                values,
                body,
                span: when_span,
            });
        }
        if whens.is_empty() {
            return Err(self.unexpected("expected 'when'"));
        }
        let else_body = if self.eat(&Token::Else) {
            Some(self.statements(&[Token::End])?)
        } else {
            None
        };
        let end = self.expect(&Token::End, "'end'")?;
        Ok(Expr::new(
            ExprKind::Case(Box::new(CaseExpr {
                subject,
                whens,
                else_body,
                site,
            })),
            start.to(end.span),
        ))
    }

    fn double_quoted(&mut self, span: Span) -> Result<Expr> {
        let inner_start = span.start + 1;
        let raw = &self.source[inner_start..span.end - 1];
        let mut parts = Vec::new();
        let mut lit = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        lit.push(escape_char(escaped));
                    }
                }
                '#' if chars.peek().is_some_and(|&(_, n)| n == '{') => {
                    chars.next();
                    let code_start = i + 2;
                    let mut depth = 1;
                    let mut code_end = raw.len();
                    for (j, ch) in chars.by_ref() {
                        match ch {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    code_end = j;
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    if depth != 0 {
                        return Err(Error::parse(span.line, "unterminated string interpolation"));
                    }
                    if !lit.is_empty() {
                        parts.push(StrPart::Lit(std::mem::take(&mut lit)));
                    }
                    let (lo, hi) = (inner_start + code_start, inner_start + code_end);
                    let body = self.sub_parse(lo, hi)?;
                    let code_span = Span::new(lo, hi, self.index.line_of(lo));
                    parts.push(StrPart::Code(Expr::new(ExprKind::Paren(body), code_span)));
                }
                _ => lit.push(c),
            }
        }

        if parts.is_empty() {
            return Ok(Expr::new(ExprKind::Str(lit), span));
        }
        if !lit.is_empty() {
            parts.push(StrPart::Lit(lit));
        }
        Ok(Expr::new(ExprKind::Interp(parts), span))
    }

    /// Parse `source[start..end]` as a nested program sharing site numbering.
    fn sub_parse(&mut self, start: usize, end: usize) -> Result<Vec<Expr>> {
        let tokens = lex_range(self.source, start, end, self.index)?;
        let mut child = Parser::new(self.source, self.index, tokens);
        child.next_site = self.next_site;
        let body = child.program()?;
        self.next_site = child.next_site;
        Ok(body)
    }
}

fn operator_call(left: Expr, name: &str, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr::new(
        ExprKind::Call(Box::new(Call {
            receiver: Some(left),
            name: name.to_string(),
            args: vec![right],
            block: None,
            safe_nav: false,
            operator: true,
        })),
        span,
    )
}

fn into_target(expr: Expr) -> Option<Target> {
    match expr.kind {
        ExprKind::Ident(name) => Some(Target::Local(name)),
        ExprKind::IVar(name) => Some(Target::IVar(name)),
        ExprKind::GVar(name) => Some(Target::GVar(name)),
        ExprKind::Index { receiver, args } => Some(Target::Index {
            receiver: *receiver,
            args,
        }),
        ExprKind::Call(call)
            if call.receiver.is_some()
                && call.args.is_empty()
                && call.block.is_none()
                && !call.operator =>
        {
            let call = *call;
            call.receiver.map(|receiver| Target::Attr {
                receiver,
                name: call.name,
            })
        }
        _ => None,
    }
}

fn escape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        's' => ' ',
        '0' => '\0',
        'e' => '\x1b',
        other => other,
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escape_char(escaped));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_single(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('\\', Some(&next @ ('\'' | '\\'))) => {
                out.push(next);
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_program(src).unwrap()
    }

    fn single(src: &str) -> ExprKind {
        let mut program = parse(src);
        assert_eq!(program.body.len(), 1, "expected one statement in {src:?}");
        program.body.remove(0).kind
    }

    fn call(kind: &ExprKind) -> &Call {
        match kind {
            ExprKind::Call(call) => call,
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn parse_chained_predicate_call() {
        let kind = single("user.profile.active?");
        let outer = call(&kind);
        assert_eq!(outer.name, "active?");
        let inner = call(&outer.receiver.as_ref().unwrap().kind);
        assert_eq!(inner.name, "profile");
        assert!(matches!(
            inner.receiver.as_ref().unwrap().kind,
            ExprKind::Ident(ref n) if n == "user"
        ));
    }

    #[test]
    fn parse_if_elsif_else_assigns_sites_in_order() {
        let program = parse("if a\n  x\nelsif b\n  y\nelse\n  z\nend");
        assert_eq!(program.site_count, 2);
        let ExprKind::If(node) = &program.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(node.site, 0);
        let else_body = node.else_body.as_ref().unwrap();
        let ExprKind::If(elsif) = &else_body[0].kind else {
            panic!("expected elsif");
        };
        assert_eq!(elsif.form, IfForm::Elsif);
        assert_eq!(elsif.site, 1);
        assert_eq!(elsif.else_body.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn parse_modifier_and_ternary() {
        let program = parse("x = a ? 1 : 2 unless b");
        assert_eq!(program.site_count, 2);
        let ExprKind::If(node) = &program.body[0].kind else {
            panic!("expected modifier");
        };
        assert_eq!(node.form, IfForm::Modifier);
        assert!(node.negated);
        assert!(matches!(node.then_body[0].kind, ExprKind::Assign { .. }));
    }

    #[test]
    fn parse_case_with_multiple_values() {
        let kind = single("case status\nwhen \"a\", \"b\" then 1\nwhen :c\n  2\nelse\n  3\nend");
        let ExprKind::Case(node) = kind else {
            panic!("expected case");
        };
        assert_eq!(node.whens.len(), 2);
        assert_eq!(node.whens[0].values.len(), 2);
        assert!(matches!(node.whens[1].values[0].kind, ExprKind::Sym(ref s) if s == "c"));
        assert!(node.else_body.is_some());
    }

    #[test]
    fn parse_command_call_with_do_block() {
        let kind = single("link_to user_path(u), class: \"btn\" do |x|\n  x\nend");
        let call = call(&kind);
        assert_eq!(call.name, "link_to");
        assert_eq!(call.args.len(), 2);
        assert!(matches!(call.args[1].kind, ExprKind::Hash(_)));
        let block = call.block.as_ref().unwrap();
        assert_eq!(block.params, vec!["x"]);
    }

    #[test]
    fn parse_each_block_attaches_to_method() {
        let kind = single("@products.each do |product|\n  if product.in_stock?\n  end\nend");
        let call = call(&kind);
        assert_eq!(call.name, "each");
        assert!(matches!(
            call.receiver.as_ref().unwrap().kind,
            ExprKind::IVar(ref n) if n == "@products"
        ));
        assert_eq!(call.block.as_ref().unwrap().body.len(), 1);
    }

    #[test]
    fn parse_index_or_assign() {
        let kind = single("flash[:notice] ||= \"default\"");
        let ExprKind::OpAssign { target, op, .. } = kind else {
            panic!("expected op-assign");
        };
        assert_eq!(op, AssignOp::Or);
        assert!(matches!(*target, Target::Index { .. }));
    }

    #[test]
    fn parse_multi_assign() {
        let kind = single("a, b = foo, bar");
        let ExprKind::MultiAssign { targets, value } = kind else {
            panic!("expected multi-assign");
        };
        assert_eq!(targets.len(), 2);
        assert!(matches!(value.kind, ExprKind::Array(ref items) if items.len() == 2));
    }

    #[test]
    fn parse_interpolation_and_escapes() {
        let kind = single(r#""Hi #{user.name}!\n""#);
        let ExprKind::Interp(parts) = kind else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[2], StrPart::Lit(s) if s == "!\n"));
    }

    #[test]
    fn parse_operators_are_calls() {
        let kind = single("a + b * c == d");
        let eq = call(&kind);
        assert_eq!(eq.name, "==");
        let plus = call(&eq.receiver.as_ref().unwrap().kind);
        assert_eq!(plus.name, "+");
        assert_eq!(call(&plus.args[0].kind).name, "*");
    }

    #[test]
    fn parse_boolean_connectives() {
        let kind = single("a && !b || not_c");
        assert!(matches!(kind, ExprKind::Or(_, _)));
    }

    #[test]
    fn parse_statements_on_one_line() {
        let program = parse("__out(\"a\"); if x; __out(\"b\"); end;");
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn parse_method_chain_across_lines() {
        let kind = single("items\n  .select(&:visible?)\n  .count");
        assert_eq!(call(&kind).name, "count");
    }

    #[test]
    fn parse_unterminated_if_reports_line() {
        let err = parse_program("if a\n  b\n").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("'end'"));
    }

    #[test]
    fn parse_hash_literal_forms() {
        let kind = single("{ a: 1, \"b\" => 2, :c => 3 }");
        assert!(matches!(kind, ExprKind::Hash(ref pairs) if pairs.len() == 3));
    }

    #[test]
    fn parse_safe_navigation() {
        let kind = single("user&.name");
        assert!(call(&kind).safe_nav);
    }

    #[test]
    fn parse_constant_path_call() {
        let kind = single("Foo::Bar.enabled?");
        let call = call(&kind);
        assert!(matches!(
            call.receiver.as_ref().unwrap().kind,
            ExprKind::ConstPath(_, ref n) if n == "Bar"
        ));
    }
}
