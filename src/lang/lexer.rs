use logos::{Lexer, Logos};

use super::ast::Span;
use crate::error::{Error, Result};

/// Attach a directly adjacent `?` or `!` to an identifier (`valid?`,
/// `save!`) unless it begins `!=` or `?=`-style assignment.
fn method_suffix(lex: &mut Lexer<Token>) -> bool {
    let rest = lex.remainder();
    let mut chars = rest.chars();
    if let Some('?' | '!') = chars.next() {
        let assigning = chars.next() == Some('=') && !rest[1..].starts_with("==");
        if !assigning {
            lex.bump(1);
        }
    }
    true
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"\\\r?\n")]
pub enum Token {
    // Keywords
    #[token("if")]
    If,
    #[token("unless")]
    Unless,
    #[token("elsif")]
    Elsif,
    #[token("else")]
    Else,
    #[token("end")]
    End,
    #[token("case")]
    Case,
    #[token("when")]
    When,
    #[token("then")]
    Then,
    #[token("do")]
    Do,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("nil")]
    Nil,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("self")]
    SelfKw,
    #[token("next")]
    Next,
    #[token("break")]
    Break,

    // Literals
    #[regex(r"[0-9][0-9_]*\.[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    Float(f64),
    #[regex(r"[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\]|\\.)*""#)]
    DqString,
    #[regex(r"'([^'\\]|\\.)*'")]
    SqString,
    #[regex(r"%w\[[^\]]*\]")]
    WordArray,
    #[regex(r":[A-Za-z_][A-Za-z0-9_]*[?!]?")]
    Symbol,
    #[regex(r#":"([^"\\]|\\.)*""#)]
    DqSymbol,

    // Names
    #[regex(r"@[A-Za-z_][A-Za-z0-9_]*")]
    IVar,
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*")]
    GVar,
    #[regex(r"[A-Z][A-Za-z0-9_]*")]
    Const,
    #[regex(r"[a-z_][A-Za-z0-9_]*", method_suffix)]
    Ident,

    // Punctuation
    #[token("&.")]
    SafeNav,
    #[token("...")]
    DotDotDot,
    #[token("..")]
    DotDot,
    #[token(".")]
    Dot,
    #[token("::")]
    ColonColon,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("=>")]
    FatArrow,
    #[token("->")]
    Arrow,
    #[token("?")]
    Question,

    // Assignment
    #[token("=")]
    Assign,
    #[token("||=")]
    OrAssign,
    #[token("&&=")]
    AndAssign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,

    // Operators
    #[token("==")]
    EqEq,
    #[token("===")]
    EqEqEq,
    #[token("!=")]
    NotEq,
    #[token("=~")]
    Match,
    #[token("<=>")]
    Spaceship,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<<")]
    Shl,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("**")]
    Pow,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    #[regex(r"#[^\n]*")]
    Comment,
    #[token("\n")]
    Newline,
}

/// A lexed token with whitespace context the parser needs for command-call
/// and index disambiguation.
#[derive(Debug, Clone, PartialEq)]
pub struct Tok {
    pub token: Token,
    pub span: Span,
    /// Preceded by a space or tab.
    pub space_before: bool,
}

/// Byte offsets of line starts, for mapping offsets to 1-based lines.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    pub fn line_of(&self, offset: usize) -> u32 {
        match self.starts.binary_search(&offset) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }
}

/// Lex all of `source`.
pub fn lex(source: &str) -> Result<Vec<Tok>> {
    let index = LineIndex::new(source);
    lex_range(source, 0, source.len(), &index)
}

/// Lex `source[start..end]`, reporting spans relative to the whole source.
pub fn lex_range(source: &str, start: usize, end: usize, index: &LineIndex) -> Result<Vec<Tok>> {
    let slice = &source[start..end];
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(slice);

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let (lo, hi) = (start + range.start, start + range.end);
        let line = index.line_of(lo);
        match result {
            Ok(Token::Comment) => continue,
            Ok(token) => {
                let space_before = lo > 0 && matches!(bytes[lo - 1], b' ' | b'\t');
                tokens.push(Tok {
                    token,
                    span: Span::new(lo, hi, line),
                    space_before,
                });
            }
            Err(()) => {
                return Err(Error::Lex {
                    line,
                    message: format!("unexpected character '{}'", &source[lo..hi]),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn lex_predicate_and_bang_suffixes() {
        let toks = lex("user.active? && !x.save!").unwrap();
        let src = "user.active? && !x.save!";
        assert_eq!(toks[2].span.text(src), "active?");
        assert!(matches!(toks[4].token, Token::Bang));
        assert_eq!(toks[7].span.text(src), "save!");
    }

    #[test]
    fn lex_not_equal_is_not_a_suffix() {
        assert_eq!(
            kinds("a!=b"),
            vec![Token::Ident, Token::NotEq, Token::Ident]
        );
    }

    #[test]
    fn lex_symbols_and_scope() {
        assert_eq!(
            kinds("Foo::Bar :sym a ? b : c"),
            vec![
                Token::Const,
                Token::ColonColon,
                Token::Const,
                Token::Symbol,
                Token::Ident,
                Token::Question,
                Token::Ident,
                Token::Colon,
                Token::Ident,
            ]
        );
    }

    #[test]
    fn lex_keywords_vs_identifiers() {
        assert_eq!(
            kinds("if iffy end ending"),
            vec![Token::If, Token::Ident, Token::End, Token::Ident]
        );
    }

    #[test]
    fn lex_numbers_and_ranges() {
        assert_eq!(
            kinds("1..5 2.5"),
            vec![Token::Int(1), Token::DotDot, Token::Int(5), Token::Float(2.5)]
        );
    }

    #[test]
    fn lex_skips_comments_keeps_newlines() {
        assert_eq!(
            kinds("a # note\nb"),
            vec![Token::Ident, Token::Newline, Token::Ident]
        );
    }

    #[test]
    fn lex_tracks_lines_and_spacing() {
        let toks = lex("a\n  b c").unwrap();
        assert_eq!(toks[0].span.line, 1);
        assert_eq!(toks[2].span.line, 2);
        assert!(toks[2].space_before);
        assert!(toks[3].space_before);
        assert!(!toks[0].space_before);
    }

    #[test]
    fn lex_unexpected_character() {
        let err = lex("a ^ b").unwrap_err();
        assert!(matches!(err, Error::Lex { line: 1, .. }));
    }
}
