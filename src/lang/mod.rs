//! The embedded code layer: a `logos` lexer and a recursive-descent parser
//! producing a spanned syntax tree.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{Expr, ExprKind, Program, Span};
pub use parser::parse_program;
