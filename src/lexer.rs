//! Lexer for equation expressions using logos
//!
//! Supports tokens like:
//! - Identifiers: a, v_e, dt
//! - Numbers: 4, 2.5, 5., 1e-3 (signs are unary operators)
//! - Operators: + - * / % ^ ** == != < > <= >= =
//! - Punctuation: ( ) [ ] , :

use logos::Logos;

use crate::error::{CompileError, CompileResult};

/// Token types for the expression language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    // Literals
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("+")]
    Plus,

    #[token("-")]
    Minus,

    #[token("*")]
    Star,

    #[token("**")]
    DoubleStar,

    #[token("/")]
    Slash,

    #[token("%")]
    Percent,

    #[token("^")]
    Caret,

    #[token("==")]
    EqEq,

    #[token("!=")]
    NotEq,

    #[token("<")]
    Lt,

    #[token(">")]
    Gt,

    #[token("<=")]
    Le,

    #[token(">=")]
    Ge,

    #[token("=")]
    Assign,

    // Punctuation
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token(",")]
    Comma,

    #[token(":")]
    Colon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Float(n) => write!(f, "{}", n),
            Token::Int(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::DoubleStar => write!(f, "**"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Caret => write!(f, "^"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Assign => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
        }
    }
}

/// A token together with its source text and byte offset
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub text: String,
    pub position: usize,
}

/// Lexer wrapper that provides a stream of positioned tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<CompileResult<SpannedToken>>>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Byte offset just past the last consumed token
    pub fn end(&self) -> usize {
        self.inner.span().end
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&CompileResult<SpannedToken>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex_next());
        }
        self.peeked.as_ref().and_then(Option::as_ref)
    }

    fn lex_next(&mut self) -> Option<CompileResult<SpannedToken>> {
        let result = self.inner.next()?;
        let span = self.inner.span();
        let text = self.inner.slice().to_string();
        Some(match result {
            Ok(token) => Ok(SpannedToken {
                token,
                text,
                position: span.start,
            }),
            Err(()) => Err(CompileError::syntax(
                span.start,
                format!("unexpected token `{}`", text),
            )),
        })
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = CompileResult<SpannedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.lex_next(),
        }
    }
}

/// Tokenize a whole source string
pub fn tokenize(source: &str) -> CompileResult<Vec<SpannedToken>> {
    Lexer::new(source).collect()
}
