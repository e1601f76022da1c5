//! Parser for equation expressions
//!
//! Parses expressions and equations like:
//! - `4 * 5^2`
//! - `A[A > 0]`, `A[5, 0:-2]`, `A[int64(2 * 2):8 - 1]`
//! - `abs(sin(1.5))`
//! - `a = 5. + 2.`
//! - `d/dt * v = (I - v) / tau`
//!
//! Precedence from low to high: comparison, additive, multiplicative,
//! power, unary negation, indexing, function call, parentheses.

use std::collections::HashSet;

use crate::ast::{BinaryOp, EquationAst, Expr, Function, IndexArg, Literal, UnaryOp, UpdateMode};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, SpannedToken, Token};

/// Deepest expression tree the parser builds
pub const MAX_DEPTH: usize = 256;

/// Parser for expressions and equations
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<SpannedToken>,
    primed: bool,
    /// Identifiers bound to variables; these are never treated as functions
    known: HashSet<String>,
    /// Nesting of the expression being parsed
    depth: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: None,
            primed: false,
            known: HashSet::new(),
            depth: 0,
        }
    }

    pub fn with_known_identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known = identifiers.into_iter().map(Into::into).collect();
        self
    }

    fn prime(&mut self) -> CompileResult<()> {
        if !self.primed {
            self.primed = true;
            self.current = self.lexer.next().transpose()?;
        }
        Ok(())
    }

    /// Advance to the next token
    fn advance(&mut self) -> CompileResult<Option<SpannedToken>> {
        let prev = self.current.take();
        self.current = self.lexer.next().transpose()?;
        Ok(prev)
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(&tok.token) == std::mem::discriminant(expected),
            None => false,
        }
    }

    fn position(&self) -> usize {
        self.current
            .as_ref()
            .map(|t| t.position)
            .unwrap_or_else(|| self.lexer.end())
    }

    fn describe_current(&self) -> String {
        match &self.current {
            Some(tok) => format!("`{}`", tok.text),
            None => "end of input".to_string(),
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(CompileError::syntax(
                self.position(),
                format!("expected `{}`, got {}", expected, self.describe_current()),
            ))
        }
    }

    /// Enter one more level of nesting
    fn descend(&mut self) -> CompileResult<()> {
        if self.depth >= MAX_DEPTH {
            return Err(CompileError::syntax(
                self.position(),
                format!("expression is nested more than {} levels deep", MAX_DEPTH),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn expect_end(&self) -> CompileResult<()> {
        match &self.current {
            None => Ok(()),
            Some(tok) => Err(CompileError::syntax(
                tok.position,
                format!("unexpected `{}` after end of expression", tok.text),
            )),
        }
    }

    /// Parse a complete expression
    pub fn parse_expression(&mut self) -> CompileResult<Expr> {
        self.prime()?;
        let expr = self.parse_expr()?;
        self.expect_end()?;
        Ok(expr)
    }

    /// Parse `<target> = <rhs>` or `d/dt * <target> = <rhs>`
    pub fn parse_equation(&mut self) -> CompileResult<EquationAst> {
        self.prime()?;
        let target_position = self.position();
        let lhs = self.parse_expr()?;
        self.expect(Token::Assign)?;
        let rhs = self.parse_expr()?;
        self.expect_end()?;

        let (target, mode) = classify_target(lhs).ok_or_else(|| {
            CompileError::syntax(
                target_position,
                "equation target must be `<identifier>` or `d/dt * <identifier>`",
            )
        })?;
        Ok(EquationAst { target, mode, rhs })
    }

    fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.descend()?;
        let expr = self.parse_comparison()?;
        self.depth -= 1;
        Ok(expr)
    }

    /// Parse comparisons: a == b, a < b, ...
    fn parse_comparison(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_additive()?;
        let mut levels = 0;

        loop {
            let op = match self.current.as_ref().map(|t| &t.token) {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.advance()?;
            self.descend()?;
            levels += 1;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }

        self.depth -= levels;
        Ok(left)
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        let mut levels = 0;

        loop {
            let op = if self.check(&Token::Plus) {
                BinaryOp::Add
            } else if self.check(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            self.advance()?;
            self.descend()?;
            levels += 1;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }

        self.depth -= levels;
        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b, a % b
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        let mut left = self.parse_power()?;
        let mut levels = 0;

        loop {
            let op = if self.check(&Token::Star) {
                BinaryOp::Mul
            } else if self.check(&Token::Slash) {
                BinaryOp::Div
            } else if self.check(&Token::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            self.advance()?;
            self.descend()?;
            levels += 1;
            let right = self.parse_power()?;
            left = binary(op, left, right);
        }

        self.depth -= levels;
        Ok(left)
    }

    /// Parse exponentiation (right associative): a ^ b, a ** b
    fn parse_power(&mut self) -> CompileResult<Expr> {
        let base = self.parse_unary()?;

        if self.check(&Token::Caret) || self.check(&Token::DoubleStar) {
            self.advance()?;
            self.descend()?;
            let exponent = self.parse_power()?;
            self.depth -= 1;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }

        Ok(base)
    }

    /// Parse unary expressions: -a, +a
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        if self.check(&Token::Minus) {
            self.advance()?;
            self.descend()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            })
        } else if self.check(&Token::Plus) {
            self.advance()?;
            self.descend()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            Ok(operand)
        } else {
            self.parse_postfix()
        }
    }

    /// Parse postfix indexing: a[...], a[...][...]
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;
        let mut levels = 0;

        while self.check(&Token::LBracket) {
            self.descend()?;
            levels += 1;
            let args = self.parse_index_args()?;
            expr = Expr::Index {
                target: Box::new(expr),
                args,
            };
        }

        self.depth -= levels;
        Ok(expr)
    }

    /// Parse primary expressions: literals, variables, calls, parentheses
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        let position = self.position();
        let token = match self.advance()? {
            Some(tok) => tok,
            None => return Err(CompileError::syntax(position, "unexpected end of input")),
        };

        match token.token {
            Token::Int(n) => Ok(Expr::Literal(Literal::Int(n))),
            Token::Float(x) => Ok(Expr::Literal(Literal::Float(x))),

            Token::Ident(name) => {
                let is_variable = self.known.contains(&name);
                let function = Function::from_name(&name);

                if self.check(&Token::LParen) {
                    let function = match function {
                        Some(f) if !is_variable => f,
                        _ => return Err(CompileError::unknown_function(name)),
                    };
                    let args = self.parse_call_args()?;
                    if args.len() != function.arity() {
                        return Err(CompileError::type_error(format!(
                            "{}() takes {} argument(s), got {}",
                            function.name(),
                            function.arity(),
                            args.len()
                        )));
                    }
                    return Ok(Expr::Call { function, args });
                }

                if function.is_some() && !is_variable {
                    return Err(CompileError::syntax(
                        position,
                        format!("function `{}` must be called with parentheses", name),
                    ));
                }

                Ok(Expr::Variable(name))
            }

            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }

            _ => Err(CompileError::syntax(
                token.position,
                format!("unexpected token `{}`", token.text),
            )),
        }
    }

    /// Parse function arguments: (arg1, arg2, ...)
    fn parse_call_args(&mut self) -> CompileResult<Vec<Expr>> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);
            while self.check(&Token::Comma) {
                self.advance()?;
                args.push(self.parse_expr()?);
            }
        }

        if !self.check(&Token::RParen) {
            return Err(CompileError::syntax(
                self.position(),
                format!("expected `,` or `)`, got {}", self.describe_current()),
            ));
        }
        self.advance()?;
        Ok(args)
    }

    /// Parse index arguments: [i], [a:b:c], [i, a:b]
    fn parse_index_args(&mut self) -> CompileResult<Vec<IndexArg>> {
        self.expect(Token::LBracket)?;

        let mut args = vec![self.parse_index_arg()?];
        while self.check(&Token::Comma) {
            self.advance()?;
            args.push(self.parse_index_arg()?);
        }

        self.expect(Token::RBracket)?;
        Ok(args)
    }

    fn parse_index_arg(&mut self) -> CompileResult<IndexArg> {
        let position = self.position();
        let mut parts: Vec<Option<Expr>> = Vec::new();

        loop {
            let part = if self.check(&Token::Colon)
                || self.check(&Token::Comma)
                || self.check(&Token::RBracket)
            {
                None
            } else {
                Some(self.parse_expr()?)
            };
            parts.push(part);

            if self.check(&Token::Colon) {
                self.advance()?;
            } else {
                break;
            }
        }

        if parts.len() > 3 {
            return Err(CompileError::syntax(
                position,
                format!(
                    "slice takes at most 3 arguments (start:stop:step), got {}",
                    parts.len()
                ),
            ));
        }

        let mut parts = parts.into_iter();
        let first = parts.next().flatten();
        if parts.len() == 0 {
            return match first {
                Some(expr) => Ok(IndexArg::Single(expr)),
                None => Err(CompileError::syntax(position, "empty index")),
            };
        }

        let stop = parts.next().flatten();
        let step = parts.next().flatten();
        if first.is_none() && stop.is_none() && step.is_none() {
            return Ok(IndexArg::Full);
        }
        Ok(IndexArg::Slice {
            start: first.map(Box::new),
            stop: stop.map(Box::new),
            step: step.map(Box::new),
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Split an equation's left-hand side into its target and update mode
fn classify_target(lhs: Expr) -> Option<(String, UpdateMode)> {
    match lhs {
        Expr::Variable(name) => Some((name, UpdateMode::Assign)),
        Expr::Binary {
            op: BinaryOp::Mul,
            lhs: marker,
            rhs: target,
        } if is_differential_marker(&marker) => match *target {
            Expr::Variable(name) => Some((name, UpdateMode::Differential)),
            _ => None,
        },
        _ => None,
    }
}

fn is_differential_marker(expr: &Expr) -> bool {
    match expr {
        Expr::Binary {
            op: BinaryOp::Div,
            lhs,
            rhs,
        } => {
            matches!(lhs.as_ref(), Expr::Variable(d) if d == "d")
                && matches!(rhs.as_ref(), Expr::Variable(dt) if dt == "dt")
        }
        _ => false,
    }
}

/// Parse an expression; `known_identifiers` are names bound to variables
pub fn parse(source: &str, known_identifiers: &HashSet<String>) -> CompileResult<Expr> {
    Parser::new(source)
        .with_known_identifiers(known_identifiers.iter().cloned())
        .parse_expression()
}

/// Parse an equation; `known_identifiers` are names bound to variables
pub fn parse_equation(source: &str, known_identifiers: &HashSet<String>) -> CompileResult<EquationAst> {
    Parser::new(source)
        .with_known_identifiers(known_identifiers.iter().cloned())
        .parse_equation()
}
