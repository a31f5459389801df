//! Formula language: lexer, recursive-descent parser and evaluator.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! comparison     := additive (cmp_op additive)?
//! additive       := multiplicative (('+' | '-') multiplicative)*
//! multiplicative := unary (('*' | '/') unary)*
//! unary          := ('+' | '-') unary | power
//! power          := primary ('^' signed_primary)*
//! primary        := number | '(' comparison ')' | ident '(' args? ')' | ident time_ref?
//! time_ref       := '[' 't' ('-' integer)? ']'
//! ```
//!
//! Every binary operator associates left-to-right, including `^`.
//! Comparisons yield `1.0` or `0.0`; `IF` treats any non-zero condition as true.

use crate::error::{EngineError, Result};
use crate::providers::{Context, ProviderChain, ValueProvider};
use std::fmt;

/// A reference to a line item or driver, optionally shifted back in time.
///
/// `lag == 0` is the current period (`NAME` or `NAME[t]`), `lag == n` is `NAME[t-n]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableRef {
    pub name: String,
    pub lag: u32,
}

/// Largest offset accepted in `X[t-N]`; period ids are `i32`.
pub const MAX_TIME_SHIFT: u32 = i32::MAX as u32;

impl VariableRef {
    pub fn current(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lag: 0,
        }
    }

    pub fn shifted(name: impl Into<String>, lag: u32) -> Self {
        Self {
            name: name.into(),
            lag,
        }
    }

    pub fn is_time_shifted(&self) -> bool {
        self.lag > 0
    }

    /// Dependency key: `CASH` for the current period, `CASH[t-1]` for a shifted reference.
    pub fn key(&self) -> String {
        if self.lag == 0 {
            self.name.clone()
        } else {
            format!("{}[t-{}]", self.name, self.lag)
        }
    }

    /// Inverse of [`VariableRef::key`]. Whitespace inside the brackets is ignored.
    pub fn parse_key(key: &str) -> Option<Self> {
        let key = key.trim();
        match key.find('[') {
            None => Some(Self::current(key)),
            Some(open) => {
                let name = key[..open].trim();
                let inner: String = key[open + 1..]
                    .strip_suffix(']')?
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                let inner = inner.to_ascii_lowercase();
                if inner == "t" {
                    return Some(Self::current(name));
                }
                let lag = inner.strip_prefix("t-")?.parse::<u32>().ok()?;
                (lag <= MAX_TIME_SHIFT).then(|| Self::shifted(name, lag))
            }
        }
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Supplies values for variable references during evaluation.
pub trait Resolver {
    fn resolve(&self, var: &VariableRef) -> Result<f64>;
}

impl<F> Resolver for F
where
    F: Fn(&VariableRef) -> Result<f64>,
{
    fn resolve(&self, var: &VariableRef) -> Result<f64> {
        self(var)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(VariableRef),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

/// A parsed formula. Parsing happens once; evaluation and dependency
/// extraction both work from the same syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
    references: Vec<VariableRef>,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = Lexer::new(text).tokenize()?;
        if tokens.is_empty() {
            return Err(EngineError::parse(text, 0, "Empty formula"));
        }

        let mut parser = Parser {
            source: text,
            tokens,
            pos: 0,
            references: Vec::new(),
        };
        let root = parser.parse_comparison()?;

        if let Some(extra) = parser.tokens.get(parser.pos) {
            let message = if extra.token == Token::RParen {
                "Unmatched closing parenthesis".to_string()
            } else {
                format!("Unexpected {} after expression", extra.token)
            };
            return Err(EngineError::parse(text, extra.position, message));
        }

        Ok(Self {
            source: text.to_string(),
            root,
            references: parser.references,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.root
    }

    /// Unique variable references in order of first appearance.
    pub fn references(&self) -> &[VariableRef] {
        &self.references
    }

    pub fn dependency_keys(&self) -> Vec<String> {
        self.references.iter().map(VariableRef::key).collect()
    }

    pub fn evaluate(&self, resolver: &dyn Resolver) -> Result<f64> {
        eval_expr(&self.root, resolver)
    }
}

/// Evaluates `formula` against an ordered provider list.
///
/// Time-shifted references are looked up with a context whose effective
/// period is moved back by the reference's lag.
pub fn evaluate(formula: &str, providers: &[&dyn ValueProvider], ctx: &Context) -> Result<f64> {
    let parsed = Formula::parse(formula)?;
    parsed.evaluate(&ProviderChain::new(providers, ctx))
}

/// Returns the unique dependency keys of `formula` without evaluating it.
///
/// `CASH` and `CASH[t-1]` are distinct keys; function names and literals are excluded.
pub fn extract_dependencies(formula: &str) -> Result<Vec<String>> {
    Ok(Formula::parse(formula)?.dependency_keys())
}

fn eval_expr(expr: &Expr, resolver: &dyn Resolver) -> Result<f64> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Variable(var) => resolver.resolve(var),
        Expr::Negate(inner) => Ok(-eval_expr(inner, resolver)?),
        Expr::Binary { op, left, right } => {
            let lhs = eval_expr(left, resolver)?;
            let rhs = eval_expr(right, resolver)?;
            let value = match op {
                BinaryOp::Add => lhs + rhs,
                BinaryOp::Subtract => lhs - rhs,
                BinaryOp::Multiply => lhs * rhs,
                BinaryOp::Divide => {
                    if rhs == 0.0 {
                        return Err(EngineError::DivisionByZero);
                    }
                    lhs / rhs
                }
                BinaryOp::Power => lhs.powf(rhs),
            };
            if !value.is_finite() {
                return Err(EngineError::NonFiniteResult);
            }
            Ok(value)
        }
        Expr::Compare { op, left, right } => {
            let lhs = eval_expr(left, resolver)?;
            let rhs = eval_expr(right, resolver)?;
            let holds = match op {
                CompareOp::Less => lhs < rhs,
                CompareOp::LessEqual => lhs <= rhs,
                CompareOp::Greater => lhs > rhs,
                CompareOp::GreaterEqual => lhs >= rhs,
                CompareOp::Equal => lhs == rhs,
                CompareOp::NotEqual => lhs != rhs,
            };
            Ok(if holds { 1.0 } else { 0.0 })
        }
        Expr::Call { name, args } => call_function(name, args, resolver),
    }
}

fn call_function(name: &str, args: &[Expr], resolver: &dyn Resolver) -> Result<f64> {
    let upper = name.to_ascii_uppercase();
    let expected = match upper.as_str() {
        "MIN" | "MAX" => 2,
        "ABS" => 1,
        "IF" => 3,
        _ => return Err(EngineError::UnknownFunction(name.to_string())),
    };
    if args.len() != expected {
        return Err(EngineError::ArityMismatch {
            function: upper,
            expected,
            got: args.len(),
        });
    }

    match upper.as_str() {
        "MIN" => Ok(eval_expr(&args[0], resolver)?.min(eval_expr(&args[1], resolver)?)),
        "MAX" => Ok(eval_expr(&args[0], resolver)?.max(eval_expr(&args[1], resolver)?)),
        "ABS" => Ok(eval_expr(&args[0], resolver)?.abs()),
        // Only the selected branch is evaluated.
        _ => {
            if eval_expr(&args[0], resolver)? != 0.0 {
                eval_expr(&args[1], resolver)
            } else {
                eval_expr(&args[2], resolver)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Compare(CompareOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Ident(s) => write!(f, "identifier '{}'", s),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Caret => f.write_str("'^'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::Comma => f.write_str("','"),
            Token::Compare(op) => write!(f, "comparison {:?}", op),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek_at(0) {
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }

            let start = self.pos;
            let token = match c {
                '+' => self.single(Token::Plus),
                '-' => self.single(Token::Minus),
                '*' => self.single(Token::Star),
                '/' => self.single(Token::Slash),
                '^' => self.single(Token::Caret),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                ',' => self.single(Token::Comma),
                '<' | '>' | '=' | '!' => self.comparison()?,
                c if c.is_ascii_digit() || c == '.' => self.number()?,
                c if c.is_ascii_alphabetic() || c == '_' => self.identifier(),
                other => {
                    return Err(EngineError::parse(
                        self.source,
                        start,
                        format!("Unexpected character '{}'", other),
                    ))
                }
            };

            tokens.push(Spanned {
                token,
                position: start,
            });
        }

        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    fn comparison(&mut self) -> Result<Token> {
        let start = self.pos;
        let first = self.chars[self.pos];
        let second = self.peek_at(1);
        let (op, width) = match (first, second) {
            ('<', Some('=')) => (CompareOp::LessEqual, 2),
            ('<', Some('>')) => (CompareOp::NotEqual, 2),
            ('<', _) => (CompareOp::Less, 1),
            ('>', Some('=')) => (CompareOp::GreaterEqual, 2),
            ('>', _) => (CompareOp::Greater, 1),
            ('=', Some('=')) => (CompareOp::Equal, 2),
            ('=', _) => (CompareOp::Equal, 1),
            ('!', Some('=')) => (CompareOp::NotEqual, 2),
            _ => {
                return Err(EngineError::parse(
                    self.source,
                    start,
                    "Expected '=' after '!'",
                ))
            }
        };
        self.pos += width;
        Ok(Token::Compare(op))
    }

    fn number(&mut self) -> Result<Token> {
        let start = self.pos;
        let mut text = String::new();

        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }

        // Exponent suffix only when digits follow, so `2E` stays a number then an identifier.
        if matches!(self.peek_at(0), Some('e' | 'E')) {
            let digit_at = match self.peek_at(1) {
                Some('+' | '-') => 2,
                _ => 1,
            };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..digit_at {
                    text.push(self.chars[self.pos]);
                    self.pos += 1;
                }
                while let Some(c) = self.peek_at(0).filter(|c| c.is_ascii_digit()) {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| EngineError::parse(self.source, start, format!("Invalid number '{}'", text)))
    }

    fn identifier(&mut self) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                name.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Ident(name)
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    references: Vec<VariableRef>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.position)
            .unwrap_or_else(|| self.source.chars().count())
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::parse(self.source, self.position(), message)
    }

    fn expect(&mut self, expected: Token, message: &str) -> Result<()> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;
        if let Some(Token::Compare(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_additive()?;
            if matches!(self.peek(), Some(Token::Compare(_))) {
                return Err(self.error("Chained comparisons are not supported"));
            }
            return Ok(Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            let exponent = self.parse_signed_primary()?;
            expr = Expr::Binary {
                op: BinaryOp::Power,
                left: Box::new(expr),
                right: Box::new(exponent),
            };
        }
        Ok(expr)
    }

    fn parse_signed_primary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Negate(Box::new(self.parse_signed_primary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_signed_primary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::LParen) => {
                let inner = self.parse_comparison()?;
                self.expect(Token::RParen, "Unmatched parenthesis: expected ')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.parse_call(name)
                } else {
                    self.parse_variable(name)
                }
            }
            Some(token) => Err(EngineError::parse(
                self.source,
                position,
                format!("Unexpected {}", token),
            )),
            None => Err(EngineError::parse(
                self.source,
                position,
                "Unexpected end of formula",
            )),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(Expr::Call { name, args });
        }

        loop {
            args.push(self.parse_comparison()?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(Token::RParen) => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    return Err(self.error(format!(
                        "Unmatched parenthesis in call to '{}': expected ',' or ')'",
                        name
                    )))
                }
            }
        }

        Ok(Expr::Call { name, args })
    }

    fn parse_variable(&mut self, name: String) -> Result<Expr> {
        let mut lag = 0;
        if self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            lag = self.parse_time_reference()?;
        }

        let var = VariableRef { name, lag };
        if !self.references.contains(&var) {
            self.references.push(var.clone());
        }
        Ok(Expr::Variable(var))
    }

    fn parse_time_reference(&mut self) -> Result<u32> {
        match self.advance() {
            Some(Token::Ident(t)) if t.eq_ignore_ascii_case("t") => {}
            _ => return Err(self.error("Time reference must start with 't'")),
        }

        let lag = match self.peek() {
            Some(Token::RBracket) => 0,
            Some(Token::Minus) => {
                self.pos += 1;
                let position = self.position();
                match self.advance() {
                    Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 && n <= MAX_TIME_SHIFT as f64 => {
                        n as u32
                    }
                    _ => {
                        return Err(EngineError::parse(
                            self.source,
                            position,
                            "Expected a non-negative integer offset in time reference",
                        ))
                    }
                }
            }
            Some(Token::Plus) => {
                return Err(self.error("Forward time references are not supported"));
            }
            _ => return Err(self.error("Malformed time reference")),
        };

        self.expect(Token::RBracket, "Expected ']' to close time reference")?;
        Ok(lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::{DriverValueProvider, MapProvider};

    fn eval(formula: &str) -> Result<f64> {
        let provider = MapProvider::new();
        let ctx = Context::new(1, 1, "E1");
        evaluate(formula, &[&provider], &ctx)
    }

    fn approx(formula: &str, expected: f64) {
        let value = eval(formula).unwrap();
        assert!(
            (value - expected).abs() < 1e-9,
            "{} = {}, expected {}",
            formula,
            value,
            expected
        );
    }

    #[test]
    fn test_precedence_and_associativity() {
        approx("2+3*4", 14.0);
        approx("2*3^2", 18.0);
        approx("4^2/2", 8.0);
        approx("10-3-2", 5.0);
        approx("20/4/2", 2.5);
        approx("(2+3)*4", 20.0);
        approx("2^3^2", 64.0);
        approx("-2^2", -4.0);
        approx("2^-1", 0.5);
        approx("--3", 3.0);
        approx("+4 - -1", 5.0);
    }

    #[test]
    fn test_numeric_literals() {
        approx(".5 * 4", 2.0);
        approx("1e3 + 2.5E-1", 1000.25);
        approx("  42  ", 42.0);
    }

    #[test]
    fn test_builtin_functions() {
        approx("MIN(5,3)", 3.0);
        approx("MAX(5,3)", 5.0);
        approx("ABS(-5)", 5.0);
        approx("IF(0,10,20)", 20.0);
        approx("IF(5,10,20)", 10.0);
        approx("max(1, min(4, 2))", 2.0);
        approx("IF(3 > 2, 1, 0)", 1.0);
    }

    #[test]
    fn test_if_only_evaluates_selected_branch() {
        approx("IF(1, 7, 1/0)", 7.0);
    }

    #[test]
    fn test_comparisons() {
        approx("3 <= 3", 1.0);
        approx("3 < 3", 0.0);
        approx("4 = 4", 1.0);
        approx("4 <> 4", 0.0);
        approx("1 + 1 == 2", 1.0);
        approx("5 != 2 * 2", 1.0);
    }

    #[test]
    fn test_failures_are_errors() {
        assert!(matches!(eval("1/0"), Err(EngineError::DivisionByZero)));
        assert_eq!(eval("(1+2").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("1+2)").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("   ").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("2 $ 3").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("1 < 2 < 3").unwrap_err().kind(), ErrorKind::Parse);
        assert!(matches!(
            eval("UNKNOWN_THING + 1"),
            Err(EngineError::UnknownVariable(_))
        ));
        assert!(matches!(
            eval("FOO(1)"),
            Err(EngineError::UnknownFunction(name)) if name == "FOO"
        ));
        match eval("MIN(1,2,3)") {
            Err(EngineError::ArityMismatch {
                function,
                expected,
                got,
            }) => {
                assert_eq!(function, "MIN");
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("expected arity error, got {:?}", other),
        }
        assert!(matches!(eval("ABS()"), Err(EngineError::ArityMismatch { .. })));
        assert!(matches!(eval("0^-1"), Err(EngineError::NonFiniteResult)));
    }

    #[test]
    fn test_variables_resolve_through_providers() {
        let mut provider = MapProvider::new();
        provider.insert("REVENUE", 1000.0);
        provider.insert("COGS", 600.0);
        let ctx = Context::new(1, 5, "E1");

        let value = evaluate("REVENUE - COGS", &[&provider], &ctx).unwrap();
        assert!((value - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_dependencies_deduplicates_in_order() {
        assert_eq!(
            extract_dependencies("REVENUE + REVENUE*0.1").unwrap(),
            vec!["REVENUE"]
        );
        assert_eq!(
            extract_dependencies("CASH[t-1] + NET_CF").unwrap(),
            vec!["CASH[t-1]", "NET_CF"]
        );
        assert_eq!(
            extract_dependencies("MAX(REVENUE, MIN_REVENUE) + CASH[t] + CASH").unwrap(),
            vec!["REVENUE", "MIN_REVENUE", "CASH"]
        );
        assert_eq!(
            extract_dependencies("CASH[ t - 2 ] + CASH[t-1]").unwrap(),
            vec!["CASH[t-2]", "CASH[t-1]"]
        );
        assert!(extract_dependencies("ABS(-3) + 4").unwrap().is_empty());
    }

    #[test]
    fn test_time_reference_errors() {
        assert_eq!(eval("CASH[t+1]").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("CASH[x-1]").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("CASH[t-1.5]").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("CASH[t-1").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("CASH[t-2147483648]").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(eval("CASH[t-4294967295]").unwrap_err().kind(), ErrorKind::Parse);
        assert!(VariableRef::parse_key("CASH[t-4294967295]").is_none());
    }

    #[test]
    fn test_large_time_shift_does_not_wrap() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "PRICE", 1, &[10.0, 20.0, 30.0]);
        let ctx = Context::new(1, 2, "E1");

        let err = evaluate("PRICE[t-2147483647]", &[&drivers], &ctx).unwrap_err();
        assert!(matches!(err, EngineError::UnknownVariable(_)));
        assert!((evaluate("PRICE[t-1]", &[&drivers], &ctx).unwrap() - 10.0).abs() < 1e-9);

        let far = Context::new(1, -10, "E1");
        let err = evaluate("PRICE[t-2147483647]", &[&drivers], &far).unwrap_err();
        assert!(matches!(err, EngineError::TimeShiftOutOfRange { .. }));
        assert_eq!(err.kind(), ErrorKind::Evaluation);
    }

    #[test]
    fn test_variable_ref_keys_round_trip() {
        let shifted = VariableRef::parse_key("CASH[ t - 1 ]").unwrap();
        assert_eq!(shifted, VariableRef::shifted("CASH", 1));
        assert_eq!(shifted.key(), "CASH[t-1]");
        assert_eq!(VariableRef::parse_key("CASH[t]").unwrap().key(), "CASH");
        assert!(VariableRef::parse_key("CASH[t+1]").is_none());
    }

    #[test]
    fn test_closure_resolver() {
        let formula = Formula::parse("A * 2 + B[t-1]").unwrap();
        let resolver = |var: &VariableRef| -> Result<f64> {
            match (var.name.as_str(), var.lag) {
                ("A", 0) => Ok(3.0),
                ("B", 1) => Ok(10.0),
                _ => Err(EngineError::UnknownVariable(var.key())),
            }
        };
        assert!((formula.evaluate(&resolver).unwrap() - 16.0).abs() < 1e-9);
    }
}
