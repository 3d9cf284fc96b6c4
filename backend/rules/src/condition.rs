//! Rule conditions: a small boolean language over the request context.
//!
//! Conditions are parsed once when rules are compiled. Evaluation is total:
//! a comparison that touches an absent field is simply false.
//!
//! Grammar (informal):
//! - operands: field references (`verb`, `user.groups`, `object.<path>`),
//!   string literals (`'x'` or `"x"`), `true`/`false`, lists `['a', 'b']`
//! - comparisons: `a == b`, `a != b`, `a in b`
//! - boolean: `!`/`not`, `&&`/`and`, `||`/`or`, parentheses
//!
//! A bare field in boolean position is true when its value is `"true"`.

use std::fmt;

use relgate_core::{ContextField, RequestContext};
use thiserror::Error;

/// Maximum nesting depth for parenthesised / negated expressions.
const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,
    #[error("unexpected `{found}` at {position}, expected {expected}")]
    UnexpectedToken { expected: &'static str, found: String, position: usize },
    #[error("unterminated string starting at {position}")]
    UnterminatedString { position: usize },
    #[error("unknown field `{name}` at {position}")]
    UnknownField { name: String, position: usize },
    #[error("nesting deeper than 32 levels at {position}")]
    TooDeep { position: usize },
}

/// Parsed condition tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Bool(bool),
    Truthy(Operand),
    Compare { op: CompareOp, left: Operand, right: Operand },
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    In,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Field(ContextField),
    Str(String),
    Bool(bool),
    List(Vec<String>),
}

/// A compiled condition, ready to evaluate against many requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source`. `declared` lists the `object.*` paths that may be referenced.
    pub fn parse(source: &str, declared: &[String]) -> Result<Self, ConditionError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, index: 0, depth: 0, declared };
        let expr = parser.parse_or()?;
        parser.expect_eof()?;
        Ok(Self { source: source.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, ctx: &RequestContext) -> bool {
        eval(&self.expr, ctx)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A resolved operand value.
enum Resolved {
    One(String),
    Many(Vec<String>),
    Bool(bool),
}

fn resolve(operand: &Operand, ctx: &RequestContext) -> Option<Resolved> {
    match operand {
        Operand::Str(s) => Some(Resolved::One(s.clone())),
        Operand::Bool(b) => Some(Resolved::Bool(*b)),
        Operand::List(items) => Some(Resolved::Many(items.clone())),
        Operand::Field(field) => {
            let mut values = ctx.resolve(field)?;
            if field.is_multi_valued() {
                Some(Resolved::Many(values))
            } else {
                values.pop().map(Resolved::One)
            }
        }
    }
}

fn eval(expr: &Expr, ctx: &RequestContext) -> bool {
    match expr {
        Expr::Bool(b) => *b,
        Expr::Truthy(operand) => match resolve(operand, ctx) {
            Some(Resolved::Bool(b)) => b,
            Some(Resolved::One(s)) => s == "true",
            _ => false,
        },
        Expr::Not(inner) => !eval(inner, ctx),
        Expr::And(parts) => parts.iter().all(|p| eval(p, ctx)),
        Expr::Or(parts) => parts.iter().any(|p| eval(p, ctx)),
        Expr::Compare { op, left, right } => {
            let (Some(l), Some(r)) = (resolve(left, ctx), resolve(right, ctx)) else {
                return false;
            };
            match op {
                CompareOp::Eq => equal(&l, &r),
                CompareOp::Ne => !equal(&l, &r),
                CompareOp::In => match (&l, &r) {
                    (Resolved::One(item), Resolved::Many(set)) => set.contains(item),
                    (Resolved::Many(items), Resolved::Many(set)) => {
                        items.iter().any(|i| set.contains(i))
                    }
                    _ => false,
                },
            }
        }
    }
}

fn equal(l: &Resolved, r: &Resolved) -> bool {
    match (l, r) {
        (Resolved::One(a), Resolved::One(b)) => a == b,
        (Resolved::Bool(a), Resolved::Bool(b)) => a == b,
        (Resolved::One(a), Resolved::Bool(b)) | (Resolved::Bool(b), Resolved::One(a)) => {
            a == if *b { "true" } else { "false" }
        }
        (Resolved::Many(a), Resolved::Many(b)) => {
            let mut a = a.clone();
            let mut b = b.clone();
            a.sort();
            b.sort();
            a == b
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    In,
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => s.clone(),
            Self::Str(s) => format!("'{s}'"),
            Self::Eq => "==".into(),
            Self::Ne => "!=".into(),
            Self::In => "in".into(),
            Self::And => "&&".into(),
            Self::Or => "||".into(),
            Self::Not => "!".into(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::LBracket => "[".into(),
            Self::RBracket => "]".into(),
            Self::Comma => ",".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

fn lex(input: &str) -> Result<Vec<Spanned>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let next = bytes.get(i + 1).copied();
        let token = match bytes[i] {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b'=' if next == Some(b'=') => {
                i += 1;
                Token::Eq
            }
            b'!' if next == Some(b'=') => {
                i += 1;
                Token::Ne
            }
            b'!' => Token::Not,
            b'&' if next == Some(b'&') => {
                i += 1;
                Token::And
            }
            b'|' if next == Some(b'|') => {
                i += 1;
                Token::Or
            }
            quote @ (b'\'' | b'"') => {
                let rest = &input[i + 1..];
                let end = rest
                    .find(char::from(quote))
                    .ok_or(ConditionError::UnterminatedString { position: start })?;
                let literal = rest[..end].to_string();
                i += end + 2;
                tokens.push(Spanned { token: Token::Str(literal), position: start });
                continue;
            }
            b if b.is_ascii_alphanumeric() || b == b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'.' | b'-'))
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, position: start });
                continue;
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    expected: "field, literal, or operator",
                    found: char::from(other).to_string(),
                    position: start,
                })
            }
        };
        i += 1;
        tokens.push(Spanned { token, position: start });
    }

    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    tokens.push(Spanned { token: Token::Eof, position: input.len() });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Spanned>,
    index: usize,
    depth: usize,
    declared: &'a [String],
}

impl Parser<'_> {
    fn current(&self) -> &Spanned {
        // lex() always terminates the stream with Eof and we never advance past it
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if &self.current().token == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &'static str) -> ConditionError {
        ConditionError::UnexpectedToken {
            expected,
            found: self.current().token.describe(),
            position: self.current().position,
        }
    }

    fn expect_eof(&self) -> Result<(), ConditionError> {
        if self.current().token == Token::Eof {
            Ok(())
        } else {
            Err(self.unexpected("end of input"))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut parts = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut parts = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            parts.push(self.parse_unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat(&Token::LParen) {
            self.enter()?;
            let inner = self.parse_or()?;
            if !self.eat(&Token::RParen) {
                return Err(self.unexpected(")"));
            }
            self.depth -= 1;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn enter(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ConditionError::TooDeep { position: self.current().position });
        }
        Ok(())
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;
        let op = match self.current().token {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::In => CompareOp::In,
            _ => {
                return match left {
                    Operand::Bool(b) => Ok(Expr::Bool(b)),
                    Operand::Field(_) => Ok(Expr::Truthy(left)),
                    _ => Err(self.unexpected("comparison operator")),
                };
            }
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare { op, left, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        let Spanned { token, position } = self.current().clone();
        match token {
            Token::Str(s) => {
                self.advance();
                Ok(Operand::Str(s))
            }
            Token::Ident(word) => {
                self.advance();
                match word.as_str() {
                    "true" => Ok(Operand::Bool(true)),
                    "false" => Ok(Operand::Bool(false)),
                    _ => ContextField::parse(&word, self.declared)
                        .map(Operand::Field)
                        .ok_or(ConditionError::UnknownField { name: word, position }),
                }
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Operand::List(items));
                }
                loop {
                    match self.current().token.clone() {
                        Token::Str(s) => {
                            self.advance();
                            items.push(s);
                        }
                        _ => return Err(self.unexpected("string literal")),
                    }
                    if self.eat(&Token::RBracket) {
                        return Ok(Operand::List(items));
                    }
                    if !self.eat(&Token::Comma) {
                        return Err(self.unexpected(", or ]"));
                    }
                }
            }
            _ => Err(self.unexpected("field or literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{ResourceKind, UserInfo, Verb};

    fn ctx() -> RequestContext {
        RequestContext::new(
            Verb::Create,
            ResourceKind::new("v1", "pods"),
            UserInfo::new("alice", vec!["dev".into(), "admins".into()]),
        )
        .with_namespace(Some("team-a".into()))
        .with_name(Some("nginx".into()))
        .with_field("metadata.labels.tier", "frontend")
    }

    fn declared() -> Vec<String> {
        vec!["metadata.labels.tier".into(), "spec.hostNetwork".into()]
    }

    fn eval_str(src: &str) -> bool {
        Condition::parse(src, &declared()).unwrap().evaluate(&ctx())
    }

    #[test]
    fn equality_and_negation() {
        assert!(eval_str("verb == 'create'"));
        assert!(!eval_str("verb == \"delete\""));
        assert!(eval_str("namespace != 'kube-system'"));
        assert!(eval_str("!(resource == 'namespaces')"));
        assert!(eval_str("not resource == 'namespaces'"));
    }

    #[test]
    fn group_membership() {
        assert!(eval_str("'admins' in user.groups"));
        assert!(!eval_str("'root' in user.groups"));
        assert!(eval_str("verb in ['create', 'update']"));
        assert!(!eval_str("verb in []"));
    }

    #[test]
    fn logical_composition() {
        assert!(eval_str("verb == 'create' && 'dev' in user.groups"));
        assert!(eval_str("verb == 'get' || user.name == 'alice'"));
        assert!(!eval_str("verb == 'get' or user.name == 'bob'"));
        assert!(eval_str("(verb == 'get' or verb == 'create') and object.metadata.labels.tier == 'frontend'"));
    }

    #[test]
    fn absent_fields_evaluate_false() {
        assert!(!eval_str("object.spec.hostNetwork"));
        assert!(!eval_str("object.spec.hostNetwork == 'true'"));
        assert!(!eval_str("object.spec.hostNetwork != 'true'"));
        let cluster_scoped = ctx().with_namespace(None);
        let cond = Condition::parse("namespace == 'team-a'", &declared()).unwrap();
        assert!(!cond.evaluate(&cluster_scoped));
    }

    #[test]
    fn truthy_fields() {
        let c = Condition::parse("object.spec.hostNetwork", &declared()).unwrap();
        assert!(c.evaluate(&ctx().with_field("spec.hostNetwork", "true")));
        assert!(!c.evaluate(&ctx().with_field("spec.hostNetwork", "false")));
        assert!(eval_str("true"));
        assert!(!eval_str("false && true"));
    }

    #[test]
    fn malformed_conditions_fail_to_parse() {
        let d = declared();
        assert_eq!(Condition::parse("   ", &d), Err(ConditionError::Empty));
        assert!(matches!(
            Condition::parse("user.email == 'x'", &d),
            Err(ConditionError::UnknownField { .. })
        ));
        assert!(matches!(
            Condition::parse("object.spec.nodeName == 'x'", &d),
            Err(ConditionError::UnknownField { .. })
        ));
        assert!(matches!(
            Condition::parse("verb == 'get", &d),
            Err(ConditionError::UnterminatedString { .. })
        ));
        assert!(matches!(Condition::parse("verb ==", &d), Err(ConditionError::UnexpectedToken { .. })));
        assert!(matches!(Condition::parse("(verb == 'x'", &d), Err(ConditionError::UnexpectedToken { .. })));
        assert!(matches!(Condition::parse("'x'", &d), Err(ConditionError::UnexpectedToken { .. })));
        assert!(matches!(Condition::parse("verb = 'x'", &d), Err(ConditionError::UnexpectedToken { .. })));
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}verb == 'get'{}", "(".repeat(40), ")".repeat(40));
        assert!(matches!(Condition::parse(&deep, &declared()), Err(ConditionError::TooDeep { .. })));
    }
}
