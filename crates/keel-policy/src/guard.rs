//! Restricted guard expression language.
//!
//! Expressions may read fields under the declared context namespaces,
//! compare them, and combine comparisons with `and` / `or` / `not`. There
//! are no function calls, no attribute escape outside the namespaces, and
//! no mutation: the evaluator only ever borrows the context. Numeric
//! comparison is decimal, never floating point.
//!
//! Grammar:
//! ```text
//! expr    := and_expr ( 'or' and_expr )*
//! and_expr:= unary ( 'and' unary )*
//! unary   := 'not' unary | primary
//! primary := '(' expr ')' | operand ( cmp_op operand )?
//! operand := path | string | number | 'true' | 'false' | 'null'
//! cmp_op  := '==' | '!=' | '<' | '<=' | '>' | '>='
//! ```

use crate::context::EvalContext;
use crate::definition::GuardDisposition;
use keel_types::{ErrorCode, KernelError, KernelResult};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Literal operand values.
#[derive(Debug, Clone, PartialEq)]
pub enum LitValue {
    Str(String),
    Num(Decimal),
    Bool(bool),
    Null,
}

/// Parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    Literal(LitValue),
    Path(String),
    Not(Box<GuardExpr>),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Compare {
        op: CmpOp,
        left: Box<GuardExpr>,
        right: Box<GuardExpr>,
    },
}

/// Expression parse failure, reported by the compiler with the offending
/// expression attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub detail: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Num(Decimal),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(ParseError {
                        detail: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (op, len) = match two.as_str() {
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    "<=" => (CmpOp::Le, 2),
                    ">=" => (CmpOp::Ge, 2),
                    _ if c == '<' => (CmpOp::Lt, 1),
                    _ if c == '>' => (CmpOp::Gt, 1),
                    other => {
                        return Err(ParseError {
                            detail: format!("unrecognized operator '{other}'"),
                        })
                    }
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let literal: String = chars[start..end].iter().collect();
                let value = Decimal::from_str(&literal).map_err(|_| ParseError {
                    detail: format!("invalid number '{literal}'"),
                })?;
                tokens.push(Token::Num(value));
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_' || chars[end] == '.')
                {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Path(word),
                };
                tokens.push(token);
                i = end;
            }
            other => {
                return Err(ParseError {
                    detail: format!("unexpected character '{other}'"),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    allowed_roots: &'a [&'a str],
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, ParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, ParseError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, ParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, ParseError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.bump();
            let inner = self.parse_expr()?;
            match self.bump() {
                Some(Token::RParen) => return Ok(inner),
                _ => {
                    return Err(ParseError {
                        detail: "expected ')'".to_string(),
                    })
                }
            }
        }

        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.bump();
            let right = self.parse_operand()?;
            return Ok(GuardExpr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<GuardExpr, ParseError> {
        match self.bump() {
            Some(Token::Path(path)) => {
                let root = path.split('.').next().unwrap_or_default();
                if !self.allowed_roots.contains(&root) {
                    return Err(ParseError {
                        detail: format!(
                            "path '{path}' escapes the declared namespaces ({})",
                            self.allowed_roots.join(", ")
                        ),
                    });
                }
                Ok(GuardExpr::Path(path))
            }
            Some(Token::Num(value)) => Ok(GuardExpr::Literal(LitValue::Num(value))),
            Some(Token::Str(value)) => Ok(GuardExpr::Literal(LitValue::Str(value))),
            Some(Token::True) => Ok(GuardExpr::Literal(LitValue::Bool(true))),
            Some(Token::False) => Ok(GuardExpr::Literal(LitValue::Bool(false))),
            Some(Token::Null) => Ok(GuardExpr::Literal(LitValue::Null)),
            other => Err(ParseError {
                detail: format!("expected operand, found {other:?}"),
            }),
        }
    }
}

impl GuardExpr {
    /// Parse an expression whose paths must stay inside `allowed_roots`.
    pub fn parse(input: &str, allowed_roots: &[&str]) -> Result<Self, ParseError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ParseError {
                detail: "empty expression".to_string(),
            });
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            allowed_roots,
        };
        let expr = parser.parse_expr()?;
        if parser.pos != tokens.len() {
            return Err(ParseError {
                detail: "trailing tokens after expression".to_string(),
            });
        }
        Ok(expr)
    }

    /// Number of comparison nodes; the selector uses this as predicate
    /// specificity.
    pub fn specificity(&self) -> u32 {
        match self {
            Self::Literal(_) | Self::Path(_) => 0,
            Self::Not(inner) => inner.specificity(),
            Self::And(l, r) | Self::Or(l, r) => l.specificity() + r.specificity(),
            Self::Compare { .. } => 1,
        }
    }

    /// Evaluate to a boolean against the posting context.
    pub fn evaluate(&self, ctx: &EvalContext) -> KernelResult<bool> {
        Ok(self.eval_operand(ctx)?.truthy())
    }

    fn eval_operand(&self, ctx: &EvalContext) -> KernelResult<Operand> {
        match self {
            Self::Literal(lit) => Ok(Operand::from_literal(lit)),
            Self::Path(path) => Ok(ctx
                .lookup(path)
                .map(Operand::from_json)
                .unwrap_or(Operand::Null)),
            Self::Not(inner) => Ok(Operand::Bool(!inner.eval_operand(ctx)?.truthy())),
            Self::And(l, r) => Ok(Operand::Bool(
                l.eval_operand(ctx)?.truthy() && r.eval_operand(ctx)?.truthy(),
            )),
            Self::Or(l, r) => Ok(Operand::Bool(
                l.eval_operand(ctx)?.truthy() || r.eval_operand(ctx)?.truthy(),
            )),
            Self::Compare { op, left, right } => {
                let l = left.eval_operand(ctx)?;
                let r = right.eval_operand(ctx)?;
                compare(*op, &l, &r).map(Operand::Bool)
            }
        }
    }
}

/// Runtime operand values during evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Null,
    Bool(bool),
    Num(Decimal),
    Str(String),
}

impl Operand {
    fn from_literal(lit: &LitValue) -> Self {
        match lit {
            LitValue::Str(s) => Self::Str(s.clone()),
            LitValue::Num(n) => Self::Num(*n),
            LitValue::Bool(b) => Self::Bool(*b),
            LitValue::Null => Self::Null,
        }
    }

    fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .map(Self::Num)
                .unwrap_or_else(|_| Self::Str(n.to_string())),
            Value::String(s) => Self::Str(s.clone()),
            // Containers have no scalar comparison semantics.
            other => Self::Str(other.to_string()),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Num(n) => !n.is_zero(),
            Self::Str(s) => !s.is_empty(),
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => Decimal::from_str(s).ok(),
            _ => None,
        }
    }
}

fn compare(op: CmpOp, left: &Operand, right: &Operand) -> KernelResult<bool> {
    if let (Some(l), Some(r)) = (left.as_decimal(), right.as_decimal()) {
        return Ok(match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        });
    }

    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        _ => Err(KernelError::new(
            ErrorCode::GuardRejected,
            format!("ordered comparison on non-numeric operands {left:?} and {right:?}"),
        )),
    }
}

/// Guard compiled alongside its policy: parsed expression plus disposition.
#[derive(Debug, Clone)]
pub struct CompiledGuard {
    pub name: String,
    pub expression: GuardExpr,
    pub disposition: GuardDisposition,
    pub reason_code: String,
}

/// Result of evaluating a policy's guard set.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Pass,
    Reject { guard: String, reason_code: String },
    Block { guard: String, reason_code: String },
}

/// Evaluate guards in declaration order; the first failing guard decides.
pub fn evaluate_guards(guards: &[CompiledGuard], ctx: &EvalContext) -> KernelResult<GuardVerdict> {
    for guard in guards {
        if !guard.expression.evaluate(ctx)? {
            return Ok(match guard.disposition {
                GuardDisposition::Reject => GuardVerdict::Reject {
                    guard: guard.name.clone(),
                    reason_code: guard.reason_code.clone(),
                },
                GuardDisposition::Block => GuardVerdict::Block {
                    guard: guard.name.clone(),
                    reason_code: guard.reason_code.clone(),
                },
            });
        }
    }
    Ok(GuardVerdict::Pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use keel_types::BusinessEvent;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const ROOTS: &[&str] = &["payload", "party", "contract", "event"];

    fn ctx(payload: Value) -> EvalContext {
        let event = BusinessEvent {
            event_id: "evt-1".to_string(),
            event_type: "inventory.receipt".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            effective_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            actor_id: "svc".to_string(),
            producer: "inventory".to_string(),
            schema_version: 1,
            payload,
            payload_hash: "h".to_string(),
            ingested_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 1).unwrap(),
        };
        EvalContext::new(&event, Some(json!({"status": "active"})), None)
    }

    #[test]
    fn numeric_comparison_is_decimal() {
        let expr = GuardExpr::parse("payload.amount >= 100.10", ROOTS).unwrap();
        assert!(expr.evaluate(&ctx(json!({"amount": "100.10"}))).unwrap());
        assert!(!expr.evaluate(&ctx(json!({"amount": "100.09"}))).unwrap());
    }

    #[test]
    fn boolean_combinators_short_circuit_sensibly() {
        let expr = GuardExpr::parse(
            "payload.qty > 0 and (payload.kind == 'receipt' or payload.kind == 'return')",
            ROOTS,
        )
        .unwrap();
        assert!(expr
            .evaluate(&ctx(json!({"qty": 5, "kind": "return"})))
            .unwrap());
        assert!(!expr
            .evaluate(&ctx(json!({"qty": 5, "kind": "issue"})))
            .unwrap());
    }

    #[test]
    fn missing_fields_read_as_null() {
        let expr = GuardExpr::parse("payload.reference != null", ROOTS).unwrap();
        assert!(!expr.evaluate(&ctx(json!({}))).unwrap());
        assert!(expr.evaluate(&ctx(json!({"reference": "po-1"}))).unwrap());
    }

    #[test]
    fn paths_outside_namespaces_fail_to_parse() {
        let err = GuardExpr::parse("secrets.key == 'x'", ROOTS).unwrap_err();
        assert!(err.detail.contains("escapes"));
    }

    #[test]
    fn call_like_input_fails_to_parse() {
        assert!(GuardExpr::parse("payload.amount.exec()", ROOTS).is_err());
        assert!(GuardExpr::parse("__import__", ROOTS).is_err());
    }

    #[test]
    fn ordered_comparison_of_strings_errors() {
        let expr = GuardExpr::parse("payload.kind > 'receipt'", ROOTS).unwrap();
        let err = expr.evaluate(&ctx(json!({"kind": "issue"}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GuardRejected);
    }

    #[test]
    fn specificity_counts_comparisons() {
        let expr = GuardExpr::parse(
            "payload.qty > 0 and payload.kind == 'receipt' and not (payload.amount == 0)",
            ROOTS,
        )
        .unwrap();
        assert_eq!(expr.specificity(), 3);
    }

    #[test]
    fn first_failing_guard_decides_disposition() {
        let guards = vec![
            CompiledGuard {
                name: "has_reference".to_string(),
                expression: GuardExpr::parse("payload.reference != null", ROOTS).unwrap(),
                disposition: GuardDisposition::Block,
                reason_code: "MISSING_UPSTREAM_DOCUMENT".to_string(),
            },
            CompiledGuard {
                name: "positive_amount".to_string(),
                expression: GuardExpr::parse("payload.amount > 0", ROOTS).unwrap(),
                disposition: GuardDisposition::Reject,
                reason_code: "NON_POSITIVE_AMOUNT".to_string(),
            },
        ];

        let verdict = evaluate_guards(&guards, &ctx(json!({"amount": "10"}))).unwrap();
        assert_eq!(
            verdict,
            GuardVerdict::Block {
                guard: "has_reference".to_string(),
                reason_code: "MISSING_UPSTREAM_DOCUMENT".to_string(),
            }
        );

        let verdict =
            evaluate_guards(&guards, &ctx(json!({"reference": "po-1", "amount": "0"}))).unwrap();
        assert_eq!(
            verdict,
            GuardVerdict::Reject {
                guard: "positive_amount".to_string(),
                reason_code: "NON_POSITIVE_AMOUNT".to_string(),
            }
        );
    }

    #[test]
    fn literal_decimal_parse_is_exact() {
        let expr = GuardExpr::parse("payload.rate == 0.1", ROOTS).unwrap();
        assert!(expr.evaluate(&ctx(json!({"rate": "0.1"}))).unwrap());
        assert_eq!(
            GuardExpr::parse("0.30", ROOTS).unwrap(),
            GuardExpr::Literal(LitValue::Num(dec!(0.30)))
        );
    }
}
