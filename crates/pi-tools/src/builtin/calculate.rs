// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolResult, UpdateFn};

/// Built-in arithmetic calculator.  Evaluates `+ - * / %` with parentheses
/// over 64-bit floats; integral results render without a decimal point.
#[derive(Default)]
pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn label(&self) -> &str {
        "Calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression (+, -, *, /, %, parentheses) and return the result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The arithmetic expression to evaluate, e.g. \"123 * 456\"."
                }
            },
            "required": ["expression"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        params: Value,
        _cancel: CancellationToken,
        _on_update: Option<UpdateFn>,
    ) -> ToolResult {
        let Some(expression) = params.get("expression").and_then(Value::as_str) else {
            return ToolResult::err("missing required parameter 'expression'");
        };
        match eval(expression) {
            Ok(n) => {
                let rendered = if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                };
                ToolResult::ok(rendered)
            }
            Err(e) => ToolResult::err(format!("cannot evaluate {expression:?}: {e}")),
        }
    }
}

/// Recursive-descent evaluation: expr := term (('+'|'-') term)*,
/// term := factor (('*'|'/'|'%') factor)*, factor := number | '(' expr ')'
/// with unary minus.
fn eval(input: &str) -> Result<f64, String> {
    let tokens = tokenize(input)?;
    let mut pos = 0;
    let value = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected token at position {pos}"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || d == '_' {
                        if d != '_' {
                            num.push(d);
                        }
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(
                    num.parse().map_err(|_| format!("bad number {num:?}"))?,
                ));
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_term(tokens, pos)?;
    while let Some(Token::Op(op @ ('+' | '-'))) = tokens.get(*pos) {
        let op = *op;
        *pos += 1;
        let rhs = parse_term(tokens, pos)?;
        value = if op == '+' { value + rhs } else { value - rhs };
    }
    Ok(value)
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    let mut value = parse_factor(tokens, pos)?;
    while let Some(Token::Op(op @ ('*' | '/' | '%'))) = tokens.get(*pos) {
        let op = *op;
        *pos += 1;
        let rhs = parse_factor(tokens, pos)?;
        value = match op {
            '*' => value * rhs,
            '/' => {
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value / rhs
            }
            _ => {
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value % rhs
            }
        };
    }
    Ok(value)
}

fn parse_factor(tokens: &[Token], pos: &mut usize) -> Result<f64, String> {
    match tokens.get(*pos) {
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(Token::Op('-')) => {
            *pos += 1;
            Ok(-parse_factor(tokens, pos)?)
        }
        Some(Token::LParen) => {
            *pos += 1;
            let value = parse_expr(tokens, pos)?;
            if tokens.get(*pos) != Some(&Token::RParen) {
                return Err("missing closing parenthesis".into());
            }
            *pos += 1;
            Ok(value)
        }
        other => Err(format!("expected a number, got {other:?}")),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
