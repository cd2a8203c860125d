// SPDX-License-Identifier: MIT
//! The `{{ … }}` template language and the condition mini-evaluator.
//!
//! Expressions resolve against an immutable snapshot of the inputs and
//! prior step results:
//!
//!   inputs.«name»           — input value after defaults
//!   steps.«id».result       — a prior step's text
//!   steps.«id».is_error     — boolean
//!   steps.«id».json.«path»  — dot path into the lazily parsed result JSON
//!
//! A result that is not valid JSON makes every `json.…` path yield the
//! empty string — not an error. Unknown inputs and unknown step ids are
//! errors. Conditions support `==`, `!=`, `&&`, `||` and the literals
//! `true`, `false`, numbers and single-quoted strings.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde_json::{Map, Value};

static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("template regex"));

/// A finished step's contribution to the template context. The structured
/// form of the text is parsed at most once, on first `json.…` access.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub text: String,
    pub is_error: bool,
    json: OnceCell<Option<Value>>,
}

impl StepResult {
    pub fn new(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            text: text.into(),
            is_error,
            json: OnceCell::new(),
        }
    }

    fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_str(&self.text).ok())
            .as_ref()
    }
}

/// Immutable snapshot passed into a step's argument resolution and
/// condition evaluation. Steps in one level never see one another.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub inputs: Map<String, Value>,
    pub steps: HashMap<String, StepResult>,
}

impl TemplateContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            steps: HashMap::new(),
        }
    }
}

/// Resolve every string in an argument mapping. Non-string values pass
/// through; nested arrays and objects are resolved recursively.
pub fn resolve_args(args: &Map<String, Value>, ctx: &TemplateContext) -> Result<Map<String, Value>> {
    let mut resolved = Map::new();
    for (key, value) in args {
        resolved.insert(key.clone(), resolve_value(value, ctx)?);
    }
    Ok(resolved)
}

fn resolve_value(value: &Value, ctx: &TemplateContext) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, ctx))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// A string that is exactly one placeholder resolves to the typed value —
/// numbers stay numbers, booleans stay booleans. Embedded placeholders
/// stringify into the surrounding text.
pub fn resolve_string(input: &str, ctx: &TemplateContext) -> Result<Value> {
    if let Some(caps) = TEMPLATE_RE.captures(input) {
        let whole = caps.get(0).unwrap();
        if whole.start() == 0 && whole.end() == input.len() {
            return eval_expr(&caps[1], ctx);
        }
    }

    let mut out = String::new();
    let mut last = 0;
    for caps in TEMPLATE_RE.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        out.push_str(&input[last..whole.start()]);
        out.push_str(&stringify(&eval_expr(&caps[1], ctx)?));
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(Value::String(out))
}

fn eval_expr(expr: &str, ctx: &TemplateContext) -> Result<Value> {
    let parts: Vec<&str> = expr.split('.').collect();
    match parts.as_slice() {
        ["inputs", name] => ctx
            .inputs
            .get(*name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown input '{name}'")),
        ["steps", id, rest @ ..] if !rest.is_empty() => {
            let step = ctx
                .steps
                .get(*id)
                .ok_or_else(|| anyhow!("unknown step '{id}'"))?;
            match rest {
                ["result"] => Ok(Value::String(step.text.clone())),
                ["is_error"] => Ok(Value::Bool(step.is_error)),
                ["json", path @ ..] => Ok(json_path(step.json(), path)),
                _ => bail!("unknown step field '{}'", rest.join(".")),
            }
        }
        _ => bail!("unrecognized expression '{expr}'"),
    }
}

/// Walk a dot path through the parsed JSON. Missing anything — including a
/// result that is not JSON at all — yields the empty string.
fn json_path(root: Option<&Value>, path: &[&str]) -> Value {
    let Some(mut current) = root else {
        return Value::String(String::new());
    };
    for segment in path {
        current = match current {
            Value::Object(map) => match map.get(*segment) {
                Some(v) => v,
                None => return Value::String(String::new()),
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::String(String::new()),
            },
            _ => return Value::String(String::new()),
        };
    }
    current.clone()
}

pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ─── Conditions ──────────────────────────────────────────────────────────────

/// Evaluate a step condition. The `{{ … }}` wrapper is optional; the inner
/// expression supports `||`, `&&` (short-circuit, `&&` binds tighter),
/// `==`, `!=`, namespace references and constant literals.
pub fn evaluate_condition(condition: &str, ctx: &TemplateContext) -> Result<bool> {
    let trimmed = condition.trim();
    let inner = match TEMPLATE_RE.captures(trimmed) {
        Some(caps) if caps.get(0).unwrap().as_str() == trimmed => caps[1].to_string(),
        _ => trimmed.to_string(),
    };
    eval_bool(&inner, ctx)
}

fn eval_bool(expr: &str, ctx: &TemplateContext) -> Result<bool> {
    // || is the loosest binder.
    if let Some(clauses) = split_top(expr, "||") {
        for clause in clauses {
            if eval_bool(clause.trim(), ctx)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(clauses) = split_top(expr, "&&") {
        for clause in clauses {
            if !eval_bool(clause.trim(), ctx)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    if let Some((lhs, rhs)) = split_comparison(expr, "==") {
        return Ok(loosely_equal(
            &eval_operand(lhs.trim(), ctx)?,
            &eval_operand(rhs.trim(), ctx)?,
        ));
    }
    if let Some((lhs, rhs)) = split_comparison(expr, "!=") {
        return Ok(!loosely_equal(
            &eval_operand(lhs.trim(), ctx)?,
            &eval_operand(rhs.trim(), ctx)?,
        ));
    }

    Ok(truthy(&eval_operand(expr.trim(), ctx)?))
}

/// Split on an operator outside single quotes; `None` when it never occurs.
fn split_top<'a>(expr: &'a str, op: &str) -> Option<Vec<&'a str>> {
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            _ if !in_quote && bytes[i..].starts_with(op_bytes) => {
                parts.push(&expr[start..i]);
                i += op_bytes.len();
                start = i;
            }
            _ => i += 1,
        }
    }
    if parts.is_empty() {
        return None;
    }
    parts.push(&expr[start..]);
    Some(parts)
}

fn split_comparison<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts = split_top(expr, op)?;
    if parts.len() != 2 {
        return None;
    }
    Some((parts[0], parts[1]))
}

fn eval_operand(operand: &str, ctx: &TemplateContext) -> Result<Value> {
    if operand == "true" {
        return Ok(Value::Bool(true));
    }
    if operand == "false" {
        return Ok(Value::Bool(false));
    }
    if let Some(stripped) = operand
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Ok(Value::String(stripped.to_string()));
    }
    if let Ok(n) = operand.parse::<f64>() {
        return Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    eval_expr(operand, ctx)
}

/// Compare with light coercion: same-type values compare directly,
/// mixed-type values compare by their string forms.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::Null, Value::Null) => a == b,
        _ => stringify(a) == stringify(b),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
