//! JEXL expression evaluator for edge conditions, assignments, and guards.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered transforms and the
//! engine's evaluation rules: an empty condition is true, a condition that
//! fails to evaluate is false (a malformed edge degrades that branch instead
//! of crashing the engine), and `validate` checks syntax without evaluating.
//!
//! The language is side-effect free: no assignment, no function definition,
//! no I/O. Expressions come from user-authored workflow text, so this is a
//! deliberate safety boundary. Word-operator spellings (`and`, `or`, `not`)
//! are normalized to the native `&&`/`||`/`|not` forms before parsing.
//!
//! **Security note:** runtime data is always passed as a context object,
//! NEVER interpolated into expression strings.

use serde_json::{Value, json};

use super::context::EvalContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression handling.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("syntax error: {0}")]
    Syntax(String),
}

// ---------------------------------------------------------------------------
// Operator normalization
// ---------------------------------------------------------------------------

/// Rewrite word-operator spellings to the evaluator's native operators:
/// ` and ` -> `&&`, ` or ` -> `||`, and prefix negation (`not x` / `!x`) to
/// the `|not` transform. Quoted strings are left untouched, as is `!=`.
fn normalize_operators(expression: &str) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len() + 8);
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }

        if c == '!' {
            if chars.get(i + 1) == Some(&'=') {
                out.push_str("!=");
                i += 2;
            } else {
                let (operand, next) = take_operand(&chars, i + 1);
                if operand.is_empty() {
                    out.push(c);
                    i += 1;
                } else {
                    push_negation(&mut out, &operand);
                    i = next;
                }
            }
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            // A word after '.' or '|' is a property or transform name, not
            // an operator.
            let is_member = matches!(out.trim_end().chars().last(), Some('.') | Some('|'));
            match word.as_str() {
                "and" if !is_member => out.push_str("&&"),
                "or" if !is_member => out.push_str("||"),
                "not" if !is_member => {
                    let (operand, next) = take_operand(&chars, i);
                    if operand.is_empty() {
                        out.push_str(&word);
                    } else {
                        push_negation(&mut out, &operand);
                        i = next;
                    }
                }
                _ => out.push_str(&word),
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Emit `(operand)|not`, normalizing the operand recursively.
fn push_negation(out: &mut String, operand: &str) {
    let normalized = normalize_operators(operand);
    if normalized.starts_with('(') && normalized.ends_with(')') {
        out.push_str(&normalized);
    } else {
        out.push('(');
        out.push_str(&normalized);
        out.push(')');
    }
    out.push_str("|not");
}

/// Consume the operand of a prefix negation starting at `i`: either a
/// parenthesized group or an identifier path (with `.` segments and `[...]`
/// indexing). Returns the operand text and the index after it.
fn take_operand(chars: &[char], mut i: usize) -> (String, usize) {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    if i >= chars.len() {
        return (String::new(), i);
    }

    let start = i;
    if chars[i] == '(' {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
            } else if c == '\'' || c == '"' {
                quote = Some(c);
            } else if c == '(' {
                depth += 1;
            } else if c == ')' {
                depth -= 1;
                if depth == 0 {
                    i += 1;
                    break;
                }
            }
            i += 1;
        }
        return (chars[start..i].iter().collect(), i);
    }

    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' || c == '.' {
            i += 1;
        } else if c == '[' {
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            while i < chars.len() {
                let c = chars[i];
                if let Some(q) = quote {
                    if c == q {
                        quote = None;
                    }
                } else if c == '\'' || c == '"' {
                    quote = Some(c);
                } else if c == '[' {
                    depth += 1;
                } else if c == ']' {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                i += 1;
            }
        } else {
            break;
        }
    }
    (chars[start..i].iter().collect(), i)
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with the engine's transform set pre-registered.
///
/// Used for:
/// - Edge `condition` evaluation (branching, loop guards)
/// - `assign`/`script` node expressions
/// - `switch` routing and `foreach` item lists
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    /// Create a new evaluator with all transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // Collection / string length
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Map get with default: `variables|get('threshold', 10)`
            .with_transform("get", |args: &[Value]| {
                let key = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let default = args.get(2).cloned().unwrap_or(Value::Null);
                let value = args
                    .first()
                    .and_then(|subject| subject.get(key))
                    .filter(|v| !v.is_null())
                    .cloned();
                Ok(value.unwrap_or(default))
            })
            // Type coercions
            .with_transform("string", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(coerce_to_string(&val)))
            })
            .with_transform("number", |args: &[Value]| {
                let coerced = match args.first() {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                    Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
                    _ => None,
                };
                Ok(coerced.map_or(Value::Null, |n| json!(n)))
            })
            // Current time in epoch milliseconds: `0|now`
            .with_transform("now", |_args: &[Value]| {
                Ok(json!(chrono::Utc::now().timestamp_millis() as f64))
            })
            // Numeric helpers
            .with_transform("floor", |args: &[Value]| {
                let x = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(x.floor()))
            })
            .with_transform("ceil", |args: &[Value]| {
                let x = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(x.ceil()))
            })
            .with_transform("round", |args: &[Value]| {
                let x = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(x.round()))
            })
            .with_transform("abs", |args: &[Value]| {
                let x = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(x.abs()))
            })
            .with_transform("min", |args: &[Value]| {
                let a = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                let b = args.get(1).and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(a.min(b)))
            })
            .with_transform("max", |args: &[Value]| {
                let a = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
                let b = args.get(1).and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(json!(a.max(b)))
            })
            // Boolean negation (the target of `not`/`!` normalization)
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            });

        Self { evaluator }
    }

    /// Evaluate an expression against a typed context and return the value.
    pub fn evaluate(
        &self,
        expression: &str,
        context: &EvalContext,
    ) -> Result<Value, ExpressionError> {
        self.evaluate_raw(expression, &context.to_expression_context())
    }

    /// Evaluate an expression against a raw JSON context object.
    pub fn evaluate_raw(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        let normalized = normalize_operators(expression.trim());
        self.evaluator
            .eval_in_context(&normalized, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate a boolean condition.
    ///
    /// An empty expression is true. Evaluation errors are logged and yield
    /// false, so one malformed edge condition degrades that branch only.
    pub fn evaluate_condition(&self, expression: &str, context: &EvalContext) -> bool {
        if expression.trim().is_empty() {
            return true;
        }
        match self.evaluate(expression, context) {
            Ok(value) => value_to_bool(&value),
            Err(err) => {
                tracing::warn!(expression, %err, "condition failed to evaluate, treating as false");
                false
            }
        }
    }

    /// Check an expression for syntax errors without evaluating it.
    ///
    /// An empty expression is valid (it means "unconditional").
    pub fn validate(&self, expression: &str) -> Result<(), ExpressionError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let normalized = normalize_operators(trimmed);
        jexl_parser::Parser::parse(&normalized)
            .map(|_| ())
            .map_err(|e| ExpressionError::Syntax(format!("{e:?}")))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness over JSON values.
pub(crate) fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String coercion used by the `string` transform and switch-label routing.
pub(crate) fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
