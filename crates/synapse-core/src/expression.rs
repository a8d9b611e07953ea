//! Runtime expression evaluation for workflow conditions, filters and arguments.
//!
//! Runtime expressions are written `${ <jexl> }`. Strings without the marker
//! are literals and pass through unevaluated, so definitions can freely mix
//! constant and computed values.
//!
//! **Security note:** data is always passed as the evaluation context, NEVER
//! interpolated into expression strings.

use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid expression '{0}'")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Marker syntax
// ---------------------------------------------------------------------------

/// Whether `s` is a runtime expression (`${ ... }`).
pub fn is_runtime_expression(s: &str) -> bool {
    strip_marker(s).is_some()
}

/// The expression body inside `${ ... }`, trimmed.
pub fn strip_marker(s: &str) -> Option<&str> {
    let s = s.trim();
    s.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .map(str::trim)
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates runtime expressions against JSON data.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `data`.
    ///
    /// Literal strings (no `${ }` marker) are returned as-is.
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate `expression` and coerce the result to a boolean.
    fn evaluate_condition(&self, expression: &str, data: &Value) -> Result<bool, ExpressionError> {
        Ok(value_to_bool(&self.evaluate(expression, data)?))
    }

    /// Evaluate every string leaf of `template` that is a runtime expression.
    fn evaluate_template(&self, template: &Value, data: &Value) -> Result<Value, ExpressionError> {
        match template {
            Value::String(s) => self.evaluate(s, data),
            Value::Array(items) => items
                .iter()
                .map(|item| self.evaluate_template(item, data))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.evaluate_template(v, data)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

/// JEXL evaluator with standard transforms pre-registered.
///
/// Non-object data is exposed to expressions as `data`.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().cloned().unwrap_or(Value::Null);
                let search = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match (&subject, &search) {
                    (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                    (Value::Array(items), needle) => items.contains(needle),
                    (Value::Object(map), Value::String(key)) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<Value> = match args.first() {
                    Some(Value::Object(o)) => o.keys().map(|k| json!(k)).collect(),
                    _ => Vec::new(),
                };
                Ok(Value::Array(keys))
            })
            .with_transform("toString", |args: &[Value]| {
                let s = match args.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
                        _ => n.to_string(),
                    },
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(json!(s))
            });

        Self { evaluator }
    }

    fn context_for(data: &Value) -> Value {
        if data.is_object() {
            data.clone()
        } else {
            json!({ "data": data })
        }
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator for WorkflowEvaluator {
    fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ExpressionError> {
        let Some(body) = strip_marker(expression) else {
            return Ok(Value::String(expression.to_string()));
        };
        if body.is_empty() {
            return Err(ExpressionError::Invalid(expression.to_string()));
        }

        let context = Self::context_for(data);
        self.evaluator
            .eval_in_context(body, &context)
            .map_err(|e| ExpressionError::EvalFailed(format!("{body}: {e}")))
    }
}

impl std::fmt::Debug for WorkflowEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEvaluator").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
