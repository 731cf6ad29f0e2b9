//! Parameter resolution and condition evaluation.
//!
//! Parameter templates are JSON values whose string leaves may contain
//! `{{ expr }}` placeholders. Expressions are JEXL, evaluated by
//! `ExpressionEvaluator` against a `ResolutionScope`:
//!
//! ```json
//! {
//!   "inputs":   { ...plan execution inputs... },
//!   "steps":    { "<identifier>": { "parameters": ..., "output": ... } },
//!   "node":     { "id": "...", "identifier": "...", "fqn": "...", "attempt": 1 },
//!   "levels":   ["<identifier>", ...],
//!   "metadata": { ... },
//!   "plan":     { "id": "...", "execution_id": "..." }
//! }
//! ```
//!
//! A string that is exactly one placeholder resolves to the expression's
//! typed value; placeholders embedded in longer text are interpolated as
//! strings. Resolution is pure: the same template and scope always produce
//! the same bytes.
//!
//! **Security note:** scope data is always passed as the evaluation context,
//! never spliced into expression text.

use serde_json::{Map, Value, json};

use planwright_types::execution::{ExecutionContext, ExpansionEntry, ExpansionKind};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("failed to encode resolved parameters: {0}")]
    Encode(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
///
/// `jexl_eval::Evaluator` is neither `Send` nor `Sync`, so callers build one
/// per resolution instead of sharing it across tasks.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
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
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("join", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<String> = args
                    .first()
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().map(stringify).collect())
                    .unwrap_or_default();
                Ok(json!(parts.join(delimiter)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!Self::value_to_bool(&val)))
            })
            .with_transform("default", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                if val.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(val)
                }
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        items.contains(args.get(1).unwrap_or(&Value::Null))
                    }
                    Some(Value::String(subject)) => {
                        let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                        subject.contains(search)
                    }
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
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("json", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ResolutionError> {
        if !context.is_object() {
            return Err(ResolutionError::InvalidScope(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ResolutionError::Expression {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate an expression, coercing the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ResolutionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(Self::value_to_bool(&result))
    }

    pub fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ResolutionScope
// ---------------------------------------------------------------------------

/// The data surface expressions can reference for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionScope {
    value: Value,
}

impl ResolutionScope {
    /// Build the scope for the node at the leaf of `context`.
    ///
    /// `expansions` are applied in recording order, so a later attempt of a
    /// node shadows an earlier one under the same identifier.
    pub fn build(context: &ExecutionContext, inputs: &Value, expansions: &[ExpansionEntry]) -> Self {
        let mut steps = Map::new();
        for entry in expansions {
            let slot = steps
                .entry(entry.identifier.clone())
                .or_insert_with(|| json!({}));
            if let Value::Object(fields) = slot {
                let key = match entry.kind {
                    ExpansionKind::Parameters => "parameters",
                    ExpansionKind::Outputs => "output",
                };
                fields.insert(key.to_string(), entry.value.clone());
            }
        }

        let node = context.leaf().map_or(Value::Null, |leaf| {
            json!({
                "id": leaf.runtime_id.to_string(),
                "node_id": leaf.node_id,
                "identifier": leaf.identifier,
                "fqn": context.fqn(),
                "attempt": leaf.attempt,
            })
        });
        let levels: Vec<&str> = context.levels.iter().map(|l| l.identifier.as_str()).collect();

        let value = json!({
            "inputs": if inputs.is_null() { json!({}) } else { inputs.clone() },
            "steps": steps,
            "node": node,
            "levels": levels,
            "metadata": context.metadata,
            "plan": {
                "id": context.plan_id,
                "execution_id": context.plan_execution_id.to_string(),
            },
        });
        Self { value }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }
}

// ---------------------------------------------------------------------------
// ExpressionResolver
// ---------------------------------------------------------------------------

/// Pure resolution of parameter templates and conditions.
pub trait ExpressionResolver: Send + Sync {
    /// Resolve a parameter template into its serialized bytes.
    fn resolve(&self, template: &Value, scope: &ResolutionScope) -> Result<Vec<u8>, ResolutionError>;

    fn evaluate_condition(&self, expression: &str, scope: &ResolutionScope) -> Result<bool, ResolutionError>;
}

/// `{{ expr }}` templating over JEXL.
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlResolver;

impl JexlResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a template to a JSON value (the decoded form of `resolve`).
    pub fn resolve_value(&self, template: &Value, scope: &ResolutionScope) -> Result<Value, ResolutionError> {
        let evaluator = ExpressionEvaluator::new();
        resolve_node(&evaluator, template, scope.as_value())
    }
}

impl ExpressionResolver for JexlResolver {
    fn resolve(&self, template: &Value, scope: &ResolutionScope) -> Result<Vec<u8>, ResolutionError> {
        let resolved = self.resolve_value(template, scope)?;
        serde_json::to_vec(&resolved).map_err(|e| ResolutionError::Encode(e.to_string()))
    }

    fn evaluate_condition(&self, expression: &str, scope: &ResolutionScope) -> Result<bool, ResolutionError> {
        let expression = strip_braces(expression).unwrap_or(expression);
        ExpressionEvaluator::new().evaluate_bool(expression, scope.as_value())
    }
}

fn resolve_node(evaluator: &ExpressionEvaluator, node: &Value, ctx: &Value) -> Result<Value, ResolutionError> {
    match node {
        Value::String(text) => resolve_string(evaluator, text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_node(evaluator, item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => {
            let mut out = Map::new();
            for (key, value) in fields {
                out.insert(key.clone(), resolve_node(evaluator, value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(evaluator: &ExpressionEvaluator, text: &str, ctx: &Value) -> Result<Value, ResolutionError> {
    if let Some(expression) = strip_braces(text) {
        return evaluator.evaluate_value(expression, ctx);
    }
    if !text.contains("{{") {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            ResolutionError::InvalidTemplate(format!("unterminated placeholder in '{text}'"))
        })?;
        let value = evaluator.evaluate_value(after[..end].trim(), ctx)?;
        out.push_str(&stringify(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// The inner expression if `text` is exactly one `{{ ... }}` placeholder.
fn strip_braces(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
