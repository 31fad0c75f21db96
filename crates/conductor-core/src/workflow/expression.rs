//! Expression and `${...}` template resolution.
//!
//! The engine only depends on the [`ExpressionResolver`] trait; the default
//! [`JexlResolver`] wraps `jexl_eval::Evaluator` with pre-registered
//! standard transforms.
//!
//! Variables are always passed as the evaluation context, never
//! interpolated into expression strings.

use std::sync::Arc;

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("unterminated template in '{0}'")]
    UnterminatedTemplate(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionResolver
// ---------------------------------------------------------------------------

/// Expression capability injected into the engine.
pub trait ExpressionResolver: Send + Sync {
    /// Evaluate `expression` against `variables` (a JSON object).
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError>;

    /// Resolve every `${expr}` template inside `config`.
    ///
    /// A string that is exactly one template keeps the evaluated JSON type
    /// (`"${input.count}"` becomes a number). Templates embedded in longer
    /// strings are replaced by their string form.
    fn resolve_config_variables(
        &self,
        config: &Value,
        variables: &Value,
    ) -> Result<Value, ExpressionError> {
        match config {
            Value::String(s) => self.resolve_string(s, variables),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_config_variables(v, variables))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_config_variables(v, variables)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate and coerce to boolean with JavaScript-like truthiness.
    fn evaluate_bool(&self, expression: &str, variables: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(expression, variables).map(|v| truthy(&v))
    }

    #[doc(hidden)]
    fn resolve_string(&self, template: &str, variables: &Value) -> Result<Value, ExpressionError> {
        let segments = split_template(template)?;
        if let [Segment::Expr(expr)] = segments.as_slice() {
            return self.evaluate(expr, variables);
        }
        if !segments.iter().any(|s| matches!(s, Segment::Expr(_))) {
            return Ok(Value::String(template.to_string()));
        }
        let mut out = String::with_capacity(template.len());
        for segment in segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(e) => out.push_str(&value_to_string(&self.evaluate(e, variables)?)),
            }
        }
        Ok(Value::String(out))
    }
}

impl<T: ExpressionResolver + ?Sized> ExpressionResolver for Arc<T> {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError> {
        (**self).evaluate(expression, variables)
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Split `a ${x} b` into text and expression segments. Braces inside an
/// expression are balanced so object literals survive.
fn split_template(template: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let body = &rest[start + 2..];
        let mut depth = 1usize;
        let mut end = None;
        for (i, c) in body.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = end.ok_or_else(|| ExpressionError::UnterminatedTemplate(template.to_string()))?;
        segments.push(Segment::Expr(body[..end].trim()));
        rest = &body[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// JexlResolver
// ---------------------------------------------------------------------------

/// JEXL-backed resolver with the standard transforms registered.
///
/// Evaluators are built per call; they hold non-`Send` transform closures
/// and are cheap to construct.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlResolver;

impl JexlResolver {
    pub fn new() -> Self {
        Self
    }

    fn evaluator() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
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
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
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
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("json", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(val.to_string()))
            })
    }
}

impl ExpressionResolver for JexlResolver {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError> {
        if !variables.is_object() {
            return Err(ExpressionError::InvalidContext(
                "variables must be a JSON object".to_string(),
            ));
        }
        Self::evaluator()
            .eval_in_context(expression, variables)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Value {
        json!({
            "input": {"region": "eu", "count": 3, "name": "Ada"},
            "nodes": {"fetch": {"items": [1, 2, 3]}},
        })
    }

    #[test]
    fn evaluate_simple_comparison() {
        let r = JexlResolver::new();
        assert_eq!(r.evaluate("input.region == 'eu'", &vars()).unwrap(), json!(true));
        assert!(r.evaluate_bool("input.count > 2", &vars()).unwrap());
        assert!(!r.evaluate_bool("input.count > 5", &vars()).unwrap());
    }

    #[test]
    fn evaluate_with_transform() {
        let r = JexlResolver::new();
        assert_eq!(r.evaluate("nodes.fetch.items|length", &vars()).unwrap(), json!(3.0));
        assert_eq!(r.evaluate("input.name|upper", &vars()).unwrap(), json!("ADA"));
    }

    #[test]
    fn whole_template_keeps_type() {
        let r = JexlResolver::new();
        let config = json!({"count": "${input.count}", "items": "${nodes.fetch.items}"});
        let resolved = r.resolve_config_variables(&config, &vars()).unwrap();
        assert_eq!(resolved["count"], json!(3));
        assert_eq!(resolved["items"], json!([1, 2, 3]));
    }

    #[test]
    fn embedded_templates_are_stringified() {
        let r = JexlResolver::new();
        let config = json!({"greeting": "Hello ${input.name} (${input.count})", "nested": ["${input.region}"]});
        let resolved = r.resolve_config_variables(&config, &vars()).unwrap();
        assert_eq!(resolved["greeting"], json!("Hello Ada (3)"));
        assert_eq!(resolved["nested"], json!(["eu"]));
    }

    #[test]
    fn plain_strings_pass_through() {
        let r = JexlResolver::new();
        let resolved = r.resolve_config_variables(&json!("no templates"), &vars()).unwrap();
        assert_eq!(resolved, json!("no templates"));
    }

    #[test]
    fn unterminated_template_is_an_error() {
        let r = JexlResolver::new();
        let err = r.resolve_config_variables(&json!("${input.name"), &vars()).unwrap_err();
        assert!(matches!(err, ExpressionError::UnterminatedTemplate(_)));
    }

    #[test]
    fn non_object_context_rejected() {
        let r = JexlResolver::new();
        let err = r.evaluate("1 + 1", &json!([1])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn split_template_segments() {
        let segments = split_template("a ${x} b ${ {\"k\": 1}.k }").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("a "),
                Segment::Expr("x"),
                Segment::Text(" b "),
                Segment::Expr("{\"k\": 1}.k"),
            ]
        );
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("x")));
    }
}
