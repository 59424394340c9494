//! JEXL expression evaluator for condition nodes and edge guards.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of standard transforms and
//! boolean coercion. Context data is always passed as a JSON object, never
//! interpolated into expression strings.

use serde_json::{json, Value};

/// Errors from expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with standard transforms pre-registered.
///
/// Used for condition node expressions and edge `condition` guards.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
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
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean, coercing with JS-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(value_to_bool(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// JS-like truthiness for coercing expression results.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    #[test]
    fn test_dot_notation_comparison() {
        let ctx = json!({ "form": { "garmentType": "blazer" } });
        assert!(evaluator()
            .evaluate_bool("form.garmentType == 'blazer'", &ctx)
            .unwrap());
        assert!(!evaluator()
            .evaluate_bool("form.garmentType == 'dress'", &ctx)
            .unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let ctx = json!({ "nodes": { "check": { "result": true } }, "form": { "retouch": false } });
        assert!(evaluator()
            .evaluate_bool("nodes.check.result && !form.retouch", &ctx)
            .unwrap());
    }

    #[test]
    fn test_numeric_comparison() {
        let ctx = json!({ "nodes": { "resize": { "width": 1024.0 } } });
        assert!(evaluator()
            .evaluate_bool("nodes.resize.width > 512", &ctx)
            .unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({ "form": { "sku": "BLZ-1002" } });
        assert!(evaluator()
            .evaluate_bool("form.sku|lower|contains('blz')", &ctx)
            .unwrap());

        let ctx = json!({ "hits": ["a", "b", "c"] });
        assert!(evaluator().evaluate_bool("hits|length > 2", &ctx).unwrap());
    }

    #[test]
    fn test_truthiness_coercion() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("val", &json!({ "val": "text" })).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({ "val": "" })).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({ "val": 0.0 })).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({ "val": null })).unwrap());
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let eval = evaluator();
        assert!(!eval.evaluate_bool("form.absent", &json!({ "form": {} })).unwrap());
    }

    #[test]
    fn test_non_object_context_rejected() {
        assert!(evaluator().evaluate_bool("true", &json!("nope")).is_err());
    }
}
