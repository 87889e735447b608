//! JEXL expression evaluator for gateway conditions, correlation-key
//! retrieval expressions, and script tasks.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//!
//! **Security note:** Process data is always passed as a context object,
//! NEVER interpolated into expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Exclusive-gateway flow conditions (e.g. `amount > 1000`)
/// - Correlation-key retrieval expressions (e.g. `order.po_number`)
/// - Script-task assignments
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
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

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// The `context` must be a JSON object.
    pub fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression to a boolean, coercing with JavaScript-like
    /// truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate(expression, context)?;
        Ok(Self::value_to_bool(&result))
    }

    fn value_to_bool(value: &Value) -> bool {
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_comparison_against_context() {
        let evaluator = ExpressionEvaluator::new();
        let ctx = json!({"amount": 1500});
        assert!(evaluator.evaluate_bool("amount > 1000", &ctx).unwrap());
        assert!(!evaluator.evaluate_bool("amount > 2000", &ctx).unwrap());
    }

    #[test]
    fn evaluates_nested_field_access() {
        let evaluator = ExpressionEvaluator::new();
        let ctx = json!({"order": {"po_number": 1001}});
        let result = evaluator.evaluate("order.po_number", &ctx).unwrap();
        assert_eq!(result, json!(1001.0));
    }

    #[test]
    fn rejects_non_object_context() {
        let evaluator = ExpressionEvaluator::new();
        let err = evaluator.evaluate("x", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn transform_length() {
        let evaluator = ExpressionEvaluator::new();
        let ctx = json!({"items": [1, 2, 3]});
        assert!(evaluator.evaluate_bool("items|length > 2", &ctx).unwrap());
    }

    #[test]
    fn eval_failure_surfaces_as_error() {
        let evaluator = ExpressionEvaluator::new();
        let err = evaluator.evaluate("((", &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed(_)));
    }
}
