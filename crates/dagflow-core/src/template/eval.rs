//! Evaluates a parsed [`Expr`] against a lookup source, producing a
//! `serde_json::Value`.

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::ast::{BinOp, Expr, PathSegment, UnaryOp};
use super::filters;

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    #[error("filter '{0}': {1}")]
    FilterError(String, String),
    #[error("cannot apply operator to non-numeric value")]
    NotNumeric,
    #[error("division by zero")]
    DivByZero,
}

/// Resolves a dotted/indexed path against an environment. Implemented by
/// [`crate::environment::Environment`]; kept as a trait so the evaluator has
/// no dependency on the rest of the execution machinery.
pub trait Lookup {
    /// Returns `None` when the path has no bound value (renders as
    /// `null`/empty per the undefined-value rule, §4.2).
    fn lookup(&self, segments: &[PathSegment]) -> Option<JsonValue>;
}

pub fn eval(expr: &Expr, env: &dyn Lookup) -> Result<JsonValue, EvalError> {
    match expr {
        Expr::Null => Ok(JsonValue::Null),
        Expr::Bool(b) => Ok(JsonValue::Bool(*b)),
        Expr::Number(n) => Ok(json_number(*n)),
        Expr::Str(s) => Ok(JsonValue::String(s.clone())),
        Expr::Path(segments) => Ok(env.lookup(segments).unwrap_or(JsonValue::Null)),
        Expr::Unary(op, inner) => eval_unary(*op, inner, env),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, env),
        Expr::Filter(inner, name, args) => {
            let value = eval(inner, env)?;
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                arg_values.push(eval(arg, env)?);
            }
            filters::apply(name, value, &arg_values)
                .ok_or_else(|| EvalError::UnknownFilter(name.clone()))?
        }
    }
}

fn json_number(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        JsonValue::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn as_f64(value: &JsonValue) -> Option<f64> {
    value.as_f64()
}

/// Truthiness per §4.2: `null`, `false`, `0`, empty string, empty array/object
/// are falsy; everything else is truthy.
pub fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn eval_unary(op: UnaryOp, inner: &Expr, env: &dyn Lookup) -> Result<JsonValue, EvalError> {
    let value = eval(inner, env)?;
    match op {
        UnaryOp::Not => Ok(JsonValue::Bool(!truthy(&value))),
        UnaryOp::Neg => {
            let n = as_f64(&value).ok_or(EvalError::NotNumeric)?;
            Ok(json_number(-n))
        }
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    env: &dyn Lookup,
) -> Result<JsonValue, EvalError> {
    // `and`/`or` short-circuit, so the right side is only evaluated when needed.
    match op {
        BinOp::And => {
            let l = eval(lhs, env)?;
            if !truthy(&l) {
                return Ok(JsonValue::Bool(false));
            }
            let r = eval(rhs, env)?;
            return Ok(JsonValue::Bool(truthy(&r)));
        }
        BinOp::Or => {
            let l = eval(lhs, env)?;
            if truthy(&l) {
                return Ok(JsonValue::Bool(true));
            }
            let r = eval(rhs, env)?;
            return Ok(JsonValue::Bool(truthy(&r)));
        }
        _ => {}
    }

    let l = eval(lhs, env)?;
    let r = eval(rhs, env)?;

    match op {
        BinOp::Eq => Ok(JsonValue::Bool(values_equal(&l, &r))),
        BinOp::Ne => Ok(JsonValue::Bool(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            let result = match op {
                BinOp::Lt => ln < rn,
                BinOp::Le => ln <= rn,
                BinOp::Gt => ln > rn,
                BinOp::Ge => ln >= rn,
                _ => unreachable!(),
            };
            Ok(JsonValue::Bool(result))
        }
        BinOp::Add => {
            if let (JsonValue::String(a), JsonValue::String(b)) = (&l, &r) {
                return Ok(JsonValue::String(format!("{a}{b}")));
            }
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            Ok(json_number(ln + rn))
        }
        BinOp::Sub => {
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            Ok(json_number(ln - rn))
        }
        BinOp::Mul => {
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            Ok(json_number(ln * rn))
        }
        BinOp::Div => {
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            if rn == 0.0 {
                return Err(EvalError::DivByZero);
            }
            Ok(json_number(ln / rn))
        }
        BinOp::Mod => {
            let ln = as_f64(&l).ok_or(EvalError::NotNumeric)?;
            let rn = as_f64(&r).ok_or(EvalError::NotNumeric)?;
            if rn == 0.0 {
                return Err(EvalError::DivByZero);
            }
            Ok(json_number(ln % rn))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapLookup(HashMap<String, JsonValue>);

    impl Lookup for MapLookup {
        fn lookup(&self, segments: &[PathSegment]) -> Option<JsonValue> {
            let PathSegment::Ident(head) = segments.first()? else {
                return None;
            };
            let mut current = self.0.get(head)?.clone();
            for seg in &segments[1..] {
                current = match seg {
                    PathSegment::Ident(name) | PathSegment::Key(name) => {
                        current.get(name)?.clone()
                    }
                    PathSegment::Index(i) => current.get(*i as usize)?.clone(),
                };
            }
            Some(current)
        }
    }

    fn env(pairs: &[(&str, JsonValue)]) -> MapLookup {
        MapLookup(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn evaluates_arithmetic() {
        let e = super::super::parser::parse_expr("1 + 2 * 3").unwrap();
        let lookup = env(&[]);
        assert_eq!(eval(&e, &lookup).unwrap(), serde_json::json!(7));
    }

    #[test]
    fn evaluates_path_lookup() {
        let e = super::super::parser::parse_expr("a.b").unwrap();
        let lookup = env(&[("a", serde_json::json!({"b": 42}))]);
        assert_eq!(eval(&e, &lookup).unwrap(), serde_json::json!(42));
    }

    #[test]
    fn undefined_path_is_null() {
        let e = super::super::parser::parse_expr("missing.thing").unwrap();
        let lookup = env(&[]);
        assert_eq!(eval(&e, &lookup).unwrap(), JsonValue::Null);
    }

    #[test]
    fn short_circuits_and() {
        let e = super::super::parser::parse_expr("false and missing.field").unwrap();
        let lookup = env(&[]);
        assert_eq!(eval(&e, &lookup).unwrap(), serde_json::json!(false));
    }

    #[test]
    fn truthy_rules() {
        assert!(!truthy(&JsonValue::Null));
        assert!(!truthy(&serde_json::json!(0)));
        assert!(!truthy(&serde_json::json!("")));
        assert!(!truthy(&serde_json::json!([])));
        assert!(truthy(&serde_json::json!("x")));
        assert!(truthy(&serde_json::json!(1)));
    }

    #[test]
    fn string_concat_with_plus() {
        let e = super::super::parser::parse_expr("'a' + 'b'").unwrap();
        let lookup = env(&[]);
        assert_eq!(eval(&e, &lookup).unwrap(), serde_json::json!("ab"));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let e = super::super::parser::parse_expr("1 / 0").unwrap();
        let lookup = env(&[]);
        assert_eq!(eval(&e, &lookup).unwrap_err(), EvalError::DivByZero);
    }
}
