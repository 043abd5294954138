//! Filter functions usable in a `{{ expr | filter(args) }}` pipeline.

use serde_json::Value as JsonValue;

use super::eval::EvalError;

/// Applies a named filter to `value` with the given (already-evaluated)
/// arguments. Returns `None` if `name` isn't a known filter, so the caller
/// can turn that into `EvalError::UnknownFilter`.
pub fn apply(
    name: &str,
    value: JsonValue,
    args: &[JsonValue],
) -> Option<Result<JsonValue, EvalError>> {
    let result = match name {
        "default" => default(value, args),
        "lower" => lower(value),
        "upper" => upper(value),
        "replace" => replace(value, args),
        "round" => round(value, args),
        "length" => length(value),
        "join" => join(value, args),
        "trim" => trim(value),
        _ => return None,
    };
    Some(result)
}

fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => crate::template::stringify(other),
    }
}

fn default(value: JsonValue, args: &[JsonValue]) -> Result<JsonValue, EvalError> {
    let fallback = args.first().cloned().unwrap_or(JsonValue::Null);
    if matches!(value, JsonValue::Null) {
        Ok(fallback)
    } else {
        Ok(value)
    }
}

fn lower(value: JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::String(to_text(&value).to_lowercase()))
}

fn upper(value: JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::String(to_text(&value).to_uppercase()))
}

fn replace(value: JsonValue, args: &[JsonValue]) -> Result<JsonValue, EvalError> {
    let from = args
        .first()
        .map(to_text)
        .ok_or_else(|| EvalError::FilterError("replace".into(), "missing 'from' argument".into()))?;
    let to = args
        .get(1)
        .map(to_text)
        .ok_or_else(|| EvalError::FilterError("replace".into(), "missing 'to' argument".into()))?;
    Ok(JsonValue::String(to_text(&value).replace(&from, &to)))
}

fn round(value: JsonValue, args: &[JsonValue]) -> Result<JsonValue, EvalError> {
    let n = value.as_f64().ok_or(EvalError::NotNumeric)?;
    let digits = args.first().and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u32;
    let factor = 10f64.powi(digits as i32);
    let rounded = (n * factor).round() / factor;
    Ok(serde_json::Number::from_f64(rounded)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null))
}

fn length(value: JsonValue) -> Result<JsonValue, EvalError> {
    let len = match &value {
        JsonValue::String(s) => s.chars().count(),
        JsonValue::Array(a) => a.len(),
        JsonValue::Object(o) => o.len(),
        _ => {
            return Err(EvalError::FilterError(
                "length".into(),
                "value has no length".into(),
            ))
        }
    };
    Ok(JsonValue::Number((len as i64).into()))
}

fn join(value: JsonValue, args: &[JsonValue]) -> Result<JsonValue, EvalError> {
    let sep = args.first().map(to_text).unwrap_or_default();
    let items = value
        .as_array()
        .ok_or_else(|| EvalError::FilterError("join".into(), "value is not an array".into()))?;
    let joined = items
        .iter()
        .map(to_text)
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(JsonValue::String(joined))
}

fn trim(value: JsonValue) -> Result<JsonValue, EvalError> {
    Ok(JsonValue::String(to_text(&value).trim().to_string()))
}
