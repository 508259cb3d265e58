//! Scalar value coercion.
//!
//! Raw payload values are normalized into their declared primitive type
//! before entering canonical or working state. Each declared kind is backed
//! by a [`Transform`]: `normalize` runs on the way in, `serialize` on the
//! way out. The built-in transforms implement deterministic, loosely-typed
//! coercion; custom transforms are registered on the
//! [`SchemaRegistry`](crate::SchemaRegistry) by name.

use crate::error::{value_type_name, FragmentError, FragmentResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The declared primitive kind of a scalar attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    /// No coercion; values pass through untouched.
    Untyped,
    String,
    Number,
    Boolean,
    Date,
    /// A named transform registered on the registry.
    Custom(String),
}

impl ScalarKind {
    /// Human-readable name, used in error messages.
    pub fn name(&self) -> &str {
        match self {
            ScalarKind::Untyped => "untyped",
            ScalarKind::String => "string",
            ScalarKind::Number => "number",
            ScalarKind::Boolean => "boolean",
            ScalarKind::Date => "date",
            ScalarKind::Custom(name) => name,
        }
    }
}

/// Normalization and serialization for one scalar kind.
///
/// `normalize` must be pure: same input, same output, no side effects.
pub trait Transform {
    /// Convert a raw payload value into its normalized in-memory form.
    fn normalize(&self, raw: &Value) -> FragmentResult<Value>;

    /// Convert a normalized value back into its wire form.
    fn serialize(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// Coerce a raw value to a built-in scalar kind (pure function).
///
/// `Untyped` passes values through unchanged. `Custom` kinds have no
/// built-in behavior and fail here; they resolve through the registry.
pub fn coerce(raw: &Value, kind: &ScalarKind) -> FragmentResult<Value> {
    match kind {
        ScalarKind::Untyped => Ok(raw.clone()),
        ScalarKind::String => StringTransform.normalize(raw),
        ScalarKind::Number => NumberTransform.normalize(raw),
        ScalarKind::Boolean => BooleanTransform.normalize(raw),
        ScalarKind::Date => DateTransform.normalize(raw),
        ScalarKind::Custom(name) => Err(FragmentError::unsupported_coercion(
            name.clone(),
            "value without a registry-bound transform",
        )),
    }
}

/// JavaScript-style truthiness for a JSON value.
pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String coercion.
///
/// Truthy input is stringified. Falsy input normalizes to `null`, except
/// the explicit empty string, which is preserved.
pub struct StringTransform;

impl Transform for StringTransform {
    fn normalize(&self, raw: &Value) -> FragmentResult<Value> {
        match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Null | Value::Bool(false) => Ok(Value::Null),
            Value::Number(n) => {
                if n.as_f64() == Some(0.0) {
                    Ok(Value::Null)
                } else {
                    Ok(Value::String(n.to_string()))
                }
            }
            Value::Bool(true) => Ok(Value::String("true".into())),
            Value::Array(_) | Value::Object(_) => Err(FragmentError::unsupported_coercion(
                "string",
                value_type_name(raw),
            )),
        }
    }
}

/// Number coercion.
///
/// Empty or non-numeric input normalizes to `null`; numeric strings and
/// booleans convert. Fraction-less results stay integral.
pub struct NumberTransform;

impl Transform for NumberTransform {
    fn normalize(&self, raw: &Value) -> FragmentResult<Value> {
        match raw {
            Value::Number(_) => Ok(raw.clone()),
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Number(i64::from(*b).into())),
            Value::String(s) => {
                if s.trim().is_empty() {
                    return Ok(Value::Null);
                }
                match s.trim().parse::<f64>() {
                    Ok(f) if f.is_finite() => Ok(number_value(f)),
                    _ => Ok(Value::Null),
                }
            }
            Value::Array(_) | Value::Object(_) => Err(FragmentError::unsupported_coercion(
                "number",
                value_type_name(raw),
            )),
        }
    }
}

/// Render a finite f64 as an integral JSON number when it has no fraction.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Value::Number((f as i64).into())
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Boolean coercion: plain truthiness, no `null` short-circuit.
pub struct BooleanTransform;

impl Transform for BooleanTransform {
    fn normalize(&self, raw: &Value) -> FragmentResult<Value> {
        Ok(Value::Bool(is_truthy(raw)))
    }
}

/// Date coercion.
///
/// Accepts an ISO-8601 / RFC 3339 string, a bare calendar date, or an
/// epoch-milliseconds number; normalizes to an RFC 3339 string. Invalid
/// input is an error, never a silent `null`.
pub struct DateTransform;

impl Transform for DateTransform {
    fn normalize(&self, raw: &Value) -> FragmentResult<Value> {
        use chrono::{DateTime, NaiveDate, TimeZone, Utc};

        match raw {
            Value::Null => Ok(Value::Null),
            Value::String(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(Value::String(dt.to_rfc3339()));
                }
                if let Ok(d) = s.parse::<NaiveDate>() {
                    let dt = Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap());
                    return Ok(Value::String(dt.to_rfc3339()));
                }
                Err(FragmentError::unsupported_coercion(
                    "date",
                    format!("unparseable date string '{s}'"),
                ))
            }
            Value::Number(n) => {
                let millis = n.as_i64().ok_or_else(|| {
                    FragmentError::unsupported_coercion("date", "non-integral epoch value")
                })?;
                match Utc.timestamp_millis_opt(millis) {
                    chrono::offset::LocalResult::Single(dt) => {
                        Ok(Value::String(dt.to_rfc3339()))
                    }
                    _ => Err(FragmentError::unsupported_coercion(
                        "date",
                        format!("out-of-range epoch {millis}"),
                    )),
                }
            }
            _ => Err(FragmentError::unsupported_coercion(
                "date",
                value_type_name(raw),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_preserves_empty_but_nulls_falsy() {
        assert_eq!(coerce(&json!(""), &ScalarKind::String).unwrap(), json!(""));
        assert_eq!(coerce(&json!(0), &ScalarKind::String).unwrap(), json!(null));
        assert_eq!(
            coerce(&json!(false), &ScalarKind::String).unwrap(),
            json!(null)
        );
        assert_eq!(
            coerce(&json!(null), &ScalarKind::String).unwrap(),
            json!(null)
        );
    }

    #[test]
    fn string_stringifies_truthy() {
        assert_eq!(
            coerce(&json!(42), &ScalarKind::String).unwrap(),
            json!("42")
        );
        assert_eq!(
            coerce(&json!(true), &ScalarKind::String).unwrap(),
            json!("true")
        );
        assert_eq!(
            coerce(&json!("Ned"), &ScalarKind::String).unwrap(),
            json!("Ned")
        );
    }

    #[test]
    fn string_rejects_compound_values() {
        assert!(coerce(&json!({"a": 1}), &ScalarKind::String).is_err());
        assert!(coerce(&json!([1]), &ScalarKind::String).is_err());
    }

    #[test]
    fn number_nulls_empty_and_non_numeric() {
        assert_eq!(coerce(&json!(""), &ScalarKind::Number).unwrap(), json!(null));
        assert_eq!(
            coerce(&json!("abc"), &ScalarKind::Number).unwrap(),
            json!(null)
        );
        assert_eq!(
            coerce(&json!(null), &ScalarKind::Number).unwrap(),
            json!(null)
        );
    }

    #[test]
    fn number_converts() {
        assert_eq!(coerce(&json!("12"), &ScalarKind::Number).unwrap(), json!(12));
        assert_eq!(
            coerce(&json!("12.5"), &ScalarKind::Number).unwrap(),
            json!(12.5)
        );
        assert_eq!(coerce(&json!(7), &ScalarKind::Number).unwrap(), json!(7));
        assert_eq!(coerce(&json!(true), &ScalarKind::Number).unwrap(), json!(1));
    }

    #[test]
    fn boolean_truthiness() {
        assert_eq!(
            coerce(&json!(null), &ScalarKind::Boolean).unwrap(),
            json!(false)
        );
        assert_eq!(
            coerce(&json!(0), &ScalarKind::Boolean).unwrap(),
            json!(false)
        );
        assert_eq!(
            coerce(&json!(""), &ScalarKind::Boolean).unwrap(),
            json!(false)
        );
        // Non-empty strings are truthy, including "false".
        assert_eq!(
            coerce(&json!("false"), &ScalarKind::Boolean).unwrap(),
            json!(true)
        );
        assert_eq!(
            coerce(&json!(1), &ScalarKind::Boolean).unwrap(),
            json!(true)
        );
        assert_eq!(
            coerce(&json!({"a": 1}), &ScalarKind::Boolean).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn date_parses_iso_8601() {
        let out = coerce(&json!("2020-01-02T03:04:05Z"), &ScalarKind::Date).unwrap();
        assert!(out.as_str().unwrap().starts_with("2020-01-02T03:04:05"));

        let out = coerce(&json!("2020-01-02"), &ScalarKind::Date).unwrap();
        assert!(out.as_str().unwrap().starts_with("2020-01-02T00:00:00"));
    }

    #[test]
    fn date_accepts_epoch_millis() {
        let out = coerce(&json!(0), &ScalarKind::Date).unwrap();
        assert!(out.as_str().unwrap().starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn date_invalid_is_an_error_not_null() {
        assert!(coerce(&json!("not a date"), &ScalarKind::Date).is_err());
        assert!(coerce(&json!(true), &ScalarKind::Date).is_err());
    }

    #[test]
    fn date_null_passes_through() {
        assert_eq!(coerce(&json!(null), &ScalarKind::Date).unwrap(), json!(null));
    }

    #[test]
    fn untyped_passes_through() {
        let v = json!({"anything": [1, 2]});
        assert_eq!(coerce(&v, &ScalarKind::Untyped).unwrap(), v);
    }

    #[test]
    fn coercion_is_deterministic() {
        let inputs = vec![json!("12"), json!(""), json!(0), json!("x")];
        for input in inputs {
            let a = coerce(&input, &ScalarKind::Number).unwrap();
            let b = coerce(&input, &ScalarKind::Number).unwrap();
            assert_eq!(a, b);
        }
    }
}
