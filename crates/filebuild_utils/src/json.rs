//! Canonical JSON values.
//!
//! A JSON value is said to be "sanitized" if it consists only of nulls,
//! booleans, numbers, strings, arrays, and objects with string keys - the
//! subset that survives a round trip through serialization. All arguments,
//! return values, and versions recorded by the build engine are sanitized at
//! the API boundary.

use serde::Serialize;
use serde_json::{Number, Value};
use thiserror::Error;

/** Errors that can occur when sanitizing a value */
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("the value is not representable as JSON: {0}")]
    NotJson(#[from] serde_json::Error),
}

/**
 * Return the result of sanitizing the specified value: a deep copy consisting
 * only of JSON-representable data. Non-string map keys are converted to
 * strings where the serializer supports it (e.g. integer keys to their
 * decimal form).
 */
pub fn sanitize<T: Serialize + ?Sized>(value: &T) -> Result<Value, ValueError> {
    Ok(serde_json::to_value(value)?)
}

/**
 * Return whether the specified sanitized values are equal.
 *
 * This differs from `==` on `serde_json::Value` in that integers are regarded
 * as equal to floats with the same mathematical value. Booleans are never
 * equal to numbers, and objects compare as unordered key-value sets.
 */
pub fn is_equal(value1: &Value, value2: &Value) -> bool {
    match (value1, value2) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(bool1), Value::Bool(bool2)) => bool1 == bool2,
        (Value::Number(number1), Value::Number(number2)) => {
            number_key(number1) == number_key(number2)
        }
        (Value::String(string1), Value::String(string2)) => string1 == string2,
        (Value::Array(array1), Value::Array(array2)) => {
            array1.len() == array2.len()
                && array1
                    .iter()
                    .zip(array2)
                    .all(|(element1, element2)| is_equal(element1, element2))
        }
        (Value::Object(object1), Value::Object(object2)) => {
            object1.len() == object2.len()
                && object1.iter().all(|(key, subvalue)| {
                    object2
                        .get(key)
                        .is_some_and(|subvalue2| is_equal(subvalue, subvalue2))
                })
        }
        _ => false,
    }
}

/**
 * A hashable representation of a sanitized JSON value, as returned by
 * `to_hashable`.
 *
 * The encoding preserves equality: `to_hashable(v1) == to_hashable(v2)` if
 * and only if `is_equal(v1, v2)`. Booleans use a variant distinct from
 * numbers, and floats with an integral value collapse to the `Int` variant.
 * The derived `Ord` gives callers a deterministic iteration order for maps
 * keyed by `HashableValue`.
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashableValue {
    Null,
    Bool(bool),
    Int(i128),
    /// Bit pattern of a float with a non-integral value.
    Float(u64),
    Str(String),
    Seq(Vec<HashableValue>),
    Map(Vec<(String, HashableValue)>),
}

/**
 * Return a hashable representation of the specified sanitized JSON value.
 */
pub fn to_hashable(value: &Value) -> HashableValue {
    match value {
        Value::Null => HashableValue::Null,
        Value::Bool(bool_) => HashableValue::Bool(*bool_),
        Value::Number(number) => match number_key(number) {
            NumberKey::Int(int) => HashableValue::Int(int),
            NumberKey::Float(bits) => HashableValue::Float(bits),
        },
        Value::String(string) => HashableValue::Str(string.clone()),
        Value::Array(array) => {
            HashableValue::Seq(array.iter().map(to_hashable).collect())
        }
        Value::Object(object) => HashableValue::Map(
            object
                .iter()
                .map(|(key, subvalue)| (key.clone(), to_hashable(subvalue)))
                .collect(),
        ),
    }
}

/** Canonical key for a JSON number, unifying integers and integral floats */
#[derive(PartialEq, Eq)]
enum NumberKey {
    Int(i128),
    Float(u64),
}

fn number_key(number: &Number) -> NumberKey {
    if let Some(int) = number.as_i64() {
        NumberKey::Int(i128::from(int))
    } else if let Some(int) = number.as_u64() {
        NumberKey::Int(i128::from(int))
    } else {
        match number.as_f64() {
            Some(float)
                if float.fract() == 0.0
                    && float >= i128::MIN as f64
                    && float <= i128::MAX as f64 =>
            {
                NumberKey::Int(float as i128)
            }
            Some(float) => NumberKey::Float(float.to_bits()),
            // Unreachable for serde_json numbers; treat as an arbitrary float
            None => NumberKey::Float(0),
        }
    }
}
