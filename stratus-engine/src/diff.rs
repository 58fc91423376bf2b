//! Semantic comparison of desired and existing resources.
//!
//! Comparisons ignore representation noise: absent, null, empty sequence and
//! empty object are all "empty", and numbers compare by value.

use serde_json::{Map, Value};

/// Null, `[]` and `{}` are empty. Empty strings are values.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Drop empty fields recursively, so equivalent documents compare equal.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::new();
            for (key, field) in fields {
                let field = normalize(field);
                if !is_empty_value(&field) {
                    out.insert(key.clone(), field);
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Remove `fields` from every object in the tree.
pub fn strip_fields(value: &mut Value, fields: &[&str]) {
    match value {
        Value::Object(map) => {
            for field in fields {
                map.remove(*field);
            }
            for child in map.values_mut() {
                strip_fields(child, fields);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_fields(item, fields);
            }
        }
        _ => {}
    }
}

/// Whether every non-empty field of `desired` has the same value in `existing`.
///
/// Objects may carry extra fields in `existing`; arrays must match element by
/// element, so callers sort unordered sequences first.
pub fn is_subset(desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, field)| {
            if is_empty_value(field) {
                return have.get(key).map_or(true, |v| is_empty_value(&normalize(v)));
            }
            have.get(key).is_some_and(|v| is_subset(field, v))
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (Value::Number(want), Value::Number(have)) => match (want.as_f64(), have.as_f64()) {
            (Some(w), Some(h)) => w == h,
            _ => want == have,
        },
        (want, have) => {
            if is_empty_value(want) {
                is_empty_value(&normalize(have))
            } else {
                want == have
            }
        }
    }
}

/// Semantic equality: both documents are subsets of each other after normalizing.
pub fn semantically_equal(a: &Value, b: &Value) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    is_subset(&a, &b) && is_subset(&b, &a)
}

/// Sort an array of objects by the string at `key`, if `value` is such an array.
pub fn sort_array_by_key(value: &mut Value, key: &str) {
    if let Value::Array(items) = value {
        items.sort_by(|a, b| {
            let a = a.get(key).map(render).unwrap_or_default();
            let b = b.get(key).map(render).unwrap_or_default();
            a.cmp(&b)
        });
    }
}

/// Human form of a value: strings without quotes, anything else as JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
