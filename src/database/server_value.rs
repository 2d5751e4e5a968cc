use chrono::Utc;
use serde_json::{Map, Number, Value};

use crate::database::node::{
    immediate_child, is_server_placeholder, leaf_data, SERVER_VALUE_KEY,
};

/// Placeholder resolved to the server's clock when the write is applied.
pub fn server_timestamp() -> Value {
    serde_json::json!({ ".sv": "timestamp" })
}

/// Placeholder that atomically adds `delta` to the current value.
///
/// # Arguments
/// * `delta` - Amount to add to the current value.
pub fn increment(delta: f64) -> Value {
    serde_json::json!({
        ".sv": {
            "increment": delta,
        }
    })
}

/// Values substituted for placeholders. Captured once per write so every
/// placeholder in one payload resolves to the same instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerValues {
    pub timestamp_millis: i64,
}

impl ServerValues {
    pub fn now() -> Self {
        Self {
            timestamp_millis: Utc::now().timestamp_millis(),
        }
    }
}

/// Replaces every placeholder in `value` using `existing` (the node currently
/// stored at the same location) as the base for increments.
pub fn resolve_deferred_values(value: Value, existing: &Value, server_values: &ServerValues) -> Value {
    if is_server_placeholder(&value) {
        let operation = value
            .get(SERVER_VALUE_KEY)
            .cloned()
            .unwrap_or(Value::Null);
        return resolve_placeholder(&operation, existing, server_values);
    }
    match value {
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, child) in map {
                let child_existing = immediate_child(existing, &key);
                resolved.insert(
                    key,
                    resolve_deferred_values(child, &child_existing, server_values),
                );
            }
            Value::Object(resolved)
        }
        other => other,
    }
}

fn resolve_placeholder(operation: &Value, existing: &Value, server_values: &ServerValues) -> Value {
    match operation {
        Value::String(token) if token == "timestamp" => {
            Value::Number(Number::from(server_values.timestamp_millis))
        }
        Value::Object(map) => {
            let delta = map.get("increment").and_then(Value::as_number);
            match delta {
                Some(delta) => apply_increment(leaf_data(existing), delta),
                None => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

fn apply_increment(existing: &Value, delta: &Number) -> Value {
    let Value::Number(base) = existing else {
        return Value::Number(delta.clone());
    };
    if let (Some(left), Some(right)) = (base.as_i64(), delta.as_i64()) {
        if let Some(sum) = left.checked_add(right) {
            return Value::Number(Number::from(sum));
        }
    }
    if let (Some(left), Some(right)) = (base.as_f64(), delta.as_f64()) {
        let sum = left + right;
        if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
            return Value::Number(Number::from(sum as i64));
        }
        if let Some(number) = Number::from_f64(sum) {
            return Value::Number(number);
        }
    }
    Value::Number(delta.clone())
}
