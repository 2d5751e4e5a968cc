use serde_json::{Map, Value};

use crate::database::error::{invalid_argument, DatabaseError, DatabaseResult};
use crate::database::node::{PRIORITY_KEY, SERVER_VALUE_KEY, VALUE_KEY};
use crate::database::path::{is_valid_key, Path, MAX_PATH_DEPTH};

/// Checks that `value` can be written at `path`.
///
/// `context` prefixes the error message, e.g. `"transaction failed: Data returned"`.
pub fn validate_writable_data(context: &str, value: &Value, path: &Path) -> DatabaseResult<()> {
    validate_node(context, value, path, path.len())
}

pub fn validate_priority(context: &str, priority: &Value) -> DatabaseResult<()> {
    match priority {
        Value::Null | Value::Number(_) | Value::String(_) => Ok(()),
        _ => Err(invalid_argument(format!(
            "{context} priority must be a string, number, or null"
        ))),
    }
}

fn validate_node(context: &str, value: &Value, path: &Path, depth: usize) -> DatabaseResult<()> {
    if depth > MAX_PATH_DEPTH {
        return Err(error_at(
            context,
            path,
            format!("data is nested deeper than {MAX_PATH_DEPTH} levels"),
        ));
    }
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                validate_node(context, item, &path.child(index.to_string()), depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) if map.contains_key(SERVER_VALUE_KEY) => {
            validate_server_placeholder(context, map, path)
        }
        Value::Object(map) => {
            if map.contains_key(VALUE_KEY)
                && map.keys().any(|key| key != VALUE_KEY && key != PRIORITY_KEY)
            {
                return Err(error_at(
                    context,
                    path,
                    "'.value' must be the only child besides '.priority'",
                ));
            }
            for (key, child) in map {
                match key.as_str() {
                    PRIORITY_KEY => validate_priority(context, child)?,
                    VALUE_KEY => {
                        if child.is_object() || child.is_array() {
                            return Err(error_at(
                                context,
                                path,
                                "'.value' must hold a primitive value",
                            ));
                        }
                    }
                    _ if is_valid_key(key) => {
                        validate_node(context, child, &path.child(key.clone()), depth + 1)?
                    }
                    _ => {
                        return Err(error_at(
                            context,
                            path,
                            format!(
                                "key '{key}' must be non-empty and cannot contain '.', '#', '$', '/', '[' or ']'"
                            ),
                        ))
                    }
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_server_placeholder(
    context: &str,
    map: &Map<String, Value>,
    path: &Path,
) -> DatabaseResult<()> {
    if map.len() != 1 {
        return Err(error_at(
            context,
            path,
            "server value placeholders cannot have siblings",
        ));
    }
    match map.get(SERVER_VALUE_KEY) {
        Some(Value::String(token)) if token == "timestamp" => Ok(()),
        Some(Value::Object(operation))
            if operation.len() == 1
                && operation.get("increment").map(Value::is_number) == Some(true) =>
        {
            Ok(())
        }
        _ => Err(error_at(
            context,
            path,
            "unsupported server value placeholder",
        )),
    }
}

fn error_at(context: &str, path: &Path, detail: impl AsRef<str>) -> DatabaseError {
    invalid_argument(format!("{context} at {path}: {}", detail.as_ref()))
}
