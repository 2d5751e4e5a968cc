//! Helpers over database nodes.
//!
//! Nodes are stored as `serde_json::Value` in the exported wire format: a leaf
//! with a priority is `{".value": v, ".priority": p}`, an object with a
//! priority carries a `.priority` key next to its children. Absent data is
//! `Value::Null`; empty objects and arrays collapse to `Null`, and arrays are
//! stored as objects keyed by index.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::database::path::Path;
use crate::util::sha1_base64;

pub(crate) const PRIORITY_KEY: &str = ".priority";
pub(crate) const VALUE_KEY: &str = ".value";
pub(crate) const SERVER_VALUE_KEY: &str = ".sv";

/// `true` for a `{".sv": ...}` placeholder.
pub(crate) fn is_server_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.contains_key(SERVER_VALUE_KEY))
        .unwrap_or(false)
}

/// Canonicalises user supplied data into the stored representation.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let map = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (index.to_string(), item))
                .collect();
            normalize(Value::Object(map))
        }
        Value::Object(map) if map.contains_key(SERVER_VALUE_KEY) => Value::Object(map),
        Value::Object(mut map) => {
            let priority = map.remove(PRIORITY_KEY).unwrap_or(Value::Null);
            let node = match map.remove(VALUE_KEY) {
                Some(leaf) => normalize(leaf),
                None => {
                    let mut children = Map::with_capacity(map.len());
                    for (key, child) in map {
                        let child = normalize(child);
                        if !child.is_null() {
                            children.insert(key, child);
                        }
                    }
                    if children.is_empty() {
                        Value::Null
                    } else {
                        Value::Object(children)
                    }
                }
            };
            with_priority(node, priority)
        }
        other => other,
    }
}

/// Returns the data of a node with the priority wrapper removed (leaves only).
pub(crate) fn leaf_data(node: &Value) -> &Value {
    node.as_object()
        .and_then(|map| map.get(VALUE_KEY))
        .unwrap_or(node)
}

fn has_children(node: &Value) -> bool {
    match node {
        Value::Object(map) => !map.contains_key(VALUE_KEY) && !map.contains_key(SERVER_VALUE_KEY),
        _ => false,
    }
}

pub fn priority_of(node: &Value) -> Value {
    node.as_object()
        .and_then(|map| map.get(PRIORITY_KEY))
        .cloned()
        .unwrap_or(Value::Null)
}

/// `true` when the written value names its own priority.
pub(crate) fn has_explicit_priority(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.contains_key(PRIORITY_KEY))
        .unwrap_or(false)
}

/// Replaces the priority of a node. Empty nodes never carry a priority.
pub fn with_priority(node: Value, priority: Value) -> Value {
    let node = without_priority(node);
    if node.is_null() || priority.is_null() {
        return node;
    }
    match node {
        Value::Object(mut map) if !map.contains_key(SERVER_VALUE_KEY) => {
            map.insert(PRIORITY_KEY.to_string(), priority);
            Value::Object(map)
        }
        leaf => {
            let mut map = Map::with_capacity(2);
            map.insert(VALUE_KEY.to_string(), leaf);
            map.insert(PRIORITY_KEY.to_string(), priority);
            Value::Object(map)
        }
    }
}

fn without_priority(node: Value) -> Value {
    match node {
        Value::Object(mut map) => {
            map.remove(PRIORITY_KEY);
            match map.remove(VALUE_KEY) {
                Some(leaf) => leaf,
                None if map.is_empty() => Value::Null,
                None => Value::Object(map),
            }
        }
        other => other,
    }
}

/// Returns the direct child `key` of `node`, or `Null`.
pub(crate) fn immediate_child(node: &Value, key: &str) -> Value {
    if !has_children(node) {
        return Value::Null;
    }
    node.get(key).cloned().unwrap_or(Value::Null)
}

/// Returns the node stored at `path` below `node`, or `Null`.
pub fn get_at(node: &Value, path: &Path) -> Value {
    let mut current = node;
    for segment in path.segments() {
        if !has_children(current) {
            return Value::Null;
        }
        match current.get(segment) {
            Some(child) => current = child,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Writes `value` at `path` below `node`, creating intermediate children and
/// pruning branches that become empty. Leaves replaced by children keep their
/// priority.
pub fn set_at(node: &mut Value, path: &Path, value: Value) {
    set_at_segments(node, path.segments(), value);
}

fn set_at_segments(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !has_children(node) {
        if value.is_null() {
            return;
        }
        let priority = priority_of(node);
        let mut map = Map::new();
        if !priority.is_null() {
            map.insert(PRIORITY_KEY.to_string(), priority);
        }
        *node = Value::Object(map);
    }
    let Value::Object(map) = node else {
        return;
    };
    let mut child = map.remove(first).unwrap_or(Value::Null);
    set_at_segments(&mut child, rest, value);
    if !child.is_null() {
        map.insert(first.clone(), child);
    }
    if map.keys().all(|key| key == PRIORITY_KEY) {
        *node = Value::Null;
    }
}

/// Returns the children of a node keyed by name, excluding metadata keys.
pub(crate) fn children(node: &Value) -> BTreeMap<String, Value> {
    if !has_children(node) {
        return BTreeMap::new();
    }
    node.as_object()
        .map(|map| {
            map.iter()
                .filter(|(key, _)| key.as_str() != PRIORITY_KEY)
                .map(|(key, child)| (key.clone(), child.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Converts a stored node into the plain value handed to user code: priority
/// metadata is dropped and objects whose keys are dense integers come back as
/// arrays.
pub fn export_value(node: &Value) -> Value {
    if is_server_placeholder(node) {
        return node.clone();
    }
    if !has_children(node) {
        return leaf_data(node).clone();
    }
    let children = children(node);
    let mut all_integer_keys = true;
    let mut max_index = 0usize;
    for key in children.keys() {
        match parse_index(key) {
            Some(index) => max_index = max_index.max(index),
            None => {
                all_integer_keys = false;
                break;
            }
        }
    }
    if all_integer_keys && !children.is_empty() && max_index < 2 * children.len() {
        let mut items = vec![Value::Null; max_index + 1];
        for (key, child) in &children {
            if let Some(index) = parse_index(key) {
                items[index] = export_value(child);
            }
        }
        return Value::Array(items);
    }
    Value::Object(
        children
            .iter()
            .map(|(key, child)| (key.clone(), export_value(child)))
            .collect(),
    )
}

fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    if !key.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

/// Hash of a node, used as the version token of conditional writes. Empty
/// nodes hash to the empty string.
pub fn node_hash(node: &Value) -> String {
    if node.is_null() {
        return String::new();
    }
    let mut to_hash = String::new();
    let priority = priority_of(node);
    if !priority.is_null() {
        to_hash.push_str("priority:");
        to_hash.push_str(&priority_hash_text(&priority));
        to_hash.push(':');
    }
    if has_children(node) {
        let mut entries: Vec<(String, Value)> = children(node).into_iter().collect();
        entries.sort_by(|(left_key, left), (right_key, right)| {
            compare_priorities(&priority_of(left), &priority_of(right))
                .then_with(|| compare_keys(left_key, right_key))
        });
        for (key, child) in entries {
            let child_hash = node_hash(&child);
            if !child_hash.is_empty() {
                to_hash.push(':');
                to_hash.push_str(&key);
                to_hash.push(':');
                to_hash.push_str(&child_hash);
            }
        }
        if to_hash.is_empty() {
            return String::new();
        }
        return sha1_base64(to_hash);
    }
    match leaf_data(node) {
        Value::Bool(flag) => {
            to_hash.push_str("boolean:");
            to_hash.push_str(&flag.to_string());
        }
        Value::Number(number) => {
            to_hash.push_str("number:");
            to_hash.push_str(&double_to_hex(number.as_f64().unwrap_or_default()));
        }
        Value::String(text) => {
            to_hash.push_str("string:");
            to_hash.push_str(text);
        }
        other => {
            to_hash.push_str("object:");
            to_hash.push_str(&other.to_string());
        }
    }
    sha1_base64(to_hash)
}

fn priority_hash_text(priority: &Value) -> String {
    match priority {
        Value::Number(number) => {
            format!("number:{}", double_to_hex(number.as_f64().unwrap_or_default()))
        }
        Value::String(text) => format!("string:{text}"),
        other => format!("string:{other}"),
    }
}

fn double_to_hex(value: f64) -> String {
    value
        .to_be_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Orders priorities: none first, then numbers, then strings.
fn compare_priorities(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Number(_) => 1,
            _ => 2,
        }
    }
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .unwrap_or_default()
            .total_cmp(&b.as_f64().unwrap_or_default()),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => rank(left).cmp(&rank(right)),
    }
}

/// Orders keys: integer keys numerically first, then the rest lexically.
pub(crate) fn compare_keys(left: &str, right: &str) -> Ordering {
    match (parse_index(left), parse_index(right)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => left.cmp(right),
    }
}
