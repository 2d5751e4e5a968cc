use serde_json::Value;

use crate::database::error::DatabaseResult;
use crate::database::node::{children, export_value, get_at, priority_of};
use crate::database::path::Path;

/// Immutable copy of the data at a location, as handed to listeners and
/// transaction completions.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSnapshot {
    path: Path,
    node: Value,
    value: Value,
}

impl DataSnapshot {
    pub(crate) fn new(path: Path, node: Value) -> Self {
        let value = export_value(&node);
        Self { path, node, value }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last segment of the location, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    /// Plain JSON value with priority metadata removed.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn priority(&self) -> Value {
        priority_of(&self.node)
    }

    pub fn exists(&self) -> bool {
        !self.node.is_null()
    }

    /// Snapshot of a descendant location.
    pub fn child(&self, relative_path: &str) -> DatabaseResult<DataSnapshot> {
        let relative = Path::parse(relative_path)?;
        Ok(DataSnapshot::new(
            self.path.join(&relative),
            get_at(&self.node, &relative),
        ))
    }

    pub fn has_child(&self, relative_path: &str) -> DatabaseResult<bool> {
        let relative = Path::parse(relative_path)?;
        Ok(!get_at(&self.node, &relative).is_null())
    }

    pub fn has_children(&self) -> bool {
        !children(&self.node).is_empty()
    }

    /// Number of direct children.
    pub fn size(&self) -> usize {
        children(&self.node).len()
    }

    /// The stored representation including `.priority` and `.value` metadata.
    pub fn export(&self) -> Value {
        self.node.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exposes_value_priority_and_children() {
        let node = json!({
            "name": {".value": "ada", ".priority": 3},
            "tags": {"0": "x", "1": "y"},
            ".priority": "top"
        });
        let snapshot = DataSnapshot::new(Path::parse("users/ada").unwrap(), node.clone());

        assert_eq!(snapshot.key(), Some("ada"));
        assert_eq!(snapshot.priority(), json!("top"));
        assert_eq!(snapshot.value(), &json!({"name": "ada", "tags": ["x", "y"]}));
        assert_eq!(snapshot.size(), 2);
        assert!(snapshot.has_children());
        assert!(snapshot.has_child("tags/1").unwrap());
        assert!(!snapshot.has_child("missing").unwrap());
        assert_eq!(snapshot.export(), node);

        let name = snapshot.child("name").unwrap();
        assert_eq!(name.path().to_string(), "/users/ada/name");
        assert_eq!(name.value(), &json!("ada"));
        assert_eq!(name.priority(), json!(3));
        assert!(!name.has_children());
    }

    #[test]
    fn empty_snapshot_does_not_exist() {
        let snapshot = DataSnapshot::new(Path::root(), Value::Null);
        assert!(!snapshot.exists());
        assert_eq!(snapshot.key(), None);
        assert_eq!(snapshot.size(), 0);
    }
}
