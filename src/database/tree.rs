use std::collections::BTreeMap;

use crate::database::path::Path;

/// Path keyed tree. Each node optionally holds a value and owns its children.
#[derive(Debug)]
pub(crate) struct Tree<T> {
    value: Option<T>,
    children: BTreeMap<String, Tree<T>>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub fn set_value(&mut self, value: Option<T>) {
        self.value = value;
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn child_keys(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Returns the node at `path`, if it exists.
    pub fn get(&self, path: &Path) -> Option<&Tree<T>> {
        let mut node = self;
        for segment in path.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut Tree<T>> {
        let mut node = self;
        for segment in path.segments() {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    /// Returns the node at `path`, creating empty intermediate nodes.
    pub fn subtree_mut(&mut self, path: &Path) -> &mut Tree<T> {
        let mut node = self;
        for segment in path.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        node
    }

    /// Path of the rootmost node along `path` that holds a value, or `path`
    /// itself when none does.
    pub fn rootmost_valued_ancestor(&self, path: &Path) -> Path {
        let mut node = self;
        let mut walked = Path::root();
        for segment in path.segments() {
            if node.value.is_some() {
                return walked;
            }
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return path.clone(),
            }
            walked = walked.child(segment.clone());
        }
        walked
    }

    /// Paths of every node strictly above `path` that holds a value,
    /// nearest first.
    pub fn valued_ancestors(&self, path: &Path) -> Vec<Path> {
        let mut found = Vec::new();
        let mut node = self;
        let mut walked = Path::root();
        for segment in path.segments() {
            if node.value.is_some() {
                found.push(walked.clone());
            }
            match node.children.get(segment) {
                Some(child) => node = child,
                None => break,
            }
            walked = walked.child(segment.clone());
        }
        found.reverse();
        found
    }

    /// Paths of every node at or below `path` that holds a value, in
    /// depth-first key order.
    pub fn valued_paths_below(&self, path: &Path) -> Vec<Path> {
        let mut found = Vec::new();
        if let Some(node) = self.get(path) {
            node.collect_valued_paths(path.clone(), &mut found);
        }
        found
    }

    fn collect_valued_paths(&self, path: Path, found: &mut Vec<Path>) {
        if self.value.is_some() {
            found.push(path.clone());
        }
        for (key, child) in &self.children {
            child.collect_valued_paths(path.child(key.clone()), found);
        }
    }

    /// Mutable references to every value at or below this node.
    pub fn values_mut(&mut self) -> Vec<&mut T> {
        let mut found = Vec::new();
        self.collect_values_mut(&mut found);
        found
    }

    fn collect_values_mut<'a>(&'a mut self, found: &mut Vec<&'a mut T>) {
        if let Some(value) = self.value.as_mut() {
            found.push(value);
        }
        for child in self.children.values_mut() {
            child.collect_values_mut(found);
        }
    }

    pub fn values(&self) -> Vec<&T> {
        let mut found = Vec::new();
        self.collect_values(&mut found);
        found
    }

    fn collect_values<'a>(&'a self, found: &mut Vec<&'a T>) {
        if let Some(value) = self.value.as_ref() {
            found.push(value);
        }
        for child in self.children.values() {
            child.collect_values(found);
        }
    }

    /// Drops every node that holds no value and has no children.
    pub fn prune(&mut self) {
        for child in self.children.values_mut() {
            child.prune();
        }
        self.children.retain(|_, child| !child.is_empty());
    }
}
