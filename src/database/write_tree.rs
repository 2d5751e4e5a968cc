//! Local state calculator.
//!
//! Holds the authoritative server cache and the ordered list of pending user
//! writes layered on top of it. Reads compose the two.

use serde_json::Value;

use crate::database::node::{get_at, set_at};
use crate::database::path::Path;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum WriteKind {
    Overwrite(Value),
    /// Children relative to the write path.
    Merge(Vec<(Path, Value)>),
}

#[derive(Clone, Debug)]
pub(crate) struct UserWrite {
    pub write_id: u64,
    pub path: Path,
    pub kind: WriteKind,
    pub visible: bool,
}

impl UserWrite {
    /// Applies this write onto `node`, the value currently composed at
    /// `location`.
    fn apply_to(&self, location: &Path, node: &mut Value) {
        match &self.kind {
            WriteKind::Overwrite(value) => overlay(location, node, &self.path, value),
            WriteKind::Merge(children) => {
                for (relative, value) in children {
                    overlay(location, node, &self.path.join(relative), value);
                }
            }
        }
    }
}

fn overlay(location: &Path, node: &mut Value, write_path: &Path, value: &Value) {
    if let Some(relative) = write_path.relative_to_child(location) {
        *node = get_at(value, &relative);
    } else if let Some(relative) = location.relative_to_child(write_path) {
        set_at(node, &relative, value.clone());
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriteTree {
    server_cache: Value,
    writes: Vec<UserWrite>,
}

impl WriteTree {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn server_cache(&self, path: &Path) -> Value {
        get_at(&self.server_cache, path)
    }

    /// Composes the server cache at `path` with every pending write that is
    /// not listed in `excluded`, in write id order. Hidden writes are only
    /// included when `include_hidden` is set.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        excluded: &[u64],
        include_hidden: bool,
    ) -> Value {
        let mut node = get_at(&self.server_cache, path);
        for write in &self.writes {
            if excluded.contains(&write.write_id) || !(write.visible || include_hidden) {
                continue;
            }
            write.apply_to(path, &mut node);
        }
        node
    }

    pub fn apply_user_overwrite(
        &mut self,
        path: &Path,
        value: Value,
        write_id: u64,
        visible: bool,
    ) -> Path {
        self.push(UserWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Overwrite(value),
            visible,
        });
        path.clone()
    }

    pub fn apply_user_merge(
        &mut self,
        path: &Path,
        children: Vec<(Path, Value)>,
        write_id: u64,
    ) -> Path {
        self.push(UserWrite {
            write_id,
            path: path.clone(),
            kind: WriteKind::Merge(children),
            visible: true,
        });
        path.clone()
    }

    fn push(&mut self, write: UserWrite) {
        debug_assert!(
            self.writes
                .last()
                .map(|last| last.write_id < write.write_id)
                .unwrap_or(true),
            "write ids must be strictly increasing"
        );
        self.writes.push(write);
    }

    pub fn write_path(&self, write_id: u64) -> Option<&Path> {
        self.writes
            .iter()
            .find(|write| write.write_id == write_id)
            .map(|write| &write.path)
    }

    /// Removes a pending write. When `commit` is set the write's data is
    /// folded into the server cache first, for locations no server updates
    /// will arrive for. Returns the path whose composed value may have
    /// changed, or `None` for unknown ids.
    pub fn ack_user_write(&mut self, write_id: u64, commit: bool) -> Option<Path> {
        let index = self
            .writes
            .iter()
            .position(|write| write.write_id == write_id)?;
        let write = self.writes.remove(index);
        if commit {
            let root = Path::root();
            write.apply_to(&root, &mut self.server_cache);
        }
        Some(write.path)
    }

    /// Replaces the server cache at `path`. Returns `false` when the cached
    /// value was already identical.
    pub fn apply_server_overwrite(&mut self, path: &Path, value: Value) -> bool {
        if get_at(&self.server_cache, path) == value {
            return false;
        }
        set_at(&mut self.server_cache, path, value);
        true
    }

    #[cfg(test)]
    pub fn pending_write_ids(&self) -> Vec<u64> {
        self.writes.iter().map(|write| write.write_id).collect()
    }
}
