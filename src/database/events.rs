//! Listener registry and event fan-out.
//!
//! Every listener remembers the last node it was shown. Raising events for a
//! changed path recomputes the view of each related listener and diffs it
//! against that node, so one transition yields at most one notification per
//! listener regardless of how many writes it touched.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::database::logger::LOGGER;
use crate::database::node::{children, compare_keys};
use crate::database::path::Path;
use crate::database::snapshot::DataSnapshot;

pub type ValueCallback = Arc<dyn Fn(DataSnapshot) + Send + Sync>;
pub type ChildCallback = Arc<dyn Fn(DataSnapshot, Option<String>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEventType {
    Added,
    Changed,
    Removed,
}

#[derive(Clone)]
pub(crate) enum ListenerKind {
    Value(ValueCallback),
    Child {
        event: ChildEventType,
        callback: ChildCallback,
    },
}

struct Listener {
    path: Path,
    kind: ListenerKind,
    last: Value,
}

/// An event ready to be delivered once the repo lock is released.
pub(crate) enum PendingEvent {
    Value {
        callback: ValueCallback,
        snapshot: DataSnapshot,
    },
    Child {
        callback: ChildCallback,
        snapshot: DataSnapshot,
        previous: Option<String>,
    },
}

impl PendingEvent {
    pub fn fire(self) {
        match self {
            PendingEvent::Value { callback, snapshot } => {
                guard_callback("value listener", move || callback(snapshot))
            }
            PendingEvent::Child {
                callback,
                snapshot,
                previous,
            } => guard_callback("child listener", move || callback(snapshot, previous)),
        }
    }
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    listeners: BTreeMap<u64, Listener>,
    next_id: u64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener showing `current` and returns the events for its
    /// initial state.
    pub fn register(
        &mut self,
        path: Path,
        kind: ListenerKind,
        current: Value,
    ) -> (u64, Vec<PendingEvent>) {
        let id = self.next_id;
        self.next_id += 1;
        let mut initial = Vec::new();
        match &kind {
            ListenerKind::Value(callback) => initial.push(PendingEvent::Value {
                callback: Arc::clone(callback),
                snapshot: DataSnapshot::new(path.clone(), current.clone()),
            }),
            ListenerKind::Child { event, callback } => {
                emit_child_events(&path, *event, callback, &Value::Null, &current, &mut initial)
            }
        }
        self.listeners.insert(
            id,
            Listener {
                path,
                kind,
                last: current,
            },
        );
        (id, initial)
    }

    /// Removes a listener, returning the path it observed.
    pub fn unregister(&mut self, id: u64) -> Option<Path> {
        self.listeners.remove(&id).map(|listener| listener.path)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Diffs every listener related to one of the `changed` paths against the
    /// view computed by `view` and returns the resulting events.
    pub fn raise<F>(&mut self, changed: &[Path], view: F) -> Vec<PendingEvent>
    where
        F: Fn(&Path) -> Value,
    {
        let mut events = Vec::new();
        for listener in self.listeners.values_mut() {
            if !changed.iter().any(|path| listener.path.is_related(path)) {
                continue;
            }
            let current = view(&listener.path);
            if current == listener.last {
                continue;
            }
            match &listener.kind {
                ListenerKind::Value(callback) => events.push(PendingEvent::Value {
                    callback: Arc::clone(callback),
                    snapshot: DataSnapshot::new(listener.path.clone(), current.clone()),
                }),
                ListenerKind::Child { event, callback } => emit_child_events(
                    &listener.path,
                    *event,
                    callback,
                    &listener.last,
                    &current,
                    &mut events,
                ),
            }
            listener.last = current;
        }
        events
    }
}

fn emit_child_events(
    parent: &Path,
    event: ChildEventType,
    callback: &ChildCallback,
    old_node: &Value,
    new_node: &Value,
    events: &mut Vec<PendingEvent>,
) {
    let old_children = children(old_node);
    let new_children = children(new_node);
    let mut push = |key: &str, node: &Value, previous: Option<String>| {
        events.push(PendingEvent::Child {
            callback: Arc::clone(callback),
            snapshot: DataSnapshot::new(parent.child(key), node.clone()),
            previous,
        })
    };
    match event {
        ChildEventType::Added => {
            let keys = sorted_keys(&new_children);
            for key in &keys {
                if !old_children.contains_key(key) {
                    push(key, &new_children[key], previous_key(&keys, key));
                }
            }
        }
        ChildEventType::Changed => {
            let keys = sorted_keys(&new_children);
            for key in &keys {
                match old_children.get(key) {
                    Some(old_child) if old_child != &new_children[key] => {
                        push(key, &new_children[key], previous_key(&keys, key))
                    }
                    _ => {}
                }
            }
        }
        ChildEventType::Removed => {
            let keys = sorted_keys(&old_children);
            for key in &keys {
                if !new_children.contains_key(key) {
                    push(key, &old_children[key], previous_key(&keys, key));
                }
            }
        }
    }
}

fn sorted_keys(children: &BTreeMap<String, Value>) -> Vec<String> {
    let mut keys: Vec<String> = children.keys().cloned().collect();
    keys.sort_by(|left, right| compare_keys(left, right));
    keys
}

fn previous_key(keys: &[String], key: &str) -> Option<String> {
    let index = keys.iter().position(|candidate| candidate == key)?;
    index.checked_sub(1).map(|previous| keys[previous].clone())
}

/// Work handed out of a critical section: a listener event or a
/// completion callback.
pub(crate) enum Delivery {
    Event(PendingEvent),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Event(event) => event.fire(),
            Delivery::Callback(callback) => guard_callback("completion callback", callback),
        }
    }
}

#[derive(Default)]
struct DeliveryState {
    pending: VecDeque<Delivery>,
    draining: bool,
}

/// Delivers events and callbacks in the order their critical sections
/// queued them, whichever thread produced them.
///
/// Only one caller drains at a time. A caller that finds the queue already
/// being drained, by another thread or further up its own stack, leaves its
/// work to that drainer.
#[derive(Default)]
pub(crate) struct DeliveryQueue {
    state: Mutex<DeliveryState>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues work. Must be called while the producer still holds the lock
    /// that ordered it.
    pub fn push(&self, deliveries: impl IntoIterator<Item = Delivery>) {
        self.lock().pending.extend(deliveries);
    }

    pub fn drain(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            next.deliver();
        }
    }
}

/// Runs user code, logging instead of unwinding through the engine when it
/// panics.
pub(crate) fn guard_callback<F>(context: &str, callback: F)
where
    F: FnOnce(),
{
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        LOGGER.error(format!("Exception was thrown by {context}: {message}"));
    }
}
