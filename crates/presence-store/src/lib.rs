use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path: {0}")]
    InvalidPath(String),
    #[error("unknown presence session {0}")]
    UnknownSession(u64),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A client connection to the store; paths registered with
/// [`PresenceStore::on_disconnect_remove`] are removed when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Key-path store with realtime-database semantics: values are JSON trees,
/// watchers on a path see changes to any descendant, and writing `null`
/// removes the node.
pub trait PresenceStore: Send + Sync {
    fn set(&self, path: &str, value: Value) -> StoreResult<()>;
    fn remove(&self, path: &str) -> StoreResult<()>;
    fn get(&self, path: &str) -> StoreResult<Option<Value>>;
    fn on_value(&self, path: &str) -> StoreResult<watch::Receiver<Option<Value>>>;
    fn open_session(&self) -> SessionHandle;
    fn on_disconnect_remove(&self, session: SessionHandle, path: &str) -> StoreResult<()>;
    fn disconnect(&self, session: SessionHandle);
}

/// In-memory store for tests, demos, and single-process lobbies.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    state: RwLock<StoreState>,
}

#[derive(Debug)]
struct StoreState {
    root: Value,
    watchers: HashMap<String, watch::Sender<Option<Value>>>,
    on_disconnect: HashMap<u64, Vec<String>>,
    next_session: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
            watchers: HashMap::new(),
            on_disconnect: HashMap::new(),
            next_session: 1,
        }
    }
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreState {
    fn apply(&mut self, segments: &[&str], value: Value) {
        if value.is_null() {
            remove_at(&mut self.root, segments);
        } else {
            insert_at(&mut self.root, segments, value);
        }
        self.notify(segments);
    }

    fn notify(&mut self, changed: &[&str]) {
        let root = &self.root;
        self.watchers.retain(|watched, sender| {
            if sender.receiver_count() == 0 {
                return false;
            }
            let watched_segments = split_path(watched);
            if is_related(&watched_segments, changed) {
                let current = lookup(root, &watched_segments).cloned();
                sender.send_if_modified(|slot| {
                    if *slot != current {
                        *slot = current;
                        true
                    } else {
                        false
                    }
                });
            }
            true
        });
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let segments = parse_path(path)?;
        self.state.write().apply(&segments, value);
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        self.set(path, Value::Null)
    }

    fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let segments = parse_path(path)?;
        Ok(lookup(&self.state.read().root, &segments).cloned())
    }

    fn on_value(&self, path: &str) -> StoreResult<watch::Receiver<Option<Value>>> {
        let segments = parse_path(path)?;
        let key = segments.join("/");
        let mut guard = self.state.write();
        let current = lookup(&guard.root, &segments).cloned();
        let sender = guard
            .watchers
            .entry(key)
            .or_insert_with(|| watch::channel(current).0);
        Ok(sender.subscribe())
    }

    fn open_session(&self) -> SessionHandle {
        let mut guard = self.state.write();
        let id = guard.next_session;
        guard.next_session += 1;
        guard.on_disconnect.insert(id, Vec::new());
        SessionHandle(id)
    }

    fn on_disconnect_remove(&self, session: SessionHandle, path: &str) -> StoreResult<()> {
        let segments = parse_path(path)?;
        let mut guard = self.state.write();
        let paths = guard
            .on_disconnect
            .get_mut(&session.0)
            .ok_or(StoreError::UnknownSession(session.0))?;
        paths.push(segments.join("/"));
        Ok(())
    }

    fn disconnect(&self, session: SessionHandle) {
        let mut guard = self.state.write();
        let Some(paths) = guard.on_disconnect.remove(&session.0) else {
            return;
        };
        for path in paths {
            debug!(
                target = "presence_store",
                session = session.0,
                path = %path,
                "removing on disconnect"
            );
            let segments = split_path(&path);
            guard.apply(&segments, Value::Null);
        }
    }
}

fn parse_path(path: &str) -> StoreResult<Vec<&str>> {
    let segments = split_path(path);
    if segments
        .iter()
        .any(|segment| segment.contains(['.', '#', '$', '[', ']']))
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn is_related(watched: &[&str], changed: &[&str]) -> bool {
    watched.iter().zip(changed.iter()).all(|(a, b)| a == b)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(*segment)?;
    }
    if node.as_object().is_some_and(Map::is_empty) {
        return None;
    }
    Some(node)
}

fn insert_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert_at(child, rest, value);
    }
}

/// Remove the node and prune parents left empty by the removal.
fn remove_at(root: &mut Value, segments: &[&str]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        *root = Value::Object(Map::new());
        return true;
    };
    let Value::Object(map) = root else {
        return false;
    };
    if rest.is_empty() {
        map.remove(*first);
    } else if let Some(child) = map.get_mut(*first) {
        remove_at(child, rest);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(*first);
        }
    }
    map.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn watcher_sees_descendant_writes() {
        let store = MemoryPresenceStore::new();
        let mut rx = store.on_value("lobby/ABC123/peers").expect("watch");
        assert_eq!(*rx.borrow_and_update(), None);

        store
            .set("lobby/ABC123/peers/dev-a", json!({ "name": "Lane 1" }))
            .expect("set");
        rx.changed().await.expect("changed");
        assert_eq!(
            *rx.borrow_and_update(),
            Some(json!({ "dev-a": { "name": "Lane 1" } }))
        );

        store.remove("lobby/ABC123/peers/dev-a").expect("remove");
        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), None);
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_wake_watchers() {
        let store = MemoryPresenceStore::new();
        let mut rx = store.on_value("lobby/A/peers").expect("watch");
        store.set("lobby/B/peers/x", json!(true)).expect("set");
        assert!(!rx.has_changed().expect("open"));
        store.set("lobby/A/peers/y", json!(true)).expect("set");
        assert!(rx.has_changed().expect("open"));
    }

    #[test]
    fn ancestor_watch_and_overwrite() {
        let store = MemoryPresenceStore::new();
        store.set("a/b/c", json!(1)).expect("set");
        let rx = store.on_value("a/b/c").expect("watch");
        store.set("a", json!({ "b": { "c": 2 } })).expect("set");
        assert_eq!(*rx.borrow(), Some(json!(2)));
        assert_eq!(store.get("a/b").expect("get"), Some(json!({ "c": 2 })));
    }

    #[test]
    fn removing_last_child_prunes_parents() {
        let store = MemoryPresenceStore::new();
        store.set("lobby/S/signals/dev-b/1", json!("x")).expect("set");
        store.remove("lobby/S/signals/dev-b/1").expect("remove");
        assert_eq!(store.get("lobby").expect("get"), None);
    }

    #[test]
    fn disconnect_removes_registered_paths() {
        let store = MemoryPresenceStore::new();
        let session = store.open_session();
        store.set("lobby/S/peers/dev-a", json!({ "ready": false })).expect("set");
        store.set("lobby/S/peers/dev-b", json!({ "ready": true })).expect("set");
        store
            .on_disconnect_remove(session, "lobby/S/peers/dev-a")
            .expect("register");
        let rx = store.on_value("lobby/S/peers").expect("watch");

        store.disconnect(session);
        assert_eq!(*rx.borrow(), Some(json!({ "dev-b": { "ready": true } })));
        // Second disconnect is a no-op.
        store.disconnect(session);
        assert!(matches!(
            store.on_disconnect_remove(session, "x"),
            Err(StoreError::UnknownSession(_))
        ));
    }

    #[test]
    fn rejects_reserved_characters() {
        let store = MemoryPresenceStore::new();
        assert!(matches!(
            store.set("lobby/a.b", json!(1)),
            Err(StoreError::InvalidPath(_))
        ));
    }
}
