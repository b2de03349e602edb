use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::element::{DataElement, ElementPath, PathError};
use crate::error::ProviderError;
use crate::provider::{
    ByteStream, Notification, NotificationKind, NotificationSender, Provider, ProviderStatus,
    ResultCode, SubscriptionId, subscription_covers,
};

const CLOCK_START: i64 = 1_700_000_000_000;

struct Node {
    element: DataElement,
    data: Vec<u8>,
}

struct Subscription {
    root: ElementPath,
    recursive: bool,
    listener: NotificationSender,
}

struct MemoryState {
    nodes: BTreeMap<ElementPath, Node>,
    locks: HashSet<ElementPath>,
    /// Lock requests for paths containing any of these are answered `Locked`.
    refused_locks: Vec<String>,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription: u64,
    clock: i64,
}

impl MemoryState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn subtree(&self, path: &ElementPath) -> Vec<ElementPath> {
        self.nodes
            .range(path.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| path.is_ancestor_or_self(key))
            .cloned()
            .collect()
    }

    fn ensure_ancestors(
        &mut self,
        path: &ElementPath,
        events: &mut Vec<Notification>,
    ) -> Result<(), ProviderError> {
        let mut missing = Vec::new();
        let mut cursor = path.parent();
        while let Some(ancestor) = cursor {
            if ancestor.is_root() {
                break;
            }
            match self.nodes.get(&ancestor) {
                Some(node) if node.element.is_folder() => break,
                Some(_) => {
                    return Err(io::Error::other(format!("{ancestor} is a file")).into());
                }
                None => missing.push(ancestor.clone()),
            }
            cursor = ancestor.parent();
        }
        for ancestor in missing.into_iter().rev() {
            let element = DataElement::folder(ancestor.clone());
            events.push(Notification {
                kind: NotificationKind::Add,
                path: ancestor.clone(),
                element: Some(element.clone()),
            });
            self.nodes.insert(
                ancestor,
                Node {
                    element,
                    data: Vec::new(),
                },
            );
        }
        Ok(())
    }

    fn publish(&self, events: Vec<Notification>) {
        for event in events {
            for subscription in self.subscriptions.values() {
                if subscription_covers(&subscription.root, subscription.recursive, &event.path) {
                    let _ = subscription.listener.send(event.clone());
                }
            }
        }
    }
}

/// Provider holding its whole tree in memory.
///
/// Serves as the scratch side of the daemon and as the peer sides in tests.
/// Modification dates come from a logical millisecond clock that only moves
/// forward.
pub struct MemoryProvider {
    name: String,
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    direct_transfer: AtomicBool,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                nodes: BTreeMap::new(),
                locks: HashSet::new(),
                refused_locks: Vec::new(),
                subscriptions: HashMap::new(),
                next_subscription: 1,
                clock: CLOCK_START,
            }),
            offline: AtomicBool::new(false),
            direct_transfer: AtomicBool::new(true),
        }
    }

    /// Every call fails with `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_direct_transfer(&self, enabled: bool) {
        self.direct_transfer.store(enabled, Ordering::SeqCst);
    }

    /// Makes every later lock on a path containing `marker` fail, as if held elsewhere.
    pub async fn refuse_locks_containing(&self, marker: &str) {
        self.state.lock().await.refused_locks.push(marker.to_string());
    }

    /// Currently held lock paths, sorted.
    pub async fn locked_paths(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut paths: Vec<String> = state.locks.iter().map(ToString::to_string).collect();
        paths.sort();
        paths
    }

    /// Writes a file with an explicit modification date, as an outside editor would.
    pub async fn put_file(
        &self,
        path: &str,
        data: &[u8],
        modified: i64,
    ) -> Result<DataElement, ProviderError> {
        let path = ElementPath::parse(path)?;
        if path.is_root() {
            return Err(PathError::Root.into());
        }
        let mut state = self.state.lock().await;
        let mut events = Vec::new();
        state.ensure_ancestors(&path, &mut events)?;
        let existed = state.nodes.contains_key(&path);
        if state.nodes.get(&path).is_some_and(|node| node.element.is_folder()) {
            return Err(io::Error::other(format!("{path} is a folder")).into());
        }
        state.clock = state.clock.max(modified);
        let element = DataElement::file(path.clone(), data.len() as u64, modified);
        state.nodes.insert(
            path.clone(),
            Node {
                element: element.clone(),
                data: data.to_vec(),
            },
        );
        events.push(Notification {
            kind: if existed {
                NotificationKind::Modify
            } else {
                NotificationKind::Add
            },
            path,
            element: Some(element.clone()),
        });
        state.publish(events);
        Ok(element)
    }

    pub async fn put_folder(&self, path: &str) -> Result<ResultCode, ProviderError> {
        let path = ElementPath::parse(path)?;
        self.create_folder(&path).await
    }

    pub async fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = ElementPath::parse(path).ok()?;
        let state = self.state.lock().await;
        state
            .nodes
            .get(&path)
            .filter(|node| node.element.is_file())
            .map(|node| node.data.clone())
    }

    /// All stored paths in tree order, for assertions.
    pub async fn paths(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.nodes.keys().map(ToString::to_string).collect()
    }

    fn ensure_online(&self) -> Result<(), ProviderError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> ProviderStatus {
        if self.offline.load(Ordering::SeqCst) {
            ProviderStatus::Disconnected
        } else {
            ProviderStatus::Ready
        }
    }

    fn supports_direct_transfer(&self) -> bool {
        self.direct_transfer.load(Ordering::SeqCst)
    }

    async fn read_data(&self, path: &ElementPath) -> Result<ByteStream, ProviderError> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        match state.nodes.get(path) {
            Some(node) if node.element.is_file() => {
                Ok(Box::new(io::Cursor::new(node.data.clone())))
            }
            _ => Err(ProviderError::NotFound(path.to_string())),
        }
    }

    async fn write_data(
        &self,
        path: &ElementPath,
        mut data: ByteStream,
    ) -> Result<u64, ProviderError> {
        self.ensure_online()?;
        if path.is_root() {
            return Err(PathError::Root.into());
        }
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await?;

        let mut state = self.state.lock().await;
        if state.nodes.get(path).is_some_and(|node| node.element.is_folder()) {
            return Err(io::Error::other(format!("{path} is a folder")).into());
        }
        let mut events = Vec::new();
        state.ensure_ancestors(path, &mut events)?;
        let existed = state.nodes.contains_key(path);
        let modified = state.tick();
        let written = buffer.len() as u64;
        let element = DataElement::file(path.clone(), written, modified);
        state.nodes.insert(
            path.clone(),
            Node {
                element: element.clone(),
                data: buffer,
            },
        );
        events.push(Notification {
            kind: if existed {
                NotificationKind::Modify
            } else {
                NotificationKind::Add
            },
            path: path.clone(),
            element: Some(element),
        });
        state.publish(events);
        Ok(written)
    }

    async fn create_folder(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        self.ensure_online()?;
        if path.is_root() {
            return Ok(ResultCode::Ok);
        }
        let mut state = self.state.lock().await;
        match state.nodes.get(path) {
            Some(node) if node.element.is_folder() => return Ok(ResultCode::Ok),
            Some(_) => return Ok(ResultCode::Failed),
            None => {}
        }
        let mut events = Vec::new();
        state.ensure_ancestors(path, &mut events)?;
        let element = DataElement::folder(path.clone());
        state.nodes.insert(
            path.clone(),
            Node {
                element: element.clone(),
                data: Vec::new(),
            },
        );
        events.push(Notification {
            kind: NotificationKind::Add,
            path: path.clone(),
            element: Some(element),
        });
        state.publish(events);
        Ok(ResultCode::Ok)
    }

    async fn delete(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        self.ensure_online()?;
        if path.is_root() {
            return Ok(ResultCode::Failed);
        }
        let mut state = self.state.lock().await;
        if !state.nodes.contains_key(path) {
            return Ok(ResultCode::ReadOnly);
        }
        let removed = state.subtree(path);
        let mut events = Vec::with_capacity(removed.len());
        for key in removed.into_iter().rev() {
            state.nodes.remove(&key);
            events.push(Notification {
                kind: NotificationKind::Delete,
                path: key,
                element: None,
            });
        }
        state.publish(events);
        Ok(ResultCode::Ok)
    }

    async fn move_element(
        &self,
        from: &ElementPath,
        to: &ElementPath,
    ) -> Result<ResultCode, ProviderError> {
        self.ensure_online()?;
        if from.is_root() || to.is_root() || from.is_ancestor_or_self(to) {
            return Ok(ResultCode::Failed);
        }
        let mut state = self.state.lock().await;
        if !state.nodes.contains_key(from) || state.nodes.contains_key(to) {
            return Ok(ResultCode::Failed);
        }
        let mut events = Vec::new();
        state.ensure_ancestors(to, &mut events)?;
        for key in state.subtree(from) {
            let Some(mut node) = state.nodes.remove(&key) else {
                continue;
            };
            let Some(target) = key.rebase(from, to) else {
                return Err(PathError::TooDeep.into());
            };
            node.element.path = target.clone();
            events.push(Notification {
                kind: NotificationKind::Delete,
                path: key,
                element: None,
            });
            events.push(Notification {
                kind: NotificationKind::Add,
                path: target.clone(),
                element: Some(node.element.clone()),
            });
            state.nodes.insert(target, node);
        }
        state.publish(events);
        Ok(ResultCode::Ok)
    }

    async fn get_element(&self, path: &ElementPath) -> Result<Option<DataElement>, ProviderError> {
        self.ensure_online()?;
        if path.is_root() {
            return Ok(Some(DataElement::folder(ElementPath::root())));
        }
        let state = self.state.lock().await;
        Ok(state.nodes.get(path).map(|node| node.element.clone()))
    }

    async fn get_child_elements(
        &self,
        path: &ElementPath,
        recursive: bool,
    ) -> Result<Vec<DataElement>, ProviderError> {
        self.ensure_online()?;
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .range(path.clone()..)
            .take_while(|(key, _)| path.is_ancestor_or_self(key))
            .filter(|(key, _)| {
                *key != path && (recursive || key.depth() == path.depth() + 1)
            })
            .map(|(_, node)| node.element.clone())
            .collect())
    }

    async fn check_and_lock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let rendered = path.to_string();
        if state
            .refused_locks
            .iter()
            .any(|marker| rendered.contains(marker.as_str()))
        {
            return Ok(ResultCode::Locked);
        }
        if state.locks.insert(path.clone()) {
            Ok(ResultCode::Ok)
        } else {
            Ok(ResultCode::Locked)
        }
    }

    async fn unlock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        let mut state = self.state.lock().await;
        if state.locks.remove(path) {
            Ok(ResultCode::Ok)
        } else {
            Ok(ResultCode::Failed)
        }
    }

    async fn subscribe(
        &self,
        path: &ElementPath,
        recursive: bool,
        listener: NotificationSender,
    ) -> Result<SubscriptionId, ProviderError> {
        self.ensure_online()?;
        let mut state = self.state.lock().await;
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(
            id,
            Subscription {
                root: path.clone(),
                recursive,
                listener,
            },
        );
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .remove(&id.0)
            .map(|_| ())
            .ok_or(ProviderError::UnknownSubscription(id.0))
    }
}
