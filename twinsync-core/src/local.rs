use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::element::{DataElement, ElementPath, MAX_PATH_DEPTH, PathError};
use crate::error::ProviderError;
use crate::provider::{
    ByteStream, Notification, NotificationKind, NotificationSender, Provider, ProviderStatus,
    ResultCode, SubscriptionId,
};

const PARTIAL_SUFFIX: &str = ".twinsync-partial";

/// Provider backed by a directory on the local filesystem.
pub struct LocalFsProvider {
    name: String,
    root: PathBuf,
    locks: Mutex<HashSet<ElementPath>>,
    watchers: Mutex<HashMap<u64, RecommendedWatcher>>,
    next_subscription: Mutex<u64>,
}

impl LocalFsProvider {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            locks: Mutex::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            next_subscription: Mutex::new(1),
        }
    }

    pub fn fs_path(&self, path: &ElementPath) -> PathBuf {
        fs_path_for(&self.root, path)
    }
}

pub fn fs_path_for(root: &Path, path: &ElementPath) -> PathBuf {
    let mut out = root.to_path_buf();
    for segment in path.segments() {
        out.push(segment);
    }
    out
}

/// Maps a path below `root` back to an element path.
pub fn element_path_for(root: &Path, path: &Path) -> Result<ElementPath, PathError> {
    let relative = path.strip_prefix(root).map_err(|_| PathError::Root)?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedSegment(
                    component.as_os_str().to_string_lossy().into_owned(),
                ));
            }
        }
    }
    ElementPath::from_segments(segments)
}

fn element_from_metadata(path: ElementPath, meta: &std::fs::Metadata) -> DataElement {
    if meta.is_dir() {
        return DataElement::folder(path);
    }
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    DataElement::file(path, meta.len(), modified)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX))
}

/// Missing entries and entries below a file both mean "nothing there".
fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn map_event(root: &Path, event: Event) -> Vec<Notification> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            let mut out = Vec::new();
            if let Some(from) = notification_for(root, &event.paths[0], NotificationKind::Delete) {
                out.push(from);
            }
            if let Some(to) = notification_for(root, &event.paths[1], NotificationKind::Add) {
                out.push(to);
            }
            out
        }
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|path| notification_for(root, path, NotificationKind::Add))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| notification_for(root, path, NotificationKind::Modify))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| notification_for(root, path, NotificationKind::Delete))
            .collect(),
        _ => Vec::new(),
    }
}

fn notification_for(root: &Path, fs_path: &Path, kind: NotificationKind) -> Option<Notification> {
    if is_partial(fs_path) {
        return None;
    }
    let path = element_path_for(root, fs_path).ok()?;
    if path.is_root() {
        return None;
    }
    let element = match std::fs::symlink_metadata(fs_path) {
        Ok(meta) => Some(element_from_metadata(path.clone(), &meta)),
        Err(_) => None,
    };
    // A rename or remove whose target still exists is really a change.
    let kind = match (kind, &element) {
        (NotificationKind::Delete, Some(_)) => NotificationKind::Modify,
        (NotificationKind::Add | NotificationKind::Modify, None) => NotificationKind::Delete,
        (kind, _) => kind,
    };
    Some(Notification {
        kind,
        path,
        element,
    })
}

#[async_trait]
impl Provider for LocalFsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> ProviderStatus {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => match tokio::fs::read_dir(&self.root).await {
                Ok(_) => ProviderStatus::Ready,
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    ProviderStatus::Unauthorized
                }
                Err(_) => ProviderStatus::Connected,
            },
            Ok(_) => ProviderStatus::Connected,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                ProviderStatus::Unauthorized
            }
            Err(_) => ProviderStatus::Disconnected,
        }
    }

    async fn read_data(&self, path: &ElementPath) -> Result<ByteStream, ProviderError> {
        let file = tokio::fs::File::open(self.fs_path(path)).await?;
        Ok(Box::new(file))
    }

    async fn write_data(
        &self,
        path: &ElementPath,
        mut data: ByteStream,
    ) -> Result<u64, ProviderError> {
        if path.is_root() {
            return Err(PathError::Root.into());
        }
        let target = self.fs_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let written = match tokio::io::copy(&mut data, &mut file).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;
        Ok(written)
    }

    async fn create_folder(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        let target = self.fs_path(path);
        if let Ok(meta) = tokio::fs::metadata(&target).await {
            return Ok(if meta.is_dir() {
                ResultCode::Ok
            } else {
                ResultCode::Failed
            });
        }
        tokio::fs::create_dir_all(&target).await?;
        Ok(ResultCode::Ok)
    }

    async fn delete(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        if path.is_root() {
            return Ok(ResultCode::Failed);
        }
        let target = self.fs_path(path);
        let meta = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if is_absent(&err) => return Ok(ResultCode::ReadOnly),
            Err(err) => return Err(err.into()),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => Ok(ResultCode::Ok),
            Err(err) if is_absent(&err) => Ok(ResultCode::ReadOnly),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(ResultCode::ReadOnly),
            Err(err) => Err(err.into()),
        }
    }

    async fn move_element(
        &self,
        from: &ElementPath,
        to: &ElementPath,
    ) -> Result<ResultCode, ProviderError> {
        if from.is_root() || to.is_root() || from.is_ancestor_or_self(to) {
            return Ok(ResultCode::Failed);
        }
        let source = self.fs_path(from);
        let target = self.fs_path(to);
        if tokio::fs::symlink_metadata(&source).await.is_err()
            || tokio::fs::symlink_metadata(&target).await.is_ok()
        {
            return Ok(ResultCode::Failed);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(ResultCode::Ok)
    }

    async fn get_element(&self, path: &ElementPath) -> Result<Option<DataElement>, ProviderError> {
        match tokio::fs::symlink_metadata(self.fs_path(path)).await {
            Ok(meta) => Ok(Some(element_from_metadata(path.clone(), &meta))),
            Err(err) if is_absent(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_child_elements(
        &self,
        path: &ElementPath,
        recursive: bool,
    ) -> Result<Vec<DataElement>, ProviderError> {
        let mut out = Vec::new();
        let mut stack = vec![path.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(self.fs_path(&dir)).await {
                Ok(entries) => entries,
                Err(err) if is_absent(&err) => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                if is_partial(&entry_path) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = match dir.join(&name) {
                    Ok(child) => child,
                    Err(err) => {
                        debug!(path = %entry_path.display(), error = %err, "skipping entry");
                        continue;
                    }
                };
                let meta = entry.metadata().await?;
                let element = element_from_metadata(child.clone(), &meta);
                if recursive && element.is_folder() && child.depth() < MAX_PATH_DEPTH {
                    stack.push(child);
                }
                out.push(element);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn check_and_lock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        let mut locks = self.locks.lock().await;
        if locks.insert(path.clone()) {
            Ok(ResultCode::Ok)
        } else {
            Ok(ResultCode::Locked)
        }
    }

    async fn unlock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError> {
        let mut locks = self.locks.lock().await;
        if locks.remove(path) {
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
        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    for notification in map_event(&root, event) {
                        let _ = listener.send(notification);
                    }
                }
                Err(err) => warn!(error = %err, "filesystem watcher error"),
            }
        })?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.fs_path(path), mode)?;

        let mut next = self.next_subscription.lock().await;
        let id = *next;
        *next += 1;
        self.watchers.lock().await.insert(id, watcher);
        debug!(provider = %self.name, path = %path, id, "subscribed");
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProviderError> {
        self.watchers
            .lock()
            .await
            .remove(&id.0)
            .map(|_| ())
            .ok_or(ProviderError::UnknownSubscription(id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn path(value: &str) -> ElementPath {
        ElementPath::parse(value).unwrap()
    }

    #[test]
    fn maps_element_path_under_root() {
        let root = PathBuf::from("/data/a");
        assert_eq!(
            fs_path_for(&root, &path("/Docs/A.txt")),
            PathBuf::from("/data/a/Docs/A.txt")
        );
        assert_eq!(
            element_path_for(&root, Path::new("/data/a/Docs/A.txt")).unwrap(),
            path("/Docs/A.txt")
        );
    }

    #[test]
    fn partial_files_keep_original_extension() {
        assert_eq!(
            partial_path(Path::new("/r/a.txt")),
            PathBuf::from("/r/a.txt.twinsync-partial")
        );
        assert!(is_partial(Path::new("/r/a.txt.twinsync-partial")));
        assert!(!is_partial(Path::new("/r/notes.partial")));
    }

    #[test]
    fn maps_create_event_to_add() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.txt"), b"a").unwrap();
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![dir.path().join("A.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(dir.path(), event);
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].kind, NotificationKind::Add);
        assert_eq!(mapped[0].path, path("/A.txt"));
        assert_eq!(mapped[0].element.as_ref().unwrap().size, 1);
    }

    #[test]
    fn maps_rename_event_to_delete_and_add() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("B.txt"), b"b").unwrap();
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![dir.path().join("A.txt"), dir.path().join("B.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(dir.path(), event);
        let kinds: Vec<_> = mapped.iter().map(|n| (n.kind, n.path.to_string())).collect();
        assert_eq!(
            kinds,
            vec![
                (NotificationKind::Delete, "/A.txt".to_string()),
                (NotificationKind::Add, "/B.txt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn write_read_and_list_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let provider = LocalFsProvider::new("a", dir.path());
        let written = provider
            .write_data(
                &path("/docs/readme.txt"),
                Box::new(std::io::Cursor::new(b"hello".to_vec())),
            )
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert!(!dir.path().join("docs/readme.txt.twinsync-partial").exists());

        let mut data = Vec::new();
        provider
            .read_data(&path("/docs/readme.txt"))
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"hello");

        let children = provider
            .get_child_elements(&ElementPath::root(), true)
            .await
            .unwrap();
        let paths: Vec<_> = children.iter().map(|e| e.path.to_string()).collect();
        assert_eq!(paths, vec!["/docs", "/docs/readme.txt"]);
        assert!(children[0].is_folder());
        assert_eq!(children[0].modified, 0);
    }

    #[tokio::test]
    async fn delete_missing_is_read_only_and_move_refuses_existing_target() {
        let dir = tempdir().unwrap();
        let provider = LocalFsProvider::new("a", dir.path());
        assert_eq!(
            provider.delete(&path("/missing")).await.unwrap(),
            ResultCode::ReadOnly
        );
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        assert_eq!(
            provider
                .move_element(&path("/a.txt"), &path("/b.txt"))
                .await
                .unwrap(),
            ResultCode::Failed
        );
        assert_eq!(
            provider
                .move_element(&path("/a.txt"), &path("/moved/a.txt"))
                .await
                .unwrap(),
            ResultCode::Ok
        );
        assert!(dir.path().join("moved/a.txt").exists());
    }

    #[tokio::test]
    async fn user_partial_files_are_listed_and_in_flight_writes_are_not() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.partial"), b"n").unwrap();
        std::fs::write(dir.path().join("a.txt.twinsync-partial"), b"half").unwrap();
        let provider = LocalFsProvider::new("a", dir.path());

        let children = provider
            .get_child_elements(&ElementPath::root(), false)
            .await
            .unwrap();
        let paths: Vec<_> = children.iter().map(|e| e.path.to_string()).collect();
        assert_eq!(paths, vec!["/notes.partial"]);
    }

    #[tokio::test]
    async fn paths_below_a_file_are_absent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("t"), b"file now").unwrap();
        let provider = LocalFsProvider::new("a", dir.path());

        assert!(provider.get_element(&path("/t/c.txt")).await.unwrap().is_none());
        assert_eq!(
            provider.delete(&path("/t/c.txt")).await.unwrap(),
            ResultCode::ReadOnly
        );
        assert!(dir.path().join("t").is_file());
    }

    #[tokio::test]
    async fn missing_root_reports_disconnected() {
        let dir = tempdir().unwrap();
        let provider = LocalFsProvider::new("a", dir.path().join("absent"));
        assert_eq!(provider.status().await, ProviderStatus::Disconnected);
        let present = LocalFsProvider::new("b", dir.path());
        assert_eq!(present.status().await, ProviderStatus::Ready);
    }
}
