use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::element::{DataElement, ElementPath};
use crate::error::ProviderError;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome of a mutating or locking call that reached the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    /// Target is read-only or already absent.
    ReadOnly,
    /// Advisory lock is held by somebody else.
    Locked,
    Unsupported,
    Failed,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }

    /// Deletes accept "already gone" as success.
    pub fn is_delete_success(self) -> bool {
        matches!(self, ResultCode::Ok | ResultCode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "ok",
            ResultCode::ReadOnly => "read_only",
            ResultCode::Locked => "locked",
            ResultCode::Unsupported => "unsupported",
            ResultCode::Failed => "failed",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Disconnected,
    /// Reachable but not serving data yet.
    Connected,
    Ready,
    /// Reachable but access was refused.
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Add,
    Delete,
    Modify,
}

/// Change event pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub path: ElementPath,
    /// Element as read when the event was emitted; `None` for deletes.
    pub element: Option<DataElement>,
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Port connector to one data tree.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> ProviderStatus {
        ProviderStatus::Ready
    }

    /// `false` when reads and writes cannot be streamed into another provider directly.
    fn supports_direct_transfer(&self) -> bool {
        true
    }

    async fn read_data(&self, path: &ElementPath) -> Result<ByteStream, ProviderError>;

    /// Replaces the file at `path`, creating missing ancestor folders. Returns bytes written.
    async fn write_data(&self, path: &ElementPath, data: ByteStream) -> Result<u64, ProviderError>;

    async fn create_folder(&self, path: &ElementPath) -> Result<ResultCode, ProviderError>;

    async fn delete(&self, path: &ElementPath) -> Result<ResultCode, ProviderError>;

    async fn move_element(
        &self,
        from: &ElementPath,
        to: &ElementPath,
    ) -> Result<ResultCode, ProviderError>;

    async fn get_element(&self, path: &ElementPath) -> Result<Option<DataElement>, ProviderError>;

    async fn get_child_elements(
        &self,
        path: &ElementPath,
        recursive: bool,
    ) -> Result<Vec<DataElement>, ProviderError>;

    async fn check_and_lock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError>;

    async fn unlock(&self, path: &ElementPath) -> Result<ResultCode, ProviderError>;

    async fn subscribe(
        &self,
        path: &ElementPath,
        recursive: bool,
        listener: NotificationSender,
    ) -> Result<SubscriptionId, ProviderError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ProviderError>;
}

/// `true` if a subscription on `root` should see an event on `path`.
pub fn subscription_covers(root: &ElementPath, recursive: bool, path: &ElementPath) -> bool {
    if recursive {
        return root.is_ancestor_or_self(path);
    }
    path == root || path.parent().as_ref() == Some(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_success_accepts_read_only() {
        assert!(ResultCode::Ok.is_delete_success());
        assert!(ResultCode::ReadOnly.is_delete_success());
        assert!(!ResultCode::Failed.is_delete_success());
        assert!(!ResultCode::ReadOnly.is_ok());
    }

    #[test]
    fn non_recursive_subscription_sees_direct_children_only() {
        let root = ElementPath::parse("/docs").unwrap();
        let child = ElementPath::parse("/docs/a.txt").unwrap();
        let grandchild = ElementPath::parse("/docs/sub/a.txt").unwrap();
        assert!(subscription_covers(&root, false, &child));
        assert!(!subscription_covers(&root, false, &grandchild));
        assert!(subscription_covers(&root, true, &grandchild));
        assert!(!subscription_covers(
            &root,
            true,
            &ElementPath::parse("/other").unwrap()
        ));
    }
}
