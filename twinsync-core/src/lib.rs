mod element;
mod error;
mod local;
mod memory;
mod provider;

pub use element::{
    DataElement, ElementPath, ElementType, MAX_PATH_DEPTH, PathError, same_snapshot,
};
pub use error::ProviderError;
pub use local::{LocalFsProvider, element_path_for, fs_path_for};
pub use memory::MemoryProvider;
pub use provider::{
    ByteStream, Notification, NotificationKind, NotificationSender, Provider, ProviderStatus,
    ResultCode, SubscriptionId, subscription_covers,
};
