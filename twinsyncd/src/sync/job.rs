use std::fmt;

use tokio::time::Instant;
use twinsync_core::{DataElement, ElementPath, Notification, NotificationKind};

/// One of the two peer trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Baseline store domain owned by this side.
    pub fn domain(self) -> &'static str {
        match self {
            Side::A => "side_a",
            Side::B => "side_b",
        }
    }

    /// Side B is the secondary side for the "only existing" policy.
    pub fn is_secondary(self) -> bool {
        self == Side::B
    }

    pub fn parse(value: &str) -> Option<Side> {
        match value.trim().to_ascii_lowercase().as_str() {
            "a" | "side_a" => Some(Side::A),
            "b" | "side_b" => Some(Side::B),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Add,
    Delete,
    Modify,
    Init,
    ForceTransfer,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Add => "add",
            JobKind::Delete => "delete",
            JobKind::Modify => "modify",
            JobKind::Init => "init",
            JobKind::ForceTransfer => "force_transfer",
        }
    }
}

impl From<NotificationKind> for JobKind {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Add => JobKind::Add,
            NotificationKind::Delete => JobKind::Delete,
            NotificationKind::Modify => JobKind::Modify,
        }
    }
}

/// Unit of work for the reconciler: "bring `path` from `source` to the other side".
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub source: Side,
    pub path: ElementPath,
    /// Source element as last seen; `None` for deletes.
    pub element: Option<DataElement>,
    pub kind: JobKind,
    pub from_notification: bool,
    pub retry_count: u32,
    pub postpone_count: u32,
    pub ready_at: Option<Instant>,
    /// First-submission order, assigned by the queue and kept across requeues.
    pub seq: Option<u64>,
}

impl SyncJob {
    pub fn new(source: Side, path: ElementPath, kind: JobKind) -> Self {
        Self {
            source,
            path,
            element: None,
            kind,
            from_notification: false,
            retry_count: 0,
            postpone_count: 0,
            ready_at: None,
            seq: None,
        }
    }

    pub fn init(source: Side, element: DataElement) -> Self {
        let mut job = Self::new(source, element.path.clone(), JobKind::Init);
        job.element = Some(element);
        job
    }

    pub fn force_transfer(source: Side, path: ElementPath) -> Self {
        Self::new(source, path, JobKind::ForceTransfer)
    }

    pub fn from_notification(source: Side, notification: Notification) -> Self {
        let mut job = Self::new(source, notification.path, notification.kind.into());
        job.element = notification.element;
        job.from_notification = true;
        job
    }

    pub fn is_forced(&self) -> bool {
        self.kind == JobKind::ForceTransfer
    }

    /// Dedup key: two jobs with the same source and path are interchangeable.
    pub fn is_equivalent(&self, other: &SyncJob) -> bool {
        self.source == other.source && self.path == other.path
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }
}

impl fmt::Display for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} from {}", self.kind.as_str(), self.path, self.source)
    }
}

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Done,
    Retry,
    Postpone,
    Invalid,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOutcome::Done => "done",
            SyncOutcome::Retry => "retry",
            SyncOutcome::Postpone => "postpone",
            SyncOutcome::Invalid => "invalid",
        }
    }
}
