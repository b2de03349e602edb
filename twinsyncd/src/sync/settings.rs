use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime-tunable policies, shared by the reconciler and the control interface.
#[derive(Debug)]
pub struct SyncSettings {
    compare_content: AtomicBool,
    sync_delete: AtomicBool,
    sync_only_existing_on_secondary: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    CompareContent,
    SyncDelete,
    SyncOnlyExistingOnSecondary,
}

impl Setting {
    pub const ALL: [Setting; 3] = [
        Setting::CompareContent,
        Setting::SyncDelete,
        Setting::SyncOnlyExistingOnSecondary,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Setting::CompareContent => "compare_content",
            Setting::SyncDelete => "sync_delete",
            Setting::SyncOnlyExistingOnSecondary => "sync_only_existing_on_secondary",
        }
    }

    pub fn parse(name: &str) -> Option<Setting> {
        Setting::ALL
            .into_iter()
            .find(|setting| setting.name() == name.trim())
    }
}

impl SyncSettings {
    pub fn new(compare_content: bool, sync_delete: bool, sync_only_existing: bool) -> Self {
        Self {
            compare_content: AtomicBool::new(compare_content),
            sync_delete: AtomicBool::new(sync_delete),
            sync_only_existing_on_secondary: AtomicBool::new(sync_only_existing),
        }
    }

    pub fn compare_content(&self) -> bool {
        self.get(Setting::CompareContent)
    }

    pub fn sync_delete(&self) -> bool {
        self.get(Setting::SyncDelete)
    }

    pub fn sync_only_existing_on_secondary(&self) -> bool {
        self.get(Setting::SyncOnlyExistingOnSecondary)
    }

    pub fn get(&self, setting: Setting) -> bool {
        self.flag(setting).load(Ordering::SeqCst)
    }

    pub fn set(&self, setting: Setting, value: bool) {
        self.flag(setting).store(value, Ordering::SeqCst);
    }

    fn flag(&self, setting: Setting) -> &AtomicBool {
        match setting {
            Setting::CompareContent => &self.compare_content,
            Setting::SyncDelete => &self.sync_delete,
            Setting::SyncOnlyExistingOnSecondary => &self.sync_only_existing_on_secondary,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new(true, true, false)
    }
}
