use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use twinsync_core::{LocalFsProvider, MemoryProvider, Provider, ProviderStatus};
use zbus::connection::Builder as ConnectionBuilder;

use crate::control::{ControlService, DBUS_OBJECT_PATH, DBUS_SERVICE_NAME};
use crate::sync::baseline::{BaselineStore, default_db_path};
use crate::sync::engine::Reconciler;
use crate::sync::job::Side;
use crate::sync::lifecycle::{Slot, SyncModule};
use crate::sync::queue::{JobQueue, QueueConfig};
use crate::sync::retry::RetryPolicy;
use crate::sync::scanner::Scanner;
use crate::sync::settings::SyncSettings;
use crate::sync::sides::Sides;
use crate::sync::transfer::TransferClient;
use crate::sync::worker::WorkerPool;

const DEFAULT_SIDE_A: &str = "~/TwinSync/A";
const DEFAULT_SIDE_B: &str = "~/TwinSync/B";
const DEFAULT_WORKERS: u64 = 10;
const DEFAULT_QUIET_WINDOW_MS: u64 = 5_000;
const DEFAULT_PROMOTE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_RETRIES: u64 = 5;
const DEFAULT_POLL_SECS: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub side_a: PathBuf,
    pub side_b: PathBuf,
    pub database: PathBuf,
    pub workers: usize,
    pub quiet_window: Duration,
    pub promote_interval: Duration,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub compare_content: bool,
    pub sync_delete: bool,
    pub sync_only_existing: bool,
    pub enable_dbus: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(&home, |name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(home: &Path, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_var = |name: &str, default: &str| {
            expand_with_home(&lookup(name).unwrap_or_else(|| default.to_string()), home)
        };
        let side_a = path_var("TWINSYNC_SIDE_A", DEFAULT_SIDE_A);
        let side_b = path_var("TWINSYNC_SIDE_B", DEFAULT_SIDE_B);
        let database = match lookup("TWINSYNC_DATABASE") {
            Some(value) => expand_with_home(&value, home),
            None => default_db_path().context("failed to resolve baseline database path")?,
        };

        let workers = read_u64_var(lookup("TWINSYNC_WORKERS"), DEFAULT_WORKERS);
        let max_retries = read_u64_var(lookup("TWINSYNC_MAX_RETRIES"), DEFAULT_MAX_RETRIES);
        Ok(Self {
            side_a,
            side_b,
            database,
            workers: usize::try_from(workers).unwrap_or(DEFAULT_WORKERS as usize),
            quiet_window: Duration::from_millis(read_u64_var(
                lookup("TWINSYNC_QUIET_WINDOW_MS"),
                DEFAULT_QUIET_WINDOW_MS,
            )),
            promote_interval: Duration::from_millis(read_u64_var(
                lookup("TWINSYNC_PROMOTE_INTERVAL_MS"),
                DEFAULT_PROMOTE_INTERVAL_MS,
            )),
            max_retries: u32::try_from(max_retries).unwrap_or(DEFAULT_MAX_RETRIES as u32),
            poll_interval: Duration::from_secs(read_u64_var(
                lookup("TWINSYNC_POLL_SECS"),
                DEFAULT_POLL_SECS,
            )),
            compare_content: read_bool_var(lookup("TWINSYNC_COMPARE_CONTENT"), true),
            sync_delete: read_bool_var(lookup("TWINSYNC_SYNC_DELETE"), true),
            sync_only_existing: read_bool_var(lookup("TWINSYNC_SYNC_ONLY_EXISTING"), false),
            enable_dbus: read_bool_var(lookup("TWINSYNC_ENABLE_DBUS"), true),
        })
    }

    fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            quiet_window: self.quiet_window,
            promote_interval: self.promote_interval,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    side_a: Arc<LocalFsProvider>,
    side_b: Arc<LocalFsProvider>,
    scratch: Arc<MemoryProvider>,
    baseline: BaselineStore,
    settings: Arc<SyncSettings>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        for root in [&config.side_a, &config.side_b] {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("failed to create side root at {root:?}"))?;
        }
        let baseline = BaselineStore::open(config.database.clone())
            .await
            .context("failed to initialize baseline store")?;
        let settings = Arc::new(SyncSettings::new(
            config.compare_content,
            config.sync_delete,
            config.sync_only_existing,
        ));

        Ok(Self {
            side_a: Arc::new(LocalFsProvider::new("side_a", config.side_a.clone())),
            side_b: Arc::new(LocalFsProvider::new("side_b", config.side_b.clone())),
            scratch: Arc::new(MemoryProvider::new("scratch")),
            baseline,
            settings,
            config,
        })
    }

    pub fn baseline(&self) -> &BaselineStore {
        &self.baseline
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            side_a = %self.config.side_a.display(),
            side_b = %self.config.side_b.display(),
            workers = self.config.workers,
            "daemon started"
        );

        let (queue, queue_handle) = JobQueue::spawn(self.config.queue_config());
        let sides = Sides::new(self.side_a.clone(), self.side_b.clone());
        let scanner = Scanner::new(sides.clone(), self.baseline.clone(), queue.clone());
        let engine = Arc::new(Reconciler::new(
            sides.clone(),
            self.baseline.clone(),
            TransferClient::new(self.scratch.clone()),
            scanner.clone(),
            Arc::clone(&self.settings),
        ));
        let pool = WorkerPool::new(
            queue.clone(),
            engine,
            RetryPolicy::new(self.config.max_retries),
        );
        let mut module = SyncModule::new(sides, scanner, pool, self.config.workers);

        let _dbus_connection = if self.config.enable_dbus {
            let service = ControlService::new(
                Arc::clone(&self.settings),
                queue.clone(),
                module.subscribe_run_state(),
            );
            match serve_control(service).await {
                Ok(connection) => Some(connection),
                Err(err) => {
                    warn!("control interface unavailable: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        let slots: [(Slot, Arc<dyn Provider>); 3] = [
            (Slot::Side(Side::A), self.side_a.clone() as Arc<dyn Provider>),
            (Slot::Side(Side::B), self.side_b.clone() as Arc<dyn Provider>),
            (Slot::Scratch, self.scratch.clone() as Arc<dyn Provider>),
        ];
        let mut known: [Option<ProviderStatus>; 3] = [None; 3];
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    for ((slot, provider), last) in slots.iter().zip(known.iter_mut()) {
                        let status = provider.status().await;
                        if *last != Some(status) {
                            log_status(provider.name(), status);
                            *last = Some(status);
                        }
                        module.set_state(*slot, status.into()).await;
                    }
                }
            }
        }

        module.shutdown().await;
        queue_handle.abort();
        Ok(())
    }
}

/// Drops every baseline so the next start re-propagates both trees.
pub async fn reset_baseline(config: &DaemonConfig) -> anyhow::Result<()> {
    let baseline = BaselineStore::open(config.database.clone())
        .await
        .context("failed to open baseline store")?;
    baseline
        .clear()
        .await
        .context("failed to clear baseline store")?;
    info!(database = %config.database.display(), "baseline cleared");
    Ok(())
}

async fn serve_control(service: ControlService) -> anyhow::Result<zbus::Connection> {
    ConnectionBuilder::session()?
        .name(DBUS_SERVICE_NAME)?
        .serve_at(DBUS_OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to start D-Bus object server")
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
