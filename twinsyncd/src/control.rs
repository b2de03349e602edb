use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use twinsync_core::ElementPath;
use zbus::interface;

use crate::sync::job::{Side, SyncJob};
use crate::sync::lifecycle::RunState;
use crate::sync::queue::JobQueue;
use crate::sync::settings::{Setting, SyncSettings};

pub const DBUS_SERVICE_NAME: &str = "io.twinsync.Daemon";
pub const DBUS_OBJECT_PATH: &str = "/io/twinsync/Sync1";

pub const DBUS_ERROR_UNKNOWN_PROPERTY: &str = "io.twinsync.Error.UnknownProperty";
pub const DBUS_ERROR_INVALID_VALUE: &str = "io.twinsync.Error.InvalidValue";
pub const DBUS_ERROR_INVALID_PATH: &str = "io.twinsync.Error.InvalidPath";
pub const DBUS_ERROR_INVALID_SIDE: &str = "io.twinsync.Error.InvalidSide";
pub const DBUS_ERROR_FAILED: &str = "io.twinsync.Error.Failed";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown property: {0}")]
    UnknownProperty(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid side: {0}")]
    InvalidSide(String),
    #[error("operation failed")]
    Failed,
}

pub fn dbus_error_name(err: &ControlError) -> &'static str {
    match err {
        ControlError::UnknownProperty(_) => DBUS_ERROR_UNKNOWN_PROPERTY,
        ControlError::InvalidValue(_) => DBUS_ERROR_INVALID_VALUE,
        ControlError::InvalidPath(_) => DBUS_ERROR_INVALID_PATH,
        ControlError::InvalidSide(_) => DBUS_ERROR_INVALID_SIDE,
        ControlError::Failed => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: ControlError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

fn parse_setting(name: &str) -> Result<Setting, ControlError> {
    Setting::parse(name).ok_or_else(|| ControlError::UnknownProperty(name.to_string()))
}

fn parse_flag(value: &str) -> Result<bool, ControlError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ControlError::InvalidValue(value.to_string())),
    }
}

/// Session-bus surface for tuning policies and poking the queue.
pub struct ControlService {
    settings: Arc<SyncSettings>,
    queue: JobQueue,
    run_state: watch::Receiver<RunState>,
}

impl ControlService {
    pub fn new(
        settings: Arc<SyncSettings>,
        queue: JobQueue,
        run_state: watch::Receiver<RunState>,
    ) -> Self {
        Self {
            settings,
            queue,
            run_state,
        }
    }
}

#[interface(name = "io.twinsync.Sync1")]
impl ControlService {
    async fn get_property(&self, name: &str) -> zbus::fdo::Result<String> {
        let setting = parse_setting(name).map_err(map_to_fdo)?;
        Ok(self.settings.get(setting).to_string())
    }

    async fn set_property(&self, name: &str, value: &str) -> zbus::fdo::Result<()> {
        let setting = parse_setting(name).map_err(map_to_fdo)?;
        let flag = parse_flag(value).map_err(map_to_fdo)?;
        self.settings.set(setting, flag);
        info!(property = setting.name(), value = flag, "property updated");
        Ok(())
    }

    async fn list_properties(&self) -> zbus::fdo::Result<Vec<(String, String)>> {
        Ok(Setting::ALL
            .into_iter()
            .map(|setting| {
                (
                    setting.name().to_string(),
                    self.settings.get(setting).to_string(),
                )
            })
            .collect())
    }

    async fn get_status(&self) -> zbus::fdo::Result<(String, String)> {
        let state = *self.run_state.borrow();
        let stats = self
            .queue
            .stats()
            .await
            .map_err(|_| map_to_fdo(ControlError::Failed))?;
        Ok((state.as_str().to_string(), stats.to_string()))
    }

    async fn force_transfer(&self, side: &str, path: &str) -> zbus::fdo::Result<()> {
        let source = Side::parse(side)
            .ok_or_else(|| ControlError::InvalidSide(side.to_string()))
            .map_err(map_to_fdo)?;
        let path = ElementPath::parse(path)
            .ok()
            .filter(|path| !path.is_root())
            .ok_or_else(|| ControlError::InvalidPath(path.to_string()))
            .map_err(map_to_fdo)?;
        info!(side = %source, path = %path, "forced transfer requested");
        self.queue
            .submit(SyncJob::force_transfer(source, path))
            .await
            .map_err(|_| map_to_fdo(ControlError::Failed))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sync::queue::QueueConfig;

    fn service() -> (ControlService, JobQueue, watch::Sender<RunState>) {
        let (queue, _handle) = JobQueue::spawn(QueueConfig {
            quiet_window: Duration::from_secs(60),
            promote_interval: Duration::from_secs(60),
        });
        let (run_tx, run_rx) = watch::channel(RunState::Stopped);
        let service = ControlService::new(Arc::new(SyncSettings::default()), queue.clone(), run_rx);
        (service, queue, run_tx)
    }

    fn error_message(err: zbus::fdo::Error) -> String {
        match err {
            zbus::fdo::Error::Failed(msg) => msg,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn maps_errors_to_stable_dbus_names() {
        assert_eq!(
            dbus_error_name(&ControlError::UnknownProperty("x".into())),
            DBUS_ERROR_UNKNOWN_PROPERTY
        );
        assert_eq!(
            dbus_error_name(&ControlError::InvalidValue("x".into())),
            DBUS_ERROR_INVALID_VALUE
        );
        assert_eq!(dbus_error_name(&ControlError::Failed), DBUS_ERROR_FAILED);
    }

    #[tokio::test]
    async fn properties_round_trip_through_settings() {
        let (service, _queue, _run_tx) = service();
        assert_eq!(service.get_property("sync_delete").await.unwrap(), "true");

        service.set_property("sync_delete", "false").await.unwrap();
        assert_eq!(service.get_property("sync_delete").await.unwrap(), "false");

        let listed = service.list_properties().await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&("sync_delete".to_string(), "false".to_string())));
        assert!(listed.contains(&("compare_content".to_string(), "true".to_string())));
    }

    #[tokio::test]
    async fn rejects_unknown_property_and_bad_value() {
        let (service, _queue, _run_tx) = service();
        let err = service.get_property("speed").await.expect_err("unknown");
        assert!(error_message(err).contains(DBUS_ERROR_UNKNOWN_PROPERTY));

        let err = service
            .set_property("compare_content", "maybe")
            .await
            .expect_err("bad value");
        assert!(error_message(err).contains(DBUS_ERROR_INVALID_VALUE));
    }

    #[tokio::test]
    async fn status_reports_run_state_and_counters() {
        let (service, _queue, run_tx) = service();
        let (state, counters) = service.get_status().await.unwrap();
        assert_eq!(state, "stopped");
        assert_eq!(counters, "delayed=0 ready=0 held=0 active=0");

        run_tx.send_replace(RunState::Running);
        let (state, _) = service.get_status().await.unwrap();
        assert_eq!(state, "running");
    }

    #[tokio::test]
    async fn force_transfer_submits_a_job() {
        let (service, queue, _run_tx) = service();
        service.force_transfer("a", "/docs/x.txt").await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.delayed + stats.ready, 1);

        let err = service.force_transfer("c", "/x").await.expect_err("side");
        assert!(error_message(err).contains(DBUS_ERROR_INVALID_SIDE));
        let err = service.force_transfer("b", "/").await.expect_err("root");
        assert!(error_message(err).contains(DBUS_ERROR_INVALID_PATH));
    }
}
