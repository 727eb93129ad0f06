//! Per-device backup workflow.
//!
//! Each device walks `Authenticating -> Exporting -> Extracting -> Placing ->
//! Retaining -> Notifying -> Done`. Any failing step jumps to `Failed`, sends
//! a failure notification and the run moves on to the next device. Nothing
//! is retried within a run.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceRecord, StorageConfig};
use crate::credentials::CredentialProvider;
use crate::error::BackupError;
use crate::fetch::{self, Exporter};
use crate::notify::{self, Notifier};
use crate::{inspect, placement, retention};

/// Where a device's iteration ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authenticating,
    Exporting,
    Extracting,
    Placing,
    Retaining,
    Notifying,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Authenticating => "authenticating",
            Stage::Exporting => "exporting",
            Stage::Extracting => "extracting",
            Stage::Placing => "placing",
            Stage::Retaining => "retaining",
            Stage::Notifying => "notifying",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of backing up one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    pub address: String,
    pub stage: Stage,
    /// Step that failed, when `stage` is `Failed`.
    pub failed_at: Option<Stage>,
    pub hostname: Option<String>,
    pub path: Option<PathBuf>,
    /// Naming fell back to the address because extraction failed.
    pub hostname_fallback: bool,
    pub pruned: usize,
    pub error: Option<String>,
}

impl DeviceOutcome {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            stage: Stage::Authenticating,
            failed_at: None,
            hostname: None,
            path: None,
            hostname_fallback: false,
            pruned: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.stage == Stage::Done
    }
}

/// Everything that happened in one run, in device order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<DeviceOutcome>,
    /// Report of the end-of-run pass when retention is not per device.
    pub retention: Option<retention::RetentionReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// What the orchestrator needs to know about the filesystem.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub backup_dir: PathBuf,
    pub work_dir: PathBuf,
    pub retention_cap: usize,
    pub retention_per_device: bool,
}

impl From<&StorageConfig> for RunSettings {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            backup_dir: cfg.directory.clone(),
            work_dir: cfg.work_dir().to_path_buf(),
            retention_cap: cfg.retention_cap,
            retention_per_device: cfg.retention_per_device,
        }
    }
}

type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Drives backups for a list of devices.
pub struct Orchestrator {
    settings: RunSettings,
    credentials: Arc<dyn CredentialProvider>,
    exporter: Arc<dyn Exporter>,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        credentials: Arc<dyn CredentialProvider>,
        exporter: Arc<dyn Exporter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            credentials,
            exporter,
            notifier,
            clock: Arc::new(|| Local::now().naive_local()),
        }
    }

    /// Replace the wall clock used for file names.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Back up every device in order. Never fails as a whole.
    pub async fn run(&self, devices: &[DeviceRecord]) -> RunSummary {
        info!(devices = devices.len(), dir = %self.settings.backup_dir.display(), "starting backup run");

        let mut summary = RunSummary::default();
        for device in devices {
            info!(device = %device.address, "exporting device state");
            let outcome = self.backup_device(device).await;
            summary.outcomes.push(outcome);
        }

        if !self.settings.retention_per_device && summary.succeeded() > 0 {
            match self.retain().await {
                Ok(report) => summary.retention = Some(report),
                Err(e) => {
                    error!(error = %e, "end-of-run retention failed");
                    notify::dispatch(&*self.notifier, &format!("Backup retention failed. Error: {e}"))
                        .await;
                }
            }
        }

        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "backup run finished"
        );
        summary
    }

    /// Run one device through the stage machine.
    pub async fn backup_device(&self, device: &DeviceRecord) -> DeviceOutcome {
        let mut outcome = DeviceOutcome::new(&device.address);

        match self.drive(device, &mut outcome).await {
            Ok(message) => {
                outcome.stage = Stage::Notifying;
                notify::dispatch(&*self.notifier, &message).await;
                outcome.stage = Stage::Done;
                info!(device = %device.address, hostname = ?outcome.hostname, "backup successful");
            }
            Err(e) => {
                error!(device = %device.address, stage = %outcome.stage, error = %e, "backup failed");
                outcome.failed_at = Some(outcome.stage);
                outcome.stage = Stage::Failed;
                outcome.error = Some(e.to_string());
                let message = format!("Backup failed for firewall {}. Error: {}", device.address, e);
                notify::dispatch(&*self.notifier, &message).await;
            }
        }
        outcome
    }

    /// Steps up to and including retention. Returns the success message.
    async fn drive(
        &self,
        device: &DeviceRecord,
        outcome: &mut DeviceOutcome,
    ) -> Result<String, BackupError> {
        let address = device.address.as_str();

        outcome.stage = Stage::Authenticating;
        debug!(device = %address, stage = %outcome.stage, "stage");
        let token = self.credentials.token(device).await?;

        outcome.stage = Stage::Exporting;
        debug!(device = %address, stage = %outcome.stage, "stage");
        let bytes = self.exporter.export(address, &token).await?;
        let fetched_at = (self.clock)();
        let artifact = blocking(Stage::Exporting, {
            let work_dir = self.settings.work_dir.clone();
            let address = address.to_string();
            move || fetch::write_working_artifact(&work_dir, &address, &bytes, fetched_at)
        })
        .await?;

        outcome.stage = Stage::Extracting;
        debug!(device = %address, stage = %outcome.stage, "stage");
        let (hostname, extraction) = blocking(Stage::Extracting, {
            let path = artifact.path.clone();
            let address = address.to_string();
            move || Ok(inspect::resolve_hostname(&path, &address))
        })
        .await?;
        outcome.hostname_fallback = extraction.is_some();
        outcome.hostname = Some(hostname.clone());

        outcome.stage = Stage::Placing;
        debug!(device = %address, stage = %outcome.stage, "stage");
        let placed = blocking(Stage::Placing, {
            let from = artifact.path.clone();
            let dir = self.settings.backup_dir.clone();
            let hostname = hostname.clone();
            move || placement::place(&from, &dir, &hostname, fetched_at.date())
        })
        .await?;
        outcome.path = Some(placed);

        let mut message = format!("Backup successful for {hostname}");
        if self.settings.retention_per_device {
            outcome.stage = Stage::Retaining;
            debug!(device = %address, stage = %outcome.stage, "stage");
            let report = self.retain().await?;
            outcome.pruned = report.deleted.len();
            if outcome.pruned > 0 {
                message.push_str(&format!(". Removed {} old backup(s).", outcome.pruned));
            }
        }
        Ok(message)
    }

    async fn retain(&self) -> Result<retention::RetentionReport, BackupError> {
        let dir = self.settings.backup_dir.clone();
        let cap = self.settings.retention_cap;
        blocking(Stage::Retaining, move || retention::enforce(&dir, cap)).await
    }
}

/// Run filesystem work off the async executor.
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(join) => {
            warn!(%stage, error = %join, "blocking task did not complete");
            Err(BackupError::Interrupted {
                task: stage.to_string(),
                detail: join.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StoredKeys;
    use crate::inspect::tests::{running_config, tgz};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    /// Serves canned archives by address; unknown addresses fail.
    struct FakeExporter(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl Exporter for FakeExporter {
        async fn export(&self, address: &str, _token: &str) -> Result<Vec<u8>, BackupError> {
            self.0
                .get(address)
                .cloned()
                .ok_or_else(|| BackupError::transport(address, "connection refused"))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, message: &str) -> Result<(), BackupError> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn send(&self, _message: &str) -> Result<(), BackupError> {
            Err(BackupError::Notification {
                channel: "ops".to_string(),
                detail: "HTTP 500".to_string(),
            })
        }
    }

    fn clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap()
    }

    fn settings(dir: &Path) -> RunSettings {
        RunSettings {
            backup_dir: dir.to_path_buf(),
            work_dir: dir.to_path_buf(),
            retention_cap: 7,
            retention_per_device: true,
        }
    }

    fn orchestrator(
        dir: &Path,
        archives: &[(&str, Vec<u8>)],
        notifier: Arc<dyn Notifier>,
    ) -> Orchestrator {
        let map = archives
            .iter()
            .map(|(a, b)| (a.to_string(), b.clone()))
            .collect();
        Orchestrator::new(
            settings(dir),
            Arc::new(StoredKeys),
            Arc::new(FakeExporter(map)),
            notifier,
        )
        .with_clock(clock)
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut v: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        v.sort();
        v
    }

    #[tokio::test]
    async fn test_success_names_by_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tgz(&[("running-config.xml", running_config("edge-fw01").as_str())]);
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(dir.path(), &[("10.0.0.5", archive)], recorder.clone());

        let summary = orch.run(&[DeviceRecord::new("10.0.0.5", "KEY")]).await;

        assert_eq!(summary.succeeded(), 1);
        let outcome = &summary.outcomes[0];
        assert_eq!(outcome.stage, Stage::Done);
        assert_eq!(outcome.hostname.as_deref(), Some("edge-fw01"));
        assert!(!outcome.hostname_fallback);
        assert_eq!(listing(dir.path()), ["edge-fw01_03092024.tgz"]);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            ["Backup successful for edge-fw01"]
        );
    }

    #[tokio::test]
    async fn test_missing_config_falls_back_to_address_and_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tgz(&[("license.xml", "<licenses/>")]);
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(dir.path(), &[("10.0.0.5", archive)], recorder.clone());

        let summary = orch.run(&[DeviceRecord::new("10.0.0.5", "KEY")]).await;

        assert_eq!(summary.succeeded(), 1);
        assert!(summary.outcomes[0].hostname_fallback);
        assert_eq!(listing(dir.path()), ["10.0.0.5_03092024.tgz"]);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            ["Backup successful for 10.0.0.5"]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good = tgz(&[("running-config.xml", running_config("fw-b").as_str())]);
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(dir.path(), &[("10.0.0.2", good)], recorder.clone());

        let summary = orch
            .run(&[
                DeviceRecord::new("10.0.0.1", "KEY"),
                DeviceRecord::new("10.0.0.2", "KEY"),
            ])
            .await;

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.succeeded(), 1);
        let failed = &summary.outcomes[0];
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.failed_at, Some(Stage::Exporting));
        assert!(failed.path.is_none());
        assert_eq!(listing(dir.path()), ["fw-b_03092024.tgz"]);

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("Backup failed for firewall 10.0.0.1. Error: "));
        assert!(sent[0].contains("connection refused"));
        assert_eq!(sent[1], "Backup successful for fw-b");
    }

    #[tokio::test]
    async fn test_missing_key_fails_at_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(dir.path(), &[], recorder.clone());

        let outcome = orch.backup_device(&DeviceRecord::new("10.0.0.9", "")).await;
        assert_eq!(outcome.failed_at, Some(Stage::Authenticating));
        assert!(listing(dir.path()).is_empty());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_day_rerun_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tgz(&[("running-config.xml", running_config("edge-fw01").as_str())]);
        let orch = orchestrator(
            dir.path(),
            &[("10.0.0.5", archive)],
            Arc::new(Recorder::default()),
        );
        let devices = [DeviceRecord::new("10.0.0.5", "KEY")];

        orch.run(&devices).await;
        orch.run(&devices).await;
        assert_eq!(listing(dir.path()), ["edge-fw01_03092024.tgz"]);
    }

    #[tokio::test]
    async fn test_retention_caps_directory_and_reports_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..7 {
            std::fs::write(dir.path().join(format!("old{i}_01012024.tgz")), b"x").unwrap();
        }
        // Make sure the new backup is strictly the newest.
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let f = std::fs::File::options()
                .write(true)
                .open(entry.unwrap().path())
                .unwrap();
            f.set_modified(past).unwrap();
        }

        let archive = tgz(&[("running-config.xml", running_config("edge-fw01").as_str())]);
        let recorder = Arc::new(Recorder::default());
        let orch = orchestrator(dir.path(), &[("10.0.0.5", archive)], recorder.clone());
        let summary = orch.run(&[DeviceRecord::new("10.0.0.5", "KEY")]).await;

        assert_eq!(summary.outcomes[0].pruned, 1);
        let files = listing(dir.path());
        assert_eq!(files.len(), 7);
        assert!(files.contains(&"edge-fw01_03092024.tgz".to_string()));
        assert_eq!(
            recorder.0.lock().unwrap()[0],
            "Backup successful for edge-fw01. Removed 1 old backup(s)."
        );
    }

    #[tokio::test]
    async fn test_end_of_run_retention() {
        let dir = tempfile::tempdir().unwrap();
        let archives: Vec<(String, Vec<u8>)> = (0..9)
            .map(|i| {
                let host = format!("fw{i}");
                (format!("10.0.0.{i}"), tgz(&[("running-config.xml", running_config(&host).as_str())]))
            })
            .collect();
        let refs: Vec<(&str, Vec<u8>)> = archives.iter().map(|(a, b)| (a.as_str(), b.clone())).collect();
        let mut orch = orchestrator(dir.path(), &refs, Arc::new(Recorder::default()));
        orch.settings.retention_per_device = false;

        let devices: Vec<_> = archives
            .iter()
            .map(|(a, _)| DeviceRecord::new(a.clone(), "KEY"))
            .collect();
        let summary = orch.run(&devices).await;

        assert_eq!(summary.succeeded(), 9);
        assert!(summary.outcomes.iter().all(|o| o.pruned == 0));
        assert_eq!(summary.retention.as_ref().map(|r| r.deleted.len()), Some(2));
        assert_eq!(listing(dir.path()).len(), 7);
    }

    #[tokio::test]
    async fn test_panicking_step_reports_its_stage() {
        let result = blocking(Stage::Extracting, || -> Result<(), BackupError> {
            panic!("corrupt archive")
        })
        .await;
        match result {
            Err(BackupError::Interrupted { task, .. }) => assert_eq!(task, "extracting"),
            other => panic!("expected Interrupted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notification_failure_never_fails_backup() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tgz(&[("running-config.xml", running_config("edge-fw01").as_str())]);
        let orch = orchestrator(dir.path(), &[("10.0.0.5", archive)], Arc::new(Broken));

        let summary = orch
            .run(&[
                DeviceRecord::new("10.0.0.5", "KEY"),
                DeviceRecord::new("10.0.0.6", "KEY"),
            ])
            .await;
        assert_eq!(summary.outcomes[0].stage, Stage::Done);
        assert_eq!(summary.outcomes[1].stage, Stage::Failed);
    }
}
