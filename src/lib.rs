//! fwbackup -- Unattended configuration backup for network firewall appliances.
//!
//! This crate exports each configured firewall's device-state archive over
//! the appliance XML API, names it after the hostname found inside, keeps a
//! fixed number of backups on disk and reports the outcome to a pub/sub topic.

pub mod config;
pub mod credentials;
pub mod error;
pub mod fetch;
pub mod inspect;
pub mod notify;
pub mod orchestrator;
pub mod placement;
pub mod retention;

use std::sync::Arc;

use anyhow::Result;

use crate::config::BackupConfig;
use crate::orchestrator::{Orchestrator, RunSettings, RunSummary};

/// Build the production orchestrator from configuration.
pub fn orchestrator(config: &BackupConfig) -> Result<Orchestrator> {
    config.validate()?;
    let client = config.http.client()?;
    let exporter = fetch::HttpExporter::new(client, config.http.scheme.clone());
    let notifier = notify::TopicNotifier::new(&config.notify)?;

    Ok(Orchestrator::new(
        RunSettings::from(&config.backup),
        Arc::new(credentials::StoredKeys),
        Arc::new(exporter),
        Arc::new(notifier),
    ))
}

/// Back up every configured device.
pub async fn run(config: &BackupConfig) -> Result<RunSummary> {
    if config.devices.is_empty() {
        tracing::warn!("no devices configured; add one with `fwbackup add-device`");
        return Ok(RunSummary::default());
    }
    let orchestrator = orchestrator(config)?;
    Ok(orchestrator.run(&config.devices).await)
}
