//! API key acquisition and the credential seam used by the orchestrator.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::DeviceRecord;
use crate::error::BackupError;

/// Supplies the API token for a device.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self, device: &DeviceRecord) -> Result<String, BackupError>;
}

/// Uses the API key stored alongside each device in the configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredKeys;

#[async_trait]
impl CredentialProvider for StoredKeys {
    async fn token(&self, device: &DeviceRecord) -> Result<String, BackupError> {
        let key = device.api_key.trim();
        if key.is_empty() {
            return Err(BackupError::auth(&device.address, "no API key configured"));
        }
        Ok(key.to_string())
    }
}

/// Exchange a username and password for an API key.
///
/// `base_url` is the appliance root, e.g. `https://10.0.0.5`. `address` is
/// only used to label errors.
pub async fn keygen(
    client: &Client,
    base_url: &str,
    address: &str,
    user: &str,
    password: &str,
) -> Result<String, BackupError> {
    let url = format!("{}/api/?type=keygen", base_url.trim_end_matches('/'));
    info!(device = %address, %user, "requesting API key");

    let response = client
        .post(&url)
        .form(&[("user", user), ("password", password)])
        .send()
        .await
        .map_err(|e| BackupError::transport(address, e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BackupError::transport(address, e))?;

    if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(BackupError::auth(address, format!("HTTP {status}")));
    }
    if !status.is_success() {
        return Err(BackupError::transport(address, format!("HTTP {status}")));
    }

    let key = parse_keygen_response(address, &body)?;
    debug!(device = %address, "API key issued");
    Ok(key)
}

/// Pull `response/result/key` out of a keygen reply.
pub fn parse_keygen_response(address: &str, body: &str) -> Result<String, BackupError> {
    let doc = roxmltree::Document::parse(body).map_err(|e| {
        BackupError::transport(address, format!("failed to parse XML response: {e}"))
    })?;
    let root = doc.root_element();
    if !root.has_tag_name("response") {
        return Err(BackupError::transport(address, "unexpected response format"));
    }

    if root.attribute("status") == Some("error") {
        let msg = root
            .descendants()
            .filter(|n| n.is_text())
            .filter_map(|n| n.text())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        return Err(BackupError::auth(address, msg));
    }

    root.children()
        .find(|n| n.has_tag_name("result"))
        .and_then(|r| r.children().find(|n| n.has_tag_name("key")))
        .and_then(|k| k.text())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackupError::transport(address, "unexpected response format"))
}
