//! Device-state export over the appliance XML API.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::error::BackupError;
use crate::placement::{sanitize, write_then_rename};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Raw archive fetched from one device, sitting in the working directory.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub device_address: String,
    pub path: PathBuf,
    pub fetched_at: NaiveDateTime,
    pub size: usize,
}

/// Downloads a device-state archive.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, address: &str, token: &str) -> Result<Vec<u8>, BackupError>;
}

/// Talks to a real appliance.
pub struct HttpExporter {
    client: Client,
    scheme: String,
}

impl HttpExporter {
    pub fn new(client: Client, scheme: impl Into<String>) -> Self {
        Self {
            client,
            scheme: scheme.into(),
        }
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn export(&self, address: &str, token: &str) -> Result<Vec<u8>, BackupError> {
        let url = format!("{}://{}/api/", self.scheme, address);
        debug!(device = %address, %url, "requesting device-state export");

        let response = self
            .client
            .get(&url)
            .query(&[("type", "export"), ("category", "device-state"), ("key", token)])
            .send()
            .await
            .map_err(|e| BackupError::transport(address, transport_detail(e, token)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackupError::auth(address, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(BackupError::transport(address, format!("HTTP {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BackupError::transport(address, transport_detail(e, token)))?;

        if let Some(err) = classify_error_envelope(address, &body) {
            return Err(err);
        }
        Ok(body.to_vec())
    }
}

/// Describe a failed request without the request URL, which carries the key.
fn transport_detail(e: reqwest::Error, token: &str) -> String {
    let kind = if e.is_timeout() {
        "request timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    let e = e.without_url();
    let mut causes = Vec::new();
    let mut cause = std::error::Error::source(&e);
    while let Some(c) = cause {
        causes.push(c.to_string());
        cause = c.source();
    }
    let detail = if causes.is_empty() {
        format!("{kind}: {e}")
    } else {
        format!("{kind}: {}", causes.join(": "))
    };
    if token.is_empty() {
        detail
    } else {
        detail.replace(token, "<redacted>")
    }
}

/// A 2xx reply that carries an XML error envelope instead of an archive.
fn classify_error_envelope(address: &str, body: &[u8]) -> Option<BackupError> {
    if body.starts_with(&GZIP_MAGIC) {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;
    let doc = roxmltree::Document::parse(text.trim()).ok()?;
    let root = doc.root_element();
    if !root.has_tag_name("response") || root.attribute("status") != Some("error") {
        return None;
    }

    let msg = root
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let auth = root.attribute("code") == Some("403")
        || msg.to_ascii_lowercase().contains("invalid credential");
    Some(if auth {
        BackupError::auth(address, msg)
    } else {
        BackupError::transport(address, format!("appliance returned error: {msg}"))
    })
}

/// `device_state_<address>_<YYYYMMDD_HHMMSS>.tgz`
pub fn working_file_name(address: &str, at: NaiveDateTime) -> String {
    format!(
        "device_state_{}_{}.tgz",
        sanitize(address),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Persist fetched bytes under their working name.
///
/// Bytes go to a `.part` sibling first so a truncated write never carries
/// the final name.
pub fn write_working_artifact(
    work_dir: &Path,
    address: &str,
    bytes: &[u8],
    at: NaiveDateTime,
) -> Result<ExportArtifact, BackupError> {
    let path = work_dir.join(working_file_name(address, at));
    let part = path.with_extension("tgz.part");

    let placement_err = |source| BackupError::Placement {
        from: part.clone(),
        to: path.clone(),
        source,
    };
    std::fs::create_dir_all(work_dir).map_err(placement_err)?;
    write_then_rename(&part, &path, |f| f.write_all(bytes)).map_err(placement_err)?;

    info!(device = %address, path = %path.display(), bytes = bytes.len(), "device state exported");
    Ok(ExportArtifact {
        device_address: address.to_string(),
        path,
        fetched_at: at,
        size: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 30)
            .unwrap()
    }

    #[test]
    fn test_working_file_name() {
        assert_eq!(
            working_file_name("10.0.0.5", at()),
            "device_state_10.0.0.5_20240309_070530.tgz"
        );
    }

    #[test]
    fn test_write_working_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("incoming");
        let art = write_working_artifact(&work, "10.0.0.5", b"\x1f\x8bdata", at()).unwrap();

        assert_eq!(art.size, 6);
        assert_eq!(std::fs::read(&art.path).unwrap(), b"\x1f\x8bdata");
        let names: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["device_state_10.0.0.5_20240309_070530.tgz"]);
    }

    #[test]
    fn test_failed_write_leaves_no_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("device_state.tgz.part");
        let path = dir.path().join("device_state.tgz");

        let result = write_then_rename(&part, &path, |f| {
            f.write_all(b"\x1f\x8btrunc")?;
            Err(std::io::Error::other("no space left on device"))
        });

        assert!(result.is_err());
        assert!(!part.exists());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_hides_the_key() {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap();
        // Nothing listens on port 1.
        let exporter = HttpExporter::new(client, "http");
        let err = exporter
            .export("127.0.0.1:1", "SUPERSECRETKEY")
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(matches!(err, BackupError::Transport { .. }), "{text}");
        assert!(!text.contains("SUPERSECRETKEY"), "{text}");
        assert!(!text.contains("key="), "{text}");
    }

    #[test]
    fn test_gzip_body_is_not_an_envelope() {
        assert!(classify_error_envelope("fw", &[0x1f, 0x8b, 0x08, 0x00]).is_none());
    }

    #[test]
    fn test_error_envelope_classification() {
        let auth = br#"<response status="error" code="403"><result><msg>Invalid credentials.</msg></result></response>"#;
        assert!(matches!(
            classify_error_envelope("fw", auth),
            Some(BackupError::AuthExpired { .. })
        ));

        let other = br#"<response status="error"><msg>export busy</msg></response>"#;
        match classify_error_envelope("fw", other) {
            Some(BackupError::Transport { detail, .. }) => assert!(detail.contains("export busy")),
            e => panic!("unexpected {:?}", e),
        }

        let ok = br#"<response status="success"/>"#;
        assert!(classify_error_envelope("fw", ok).is_none());
    }
}
