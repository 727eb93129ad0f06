//! Hostname extraction from device-state archives.
//!
//! A device-state export is a gzip tarball. Somewhere inside is the
//! `running-config.xml` document whose `config/devices/entry/deviceconfig/
//! system/hostname` element names the firewall.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::bufread::GzDecoder;
use roxmltree::{Document, Node};
use tar::Archive;
use tracing::{debug, warn};

use crate::error::ExtractionError;

/// Name fragment identifying the running configuration member.
pub const RUNNING_CONFIG: &str = "running-config.xml";

/// Element path from the document root to the hostname.
const HOSTNAME_PATH: [&str; 5] = ["devices", "entry", "deviceconfig", "system", "hostname"];

/// Read the configured hostname out of the archive at `path`.
pub fn extract_hostname(path: &Path) -> Result<String, ExtractionError> {
    let archive_err = |source| ExtractionError::Archive {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(archive_err)?;
    let xml = read_running_config(BufReader::new(file)).map_err(|e| match e {
        ExtractionError::Archive { source, .. } => archive_err(source),
        other => other,
    })?;
    hostname_from_config(&xml)
}

/// Like [`extract_hostname`], falling back to `address` on any failure.
///
/// Returns the effective name and the extraction error, if any.
pub fn resolve_hostname(path: &Path, address: &str) -> (String, Option<ExtractionError>) {
    match extract_hostname(path) {
        Ok(host) => {
            debug!(device = %address, hostname = %host, "hostname extracted");
            (host, None)
        }
        Err(e) => {
            warn!(device = %address, error = %e, "hostname extraction failed, naming backup by address");
            (address.to_string(), Some(e))
        }
    }
}

/// Scan a gzip tar stream for the first running-config member.
fn read_running_config<R: std::io::BufRead>(reader: R) -> Result<String, ExtractionError> {
    let io_err = |source| ExtractionError::Archive {
        path: Default::default(),
        source,
    };
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let is_config = entry
            .path()
            .map(|p| p.to_string_lossy().contains(RUNNING_CONFIG))
            .unwrap_or(false);
        if !is_config || !entry.header().entry_type().is_file() {
            continue;
        }
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw).map_err(io_err)?;
        return String::from_utf8(raw).map_err(|_| ExtractionError::Encoding);
    }
    Err(ExtractionError::MissingMember)
}

/// Walk the fixed element path to the hostname.
pub fn hostname_from_config(xml: &str) -> Result<String, ExtractionError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("config") {
        return Err(ExtractionError::MissingElement("config"));
    }
    let node = HOSTNAME_PATH.into_iter().try_fold(root, child)?;

    let host = node.text().map(str::trim).unwrap_or_default();
    if host.is_empty() {
        return Err(ExtractionError::EmptyHostname);
    }
    Ok(host.to_string())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &'static str) -> Result<Node<'a, 'i>, ExtractionError> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
        .ok_or(ExtractionError::MissingElement(name))
}
