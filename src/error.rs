//! Error taxonomy for the backup workflow.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the backup pipeline.
///
/// Everything except [`BackupError::Extraction`] ends the current device's
/// iteration; extraction only degrades naming to the device address.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("transport error talking to {address}: {detail}")]
    Transport { address: String, detail: String },

    #[error("authentication rejected by {address}: {detail}")]
    AuthExpired { address: String, detail: String },

    #[error("hostname extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("failed to place {from} at {to}: {source}")]
    Placement {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("retention failed for {path}: {source}")]
    Retention {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notification to channel {channel} failed: {detail}")]
    Notification { channel: String, detail: String },

    #[error("{task} step did not complete: {detail}")]
    Interrupted { task: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BackupError {
    pub(crate) fn transport(address: &str, detail: impl ToString) -> Self {
        Self::Transport {
            address: address.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn auth(address: &str, detail: impl ToString) -> Self {
        Self::AuthExpired {
            address: address.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Reasons the hostname could not be read out of a device-state archive.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("cannot read archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no running-config.xml member in archive")]
    MissingMember,

    #[error("running-config.xml is not valid UTF-8")]
    Encoding,

    #[error("running-config.xml is not well-formed XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("element <{0}> missing from running config")]
    MissingElement(&'static str),

    #[error("hostname element is empty")]
    EmptyHostname,
}
