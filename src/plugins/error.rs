// Plugin resolver errors

use crate::archive::ArchiveError;
use crate::config::ConfigEditError;
use crate::http::HttpError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Plugin {plugin} has no optional feature named \"{feature}\"")]
    UnknownFeature { plugin: String, feature: String },

    #[error("Malformed plugin request \"{token}\": {reason}")]
    MalformedToken { token: String, reason: String },

    #[error("Malformed catalog entry for {plugin}: {reason}")]
    MalformedDescriptor { plugin: String, reason: String },

    #[error("Cyclic plugin requirement: {}", .0.join(" -> "))]
    CyclicRequirement(Vec<String>),

    #[error("Invalid plugin catalog: {0}")]
    InvalidCatalog(String),

    #[error("No {kind} download URLs found")]
    NoCandidates { kind: &'static str },

    #[error(
        "Plugin {kind} download URL index selection ({index}) is out of range ({len})\nPlugin thread URL: {source_url}"
    )]
    IndexOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
        source_url: String,
    },

    #[error(
        "Got {actual} plugin {kind} download URLs (expected {expected}): {candidates:?}\nPlugin thread URL: {source_url}{hint}"
    )]
    CandidateCountMismatch {
        kind: &'static str,
        expected: usize,
        actual: usize,
        candidates: Vec<String>,
        source_url: String,
        hint: String,
    },

    #[error("Invalid download URL \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No attachment or compiler download links found on plugin thread {0}")]
    NoDownloadSource(String),

    #[error("Install destination already exists: {} (use --force-reuse to allow this)", .0.display())]
    DestinationExists(PathBuf),

    #[error("No custom installer registered as \"{0}\"")]
    UnknownInstaller(String),

    #[error("Installer {installer} has no function named \"{function}\"")]
    UnknownInstallerFunction { installer: String, function: String },

    #[error("Installer {installer} failed: {reason}")]
    InstallerFailed { installer: String, reason: String },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    ConfigEdit(#[from] ConfigEditError),

    #[error("Filesystem error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PluginError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn installer(installer: &str, reason: impl Into<String>) -> Self {
        Self::InstallerFailed {
            installer: installer.to_string(),
            reason: reason.into(),
        }
    }
}
