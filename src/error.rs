use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a geo or ASN database lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("no entry for {0}")]
    NotFound(IpAddr),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Conditions that stop the process before the polling loop starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("target directory {0} does not exist or cannot be read")]
    MissingTargetDir(PathBuf),
    #[error("target directory {0} holds no torrents to track")]
    NoTargets(PathBuf),
    #[error("geo database {path} cannot be opened: {reason}")]
    MissingGeoDatabase { path: PathBuf, reason: String },
    #[error("unable to obtain public address: {0}")]
    PublicAddress(String),
}

/// Steady-state failures. Logged by the monitor; never end the loop.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("snapshot unavailable for {info_hash}")]
    SnapshotUnavailable {
        info_hash: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("sink {sink} failed to write {peer}")]
    SinkWriteFailed {
        sink: &'static str,
        peer: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("notifier failed for {peer}")]
    NotifierFailed {
        peer: String,
        #[source]
        source: anyhow::Error,
    },
}
