use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::binary_store::Platform;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be an absolute path, got {}", path.display())]
    RelativePath { field: &'static str, path: PathBuf },
    #[error("response retention ({retention:?}) must exceed the call timeout ({call_timeout:?})")]
    RetentionTooShort {
        retention: Duration,
        call_timeout: Duration,
    },
    #[error("restart policy must allow at least one failure before cooling down")]
    NoRestartBudget,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind control listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("control server is already serving")]
    AlreadyServing,
}

/// Which artifact failed checksum verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Archive,
    Binary,
}

/// Failures of `BinaryStore::ensure_installed`. None of them is downgraded to
/// trusting whatever is on disk.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unsupported platform: os={os} arch={arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("release {release} has no asset for {platform}")]
    MissingAsset { release: String, platform: Platform },
    #[error("{artifact:?} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        artifact: Artifact,
        expected: String,
        actual: String,
    },
    #[error("binary is {size} bytes, above the {limit} byte ceiling")]
    Oversized { size: u64, limit: u64 },
    #[error("archive {archive} does not contain a {binary} entry")]
    MissingBinary { archive: String, binary: String },
    #[error("installed binary has mode {actual:o}, expected {expected:o}")]
    PermissionMismatch { expected: u32, actual: u32 },
    #[error("invalid release manifest: {0}")]
    Manifest(String),
    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        InstallError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} exceeded the {limit} byte download ceiling")]
    TooLarge { url: String, limit: u64 },
}

/// Configuration errors of a launch; fatal and never retried.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{field} must be an absolute path, got {}", path.display())]
    RelativeDirectory { field: &'static str, path: PathBuf },
    #[error("work and cache directories must differ ({})", .0.display())]
    SharedDirectory(PathBuf),
    #[error("entry program {} must be a relative path inside the work directory", .0.display())]
    EntryOutsideWorkdir(PathBuf),
    #[error("launch cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("failed to prepare sandbox directories: {0}")]
    Workspace(#[source] io::Error),
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),
    #[error("launched process did not connect to the control server")]
    DidNotConnect,
    #[error("start cancelled")]
    Cancelled,
}

/// Errors surfaced to `call_method` callers, who decide whether to retry.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("instance is not connected")]
    NotConnected,
    #[error("instance has been killed")]
    Killed,
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("call cancelled")]
    Cancelled,
    #[error("failed to encode request: {0}")]
    Encode(#[from] warden_core::FrameError),
}

impl CallError {
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            CallError::NotConnected => "not_connected",
            CallError::Killed => "killed",
            CallError::TimedOut(_) => "timeout",
            CallError::Cancelled => "cancelled",
            CallError::Encode(_) => "encode",
        }
    }
}

#[derive(Debug, Error)]
pub enum KillError {
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to enumerate child processes of {pid}: {source}")]
    Enumerate {
        pid: u32,
        #[source]
        source: io::Error,
    },
}
