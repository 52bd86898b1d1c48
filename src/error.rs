//! Error taxonomy shared by the configuration layer, the process provider and
//! the shaping backend.
//!
//! Only [`ConfigError`] is fatal. Snapshot and backend errors are recovered by
//! the reconciliation loop and retried on the next pass.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the configuration document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rate format: {0:?}")]
    InvalidRateFormat(String),

    #[error("rule {rule:?}: invalid regular expression for attribute {attribute:?}: {source}")]
    InvalidPattern {
        rule: String,
        attribute: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {rule:?}: unknown process attribute {attribute:?}")]
    UnknownAttribute { rule: String, attribute: String },

    #[error("rule {rule:?}: match entries must contain exactly one attribute, found {found}")]
    MalformedPredicate { rule: String, found: usize },

    #[error("too many rules: {count} (at most {max} are supported)")]
    TooManyRules { count: usize, max: usize },

    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Process enumeration failed as a whole
#[derive(Debug, Error)]
#[error("process snapshot failed: {0}")]
pub struct SnapshotError(pub String);

/// A single shaping mutation could not be executed
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cgroup operation failed: {0:#}")]
    Cgroup(anyhow::Error),
}

/// The external speed test could not produce a measurement
#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("`speedtest` is not installed or could not be run: {0}")]
    MissingDependency(#[source] std::io::Error),

    #[error("unrecognized `speedtest --version` output: {0:?}")]
    UnknownProvider(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("`{command}` returned unrecognized output: {source}")]
    Output {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}
