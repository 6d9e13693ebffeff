//! Typed leaf errors for the failure kinds enumerated in the daemon's error
//! handling design. Each is wrapped in an [`eyre::Report`] with `.wrap_err`
//! at the call boundary rather than threaded through as a concrete type, the
//! way the rest of the crate already does for `subprocess`/`openssh` errors.

use thiserror::Error;

/// Invalid INI, unknown template, bad schema string, mutually exclusive
/// options. Fatal at startup; per-dataset at runtime reconfigure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{section}: unknown key `{key}`")]
    UnknownKey { section: String, key: String },

    #[error("{section}: unknown template `{template}`")]
    UnknownTemplate { section: String, template: String },

    #[error("{0}")]
    InvalidSchema(String),

    #[error("{section}: `replicate_target` and `replicate_source` are mutually exclusive")]
    MutuallyExclusiveReplication { section: String },

    #[error("{section}: {reason}")]
    Invalid { section: String, reason: String },

    #[error("no such dataset section `{0}`")]
    NoSuchDataset(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Ini(String),
}

/// The ZFS tool exited nonzero. Aborts the current dataset's sequence.
#[derive(Error, Debug)]
#[error("command `{command}` exited with status {status}: {stderr}")]
pub struct ToolFailure {
    pub command: String,
    pub status: String,
    pub stderr: String,
}

/// The TCP reachability probe failed. Skips the replication step only.
#[derive(Error, Debug)]
#[error("endpoint {host}:{port} unreachable: {source}")]
pub struct EndpointUnreachable {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

/// A pre/post/replicate_postexec hook command exited nonzero.
#[derive(Error, Debug)]
#[error("hook `{hook}` exited with status {status}: {stderr}")]
pub struct HookFailure {
    pub hook: String,
    pub status: String,
    pub stderr: String,
}

/// Any stage of the send/compress/ssh/receive pipeline exited nonzero.
/// Treated identically to [`ToolFailure`] by callers.
#[derive(Error, Debug)]
#[error("pipeline stage `{stage}` exited with status {status}: {stderr}")]
pub struct PipelineFailure {
    pub stage: String,
    pub status: String,
    pub stderr: String,
}

impl From<PipelineFailure> for ToolFailure {
    fn from(p: PipelineFailure) -> Self {
        ToolFailure {
            command: p.stage,
            status: p.status,
            stderr: p.stderr,
        }
    }
}
