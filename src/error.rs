/// Error taxonomy for the deployment pipeline.
///
/// Two layers: [`FatalError`] covers everything that aborts the run before
/// any SSH traffic (bad config, bad commit, bad plan, bad metadata), while
/// [`SshError`]/[`FileError`] cover per-host and per-file failures that are
/// swallowed by the workers and surfaced only through the failure tracker.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("could not parse metadata header of `{path}`: {reason}")]
    MetadataParse { path: String, reason: String },
}

impl FatalError {
    pub fn repo(context: impl std::fmt::Display, err: git2::Error) -> Self {
        FatalError::Repository(format!("{}: {}", context, err))
    }

    /// Whether hook-mode (`--auto-deploy`) rolls HEAD back to the commit's
    /// first parent when this error aborts the run. Configuration problems
    /// are not the commit's fault; everything else here is.
    pub fn rolls_back_commit(&self) -> bool {
        !matches!(self, FatalError::ConfigInvalid(_))
    }
}

/// Failures of the remote operations client.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("could not connect to `{host}`: {reason}")]
    Connect { host: String, reason: String },

    #[error("host key verification failed for `{host}`: {reason}")]
    AuthFailure { host: String, reason: String },

    #[error("remote command `{command}` failed (exit {code}): {stderr}", code = .exit.map_or_else(|| "?".to_string(), |c| c.to_string()))]
    RemoteCommand {
        command: String,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("remote command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("transfer to `{path}` failed: {reason}")]
    Transport { path: String, reason: String },
}

/// Per-file failures inside the deployment state machine.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("uploaded `{path}` hashes to {actual}, planned content hashes to {expected}")]
    VerifyMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("failed old config restoration of `{path}`: {reason}")]
    RestoreFailure { path: String, reason: String },

    #[error("refusing to create symbolic link: `{path}` already exists")]
    SymlinkTargetExists { path: String },
}

impl FileError {
    /// Restore failures describe the aftermath of another error, not the
    /// deployment problem itself. They are reported on the console but kept
    /// out of the persisted failure tracker.
    pub fn is_root_cause(&self) -> bool {
        !matches!(self, FileError::RestoreFailure { .. })
    }
}
