/// Handles command line options and their reduction to run options.
use crate::error::FatalError;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "scmp", about = "Git-backed configuration push controller.")]
pub struct Opts {
    #[structopt(long, parse(from_os_str), env = "SCMP_CONFIG", default_value = "scmp.yaml")]
    /// Path to the controller configuration file.
    pub config: PathBuf,

    #[structopt(long)]
    /// Deploy the files changed by a commit (the default mode).
    pub deploy_changes: bool,

    #[structopt(long)]
    /// Deploy every file in the repository tree.
    pub deploy_all: bool,

    #[structopt(long)]
    /// Re-deploy exactly what the failure tracker recorded.
    pub deploy_failures: bool,

    #[structopt(long)]
    /// Invoked from the git post-commit hook: implies --deploy-changes and
    /// rolls a rejected commit back to its parent.
    pub auto_deploy: bool,

    #[structopt(long)]
    /// Deploy this 40-hex commit instead of HEAD.
    pub commitid: Option<String>,

    #[structopt(long)]
    /// Restrict to these hosts: comma-separated patterns, or file://<path>
    /// with one pattern per line.
    pub remote_hosts: Option<String>,

    #[structopt(long)]
    /// Restrict to these repository files: comma-separated patterns, or
    /// file://<path> with one pattern per line.
    pub local_files: Option<String>,

    #[structopt(long)]
    /// Cap on concurrent SSH connections; 1 means sequential.
    pub max_conns: Option<usize>,

    #[structopt(long)]
    /// Print the plan and make no connections.
    pub dry_run: bool,

    #[structopt(long)]
    /// Skip all reload commands.
    pub disable_reloads: bool,

    #[structopt(long)]
    /// Run remote commands without sudo.
    pub disable_privilege_escalation: bool,

    #[structopt(long)]
    /// Deploy to hosts marked offline as well.
    pub ignore_deployment_state: bool,

    #[structopt(long)]
    /// Let planned deletions through to the remote hosts.
    pub allow_deletions: bool,

    #[structopt(long)]
    /// Treat host/file override patterns as regexes instead of globs.
    pub regex: bool,

    #[structopt(long, default_value = "3")]
    /// Log verbosity, 0 (silent) to 5 (trace).
    pub verbosity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Changes,
    All,
    Failures,
}

/// The CLI reduced to what the pipeline needs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    pub auto_deploy: bool,
    pub commit_id: Option<String>,
    pub host_patterns: Vec<String>,
    pub file_patterns: Vec<String>,
    pub max_conns: Option<usize>,
    pub dry_run: bool,
    pub disable_reloads: bool,
    pub disable_privilege_escalation: bool,
    pub ignore_deployment_state: bool,
    pub allow_deletions: bool,
    pub use_regex: bool,
}

impl Opts {
    pub fn to_run_options(&self) -> Result<RunOptions, FatalError> {
        let mut selected = 0;
        if self.deploy_changes || self.auto_deploy {
            selected += 1;
        }
        if self.deploy_all {
            selected += 1;
        }
        if self.deploy_failures {
            selected += 1;
        }
        if selected > 1 {
            return Err(FatalError::ConfigInvalid(
                "--deploy-changes/--auto-deploy, --deploy-all, and --deploy-failures are mutually exclusive"
                    .to_string(),
            ));
        }
        let mode = if self.deploy_all {
            Mode::All
        } else if self.deploy_failures {
            Mode::Failures
        } else {
            Mode::Changes
        };
        if self.verbosity > 5 {
            return Err(FatalError::ConfigInvalid(
                "--verbosity takes a value from 0 to 5".to_string(),
            ));
        }
        if self.max_conns == Some(0) {
            return Err(FatalError::ConfigInvalid(
                "--max-conns must be at least 1".to_string(),
            ));
        }

        Ok(RunOptions {
            mode,
            auto_deploy: self.auto_deploy,
            commit_id: self.commitid.clone(),
            host_patterns: parse_override_list(self.remote_hosts.as_deref())?,
            file_patterns: parse_override_list(self.local_files.as_deref())?,
            max_conns: self.max_conns,
            dry_run: self.dry_run,
            disable_reloads: self.disable_reloads,
            disable_privilege_escalation: self.disable_privilege_escalation,
            ignore_deployment_state: self.ignore_deployment_state,
            allow_deletions: self.allow_deletions,
            use_regex: self.regex,
        })
    }
}

/// `a,b,c` or `file://<path>` with one entry per line.
pub fn parse_override_list(raw: Option<&str>) -> Result<Vec<String>, FatalError> {
    let raw = match raw {
        Some(r) => r,
        None => return Ok(Vec::new()),
    };
    if let Some(path) = raw.strip_prefix("file://") {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FatalError::ConfigInvalid(format!("could not read override list `{}`: {}", path, e))
        })?;
        return Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect());
    }
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// `--verbosity` mapped onto a default `RUST_LOG` value.
pub fn log_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}
