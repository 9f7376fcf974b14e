/// Git-backed configuration push controller.
///
/// The repository's top-level directories name the hosts they configure
/// (plus a universal directory and universal group directories shared
/// across hosts). A run diffs a commit, resolves one file list per host,
/// and pushes the files over SSH with hash-verified atomic replacement,
/// per-host backups, and a durable failure tracker that later runs can
/// replay.
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod known_hosts;
pub mod metadata;
pub mod repo;
pub mod resolve;
pub mod scheduler;
pub mod ssh;
pub mod tracker;

use crate::cli::{Mode, Opts, RunOptions};
use crate::config::Config;
use crate::error::FatalError;
use crate::known_hosts::HostKeyRegistry;
use crate::resolve::{DeploymentPlan, PatternSet, PlanFilters};
use crate::tracker::FailureTracker;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Aggregated deployment counters, read after all workers join.
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub files: u64,
    pub hosts: u64,
    pub bytes: u64,
}

/// Process-wide state for one run, threaded through the pipeline instead
/// of living in globals. The mutexes sit next to the data they protect.
pub struct RunContext {
    pub config: Config,
    pub options: RunOptions,
    pub tracker: FailureTracker,
    pub registry: HostKeyRegistry,
    pub metrics: Mutex<Metrics>,
}

pub async fn run(opts: Opts) -> Result<()> {
    let options = opts.to_run_options()?;
    let config = Config::load(&opts.config)?;
    let auto_deploy = options.auto_deploy;
    let repo_path = config.repository_path.clone();

    match execute(config, options).await {
        Ok(()) => Ok(()),
        Err(fatal) => {
            if auto_deploy && fatal.rolls_back_commit() {
                warn!("auto-deploy rejected the commit; rolling HEAD back to its parent");
                match git2::Repository::open(&repo_path) {
                    Ok(repo) => {
                        if let Err(e) = repo::rollback_head_to_parent(&repo) {
                            error!("{}", e);
                        }
                    }
                    Err(e) => error!("could not reopen repository for rollback: {}", e),
                }
            }
            Err(fatal.into())
        }
    }
}

async fn execute(config: Config, options: RunOptions) -> Result<(), FatalError> {
    let (plan, commit_id, replay_file) = plan_run(&config, &options)?;

    if options.dry_run {
        println!("{}", resolve::render_plan(&plan));
        return Ok(());
    }
    if plan.hosts.is_empty() {
        info!("no hosts have planned files; nothing to deploy");
        return Ok(());
    }
    info!(
        commit = %commit_id,
        hosts = plan.hosts.len(),
        files = plan.total_files(),
        "starting deployment"
    );

    let registry = HostKeyRegistry::load(&config.known_hosts_file)?;
    let repo_root = config.repository_path.clone();
    let ctx = Arc::new(RunContext {
        config,
        options,
        tracker: FailureTracker::new(),
        registry,
        metrics: Mutex::new(Metrics::default()),
    });

    scheduler::run_deployment(Arc::clone(&ctx), plan).await;

    let metrics = *ctx.metrics.lock().expect("metrics mutex poisoned");
    if ctx.tracker.is_empty() {
        info!(
            "deployment complete: {} file(s) on {} host(s), {} byte(s) transferred",
            metrics.files, metrics.hosts, metrics.bytes
        );
        if let Some(path) = replay_file {
            if let Err(e) = tracker::delete_file(&path) {
                warn!("could not remove failure tracker {}: {}", path.display(), e);
            }
        }
    } else {
        eprint!("{}", ctx.tracker.console_report());
        match ctx.tracker.write_file(&repo_root, &commit_id) {
            Ok(path) => eprintln!(
                "failure tracker written to {}\nresume with: scmp --deploy-failures",
                path.display()
            ),
            Err(e) => error!("could not write failure tracker: {}", e),
        }
    }
    Ok(())
}

/// Planning stage: everything that touches the git repository, done before
/// any network traffic.
fn plan_run(
    config: &Config,
    options: &RunOptions,
) -> Result<(DeploymentPlan, String, Option<PathBuf>), FatalError> {
    let repo = repo::open_repository(config)?;

    let (replay_scope, replay_file) = if options.mode == Mode::Failures {
        let path = tracker::existing_tracker_path(&config.repository_path);
        (Some(tracker::read_scope(&path)?), Some(path))
    } else {
        (None, None)
    };

    // A replay pins the recorded commit; otherwise --commitid wins over HEAD.
    let commit_override = replay_scope
        .as_ref()
        .map(|s| s.commit_id.clone())
        .or_else(|| options.commit_id.clone());
    let commit = repo::resolve_commit(&repo, commit_override.as_deref())?;

    let changeset = match options.mode {
        Mode::All => repo::changeset_whole_tree(config, &repo, &commit)?,
        Mode::Changes | Mode::Failures => {
            repo::changeset_from_diff(config, &repo, &commit, options.allow_deletions)?
        }
    };
    let index = repo::index_tree(config, &commit)?;
    let infos = repo::collect_file_infos(&repo, &commit, &changeset)?;

    let host_patterns = PatternSet::compile(&options.host_patterns, options.use_regex)?;
    let file_patterns = PatternSet::compile(&options.file_patterns, options.use_regex)?;
    let filters = PlanFilters {
        hosts: &host_patterns,
        files: &file_patterns,
        ignore_deployment_state: options.ignore_deployment_state,
        replay: replay_scope.as_ref(),
    };
    let plan = resolve::build_plan(config, &changeset, &index, &infos, &filters)?;

    Ok((plan, changeset.commit_id, replay_file))
}
