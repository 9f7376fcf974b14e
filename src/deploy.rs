/// Does the actual deployment: drives the ordered per-file state machine
/// for one host, with backup, hash verification, and restore on failure.
///
/// `deploy_host` handles connection errors, logging, and metrics;
/// `run_host_files` walks the file list. Nothing here returns an error to
/// the scheduler: every failure is logged and appended to the failure
/// tracker, and the worker moves on.
use crate::error::{FileError, SshError};
use crate::repo::Action;
use crate::resolve::{HostPlan, PlannedFile};
use crate::ssh::{quote, RemoteClient, TIMEOUT_MUTATE, TIMEOUT_RELOAD, TIMEOUT_STAT, TIMEOUT_TRANSFER};
use crate::RunContext;
use base64::engine::general_purpose::URL_SAFE as PATH_KEY_B64;
use base64::Engine as _;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// Upper bound on the empty-parent cleanup walk after a deletion.
const MAX_DIRECTORY_LOOP: usize = 1000;

#[derive(Default)]
struct HostStats {
    applied: u64,
    bytes: u64,
    failed: bool,
}

/// A per-file failure plus whatever went wrong while undoing it.
struct FileFailure {
    primary: FileError,
    aftermath: Option<FileError>,
}

impl FileFailure {
    fn of(primary: impl Into<FileError>) -> FileFailure {
        FileFailure {
            primary: primary.into(),
            aftermath: None,
        }
    }
}

enum UpsertOutcome {
    /// Remote content already matches the planned hash: no write, no reload.
    AlreadyCurrent,
    Placed {
        backup_key: Option<String>,
        old_hash: Option<String>,
    },
}

struct ReloadGroup {
    commands: Vec<String>,
    members: Vec<ReloadMember>,
}

struct ReloadMember {
    target: String,
    backup_key: Option<String>,
    old_hash: Option<String>,
}

#[tracing::instrument(skip(ctx, plan), fields(host = %plan.settings.name))]
pub async fn deploy_host(ctx: &RunContext, plan: &HostPlan) {
    let host = plan.settings.name.as_str();
    let escalate = !ctx.options.disable_privilege_escalation;
    let client = match RemoteClient::connect(&plan.settings, &ctx.registry, escalate).await {
        Ok(client) => client,
        Err(e) => {
            error!("{}", e);
            ctx.tracker.record_host(host, &e);
            return;
        }
    };

    let stats = run_host_files(ctx, &client, plan).await;
    client.close().await;

    let mut metrics = ctx.metrics.lock().expect("metrics mutex poisoned");
    metrics.files += stats.applied;
    metrics.bytes += stats.bytes;
    if stats.applied > 0 && !stats.failed {
        metrics.hosts += 1;
    }
}

async fn run_host_files(ctx: &RunContext, client: &RemoteClient, plan: &HostPlan) -> HostStats {
    let host = plan.settings.name.as_str();
    let mut stats = HostStats::default();

    if let Err(e) = ensure_backup_dir(client, &plan.settings.backup_dir).await {
        error!("{}", e);
        ctx.tracker.record_host(host, &e);
        stats.failed = true;
        return stats;
    }

    let mut reload_groups: BTreeMap<String, ReloadGroup> = BTreeMap::new();

    for file in &plan.files {
        let target = file.target_path.as_str();
        let placed = match &file.info.action {
            Action::Delete => delete_file(client, target).await.map(|_| None),
            Action::SymlinkCreate { target: link_target } => {
                create_symlink(client, target, link_target)
                    .await
                    .map(|_| None)
                    .map_err(FileFailure::of)
            }
            Action::Create => {
                if let Some(location) = &file.info.metadata.external_content_location {
                    info!(path = target, location = %location, "skipping externally sourced file");
                    continue;
                }
                match upsert_file(client, plan, file).await {
                    Ok(UpsertOutcome::AlreadyCurrent) => {
                        info!(path = target, "already matches planned content, skipping");
                        stats.applied += 1;
                        continue;
                    }
                    Ok(UpsertOutcome::Placed { backup_key, old_hash }) => {
                        Ok(Some((backup_key, old_hash)))
                    }
                    Err(failure) => Err(failure),
                }
            }
        };

        match placed {
            Ok(placement) => {
                info!(path = target, action = %file.info.action, "applied");
                stats.applied += 1;
                stats.bytes += file.info.content.len() as u64;
                if let Some((backup_key, old_hash)) = placement {
                    register_reload(ctx, &mut reload_groups, file, backup_key, old_hash);
                }
            }
            Err(failure) => {
                error!(path = target, "{}", failure.primary);
                stats.failed = true;
                ctx.tracker.record(
                    host,
                    vec![target.to_string()],
                    &failure.primary,
                    !failure.primary.is_root_cause(),
                );
                if let Some(aftermath) = failure.aftermath {
                    error!(path = target, "{}", aftermath);
                    ctx.tracker
                        .record(host, vec![target.to_string()], &aftermath, true);
                }
            }
        }
    }

    for group in reload_groups.into_values() {
        if let Err(e) = run_commands(client, &group.commands, TIMEOUT_RELOAD).await {
            error!(host, "reload failed: {}", e);
            stats.failed = true;
            let files: Vec<String> = group.members.iter().map(|m| m.target.clone()).collect();
            ctx.tracker.record(host, files, &e, false);
            restore_group(ctx, client, plan, &group).await;
        }
    }

    stats
}

fn register_reload(
    ctx: &RunContext,
    groups: &mut BTreeMap<String, ReloadGroup>,
    file: &PlannedFile,
    backup_key: Option<String>,
    old_hash: Option<String>,
) {
    let commands = &file.info.metadata.reload_commands;
    if commands.is_empty() || ctx.options.disable_reloads {
        return;
    }
    // Files sharing an identical command list reload once, together. The
    // encoded list is the group identity.
    let key = serde_json::to_string(commands).unwrap_or_default();
    groups
        .entry(key)
        .or_insert_with(|| ReloadGroup {
            commands: commands.clone(),
            members: Vec::new(),
        })
        .members
        .push(ReloadMember {
            target: file.target_path.clone(),
            backup_key,
            old_hash,
        });
}

/// Puts every group member with a backup back the way it was. Members that
/// were fresh creates have no pre-deployment state; they stay in place for
/// the replay run to reconcile.
async fn restore_group(ctx: &RunContext, client: &RemoteClient, plan: &HostPlan, group: &ReloadGroup) {
    let host = plan.settings.name.as_str();
    for member in &group.members {
        let (key, old_hash) = match (&member.backup_key, &member.old_hash) {
            (Some(key), Some(old)) => (key, old),
            _ => continue,
        };
        if let Err(e) = restore(client, &plan.settings.backup_dir, key, &member.target, old_hash).await
        {
            error!(path = %member.target, "{}", e);
            ctx.tracker
                .record(host, vec![member.target.clone()], &e, true);
        }
    }
}

/// Idempotent per-host backup directory creation.
async fn ensure_backup_dir(client: &RemoteClient, backup_dir: &str) -> Result<(), SshError> {
    match client
        .run_ok(&format!("mkdir -p {}", quote(backup_dir)), TIMEOUT_MUTATE)
        .await
    {
        Ok(_) => Ok(()),
        Err(SshError::RemoteCommand { ref stderr, .. }) if stderr.contains("File exists") => Ok(()),
        Err(e) => Err(e),
    }
}

/// The transactional core: backup, transfer through the buffer, verify,
/// fix metadata, with a restore attempt on any failure past the backup.
async fn upsert_file(
    client: &RemoteClient,
    plan: &HostPlan,
    file: &PlannedFile,
) -> Result<UpsertOutcome, FileFailure> {
    let target = file.target_path.as_str();

    let (present, _) = client
        .exists(target, false)
        .await
        .map_err(FileFailure::of)?;
    let old_hash = if present {
        let existing = client.hash(target).await.map_err(FileFailure::of)?;
        if existing == file.info.hash {
            return Ok(UpsertOutcome::AlreadyCurrent);
        }
        Some(existing)
    } else {
        None
    };

    let backup_key = if present {
        let key = PATH_KEY_B64.encode(target.as_bytes());
        let backup_path = format!("{}/{}", plan.settings.backup_dir, key);
        client
            .run_ok(
                &format!("cp -p {} {}", quote(target), quote(&backup_path)),
                TIMEOUT_MUTATE,
            )
            .await
            .map_err(FileFailure::of)?;
        Some(key)
    } else {
        None
    };

    if let Err(primary) = place_and_verify(client, plan, file, old_hash.is_none()).await {
        let aftermath = match (&backup_key, &old_hash) {
            (Some(key), Some(old)) => {
                warn!(path = target, "deployment failed, restoring previous content");
                restore(client, &plan.settings.backup_dir, key, target, old)
                    .await
                    .err()
            }
            _ => None,
        };
        return Err(FileFailure { primary, aftermath });
    }

    Ok(UpsertOutcome::Placed { backup_key, old_hash })
}

async fn place_and_verify(
    client: &RemoteClient,
    plan: &HostPlan,
    file: &PlannedFile,
    fresh: bool,
) -> Result<(), FileError> {
    let target = file.target_path.as_str();
    let meta = &file.info.metadata;

    let parent = parent_dir(target);
    if !parent.is_empty() && parent != "/" {
        let (dir_present, _) = client.exists(&parent, true).await?;
        if !dir_present {
            client
                .run_ok(&format!("mkdir -p {}", quote(&parent)), TIMEOUT_MUTATE)
                .await?;
        }
    }

    // Stage in the unprivileged buffer, fix ownership and mode there, then
    // move atomically so the target never exists with wrong metadata.
    let buffer = plan.settings.transfer_buffer.as_str();
    client.upload(&file.info.content, buffer).await?;
    client
        .run_ok(
            &format!("chown {} {}", quote(&meta.owner_group), quote(buffer)),
            TIMEOUT_MUTATE,
        )
        .await?;
    client
        .run_ok(
            &format!("chmod {} {}", meta.permissions, quote(buffer)),
            TIMEOUT_MUTATE,
        )
        .await?;
    client
        .run_ok(
            &format!("mv {} {}", quote(buffer), quote(target)),
            TIMEOUT_MUTATE,
        )
        .await?;

    let (present, _) = client.exists(target, false).await?;
    if !present {
        return Err(FileError::VerifyMismatch {
            path: target.to_string(),
            expected: file.info.hash.clone(),
            actual: "(missing after move)".to_string(),
        });
    }
    let actual = client.hash(target).await?;
    if actual != file.info.hash {
        return Err(FileError::VerifyMismatch {
            path: target.to_string(),
            expected: file.info.hash.clone(),
            actual,
        });
    }

    for check in &meta.check_commands {
        client.run_ok(check, TIMEOUT_TRANSFER).await?;
    }
    if fresh {
        for install in &meta.install_commands {
            client.run_ok(install, TIMEOUT_RELOAD).await?;
        }
    }

    Ok(())
}

/// Moves the backup copy back over the target and confirms the remote
/// content is byte-identical to what was there before the deployment.
async fn restore(
    client: &RemoteClient,
    backup_dir: &str,
    backup_key: &str,
    target: &str,
    old_hash: &str,
) -> Result<(), FileError> {
    let backup_path = format!("{}/{}", backup_dir, backup_key);
    client
        .run_ok(
            &format!("mv {} {}", quote(&backup_path), quote(target)),
            TIMEOUT_MUTATE,
        )
        .await
        .map_err(|e| FileError::RestoreFailure {
            path: target.to_string(),
            reason: e.to_string(),
        })?;
    let restored = client.hash(target).await.map_err(|e| FileError::RestoreFailure {
        path: target.to_string(),
        reason: e.to_string(),
    })?;
    if restored != old_hash {
        return Err(FileError::RestoreFailure {
            path: target.to_string(),
            reason: format!(
                "restored hash {} does not match pre-deployment hash {}",
                restored, old_hash
            ),
        });
    }
    info!(path = target, "previous content restored");
    Ok(())
}

async fn delete_file(client: &RemoteClient, target: &str) -> Result<(), FileFailure> {
    remove_tolerant(client, target).await.map_err(FileFailure::of)?;
    remove_tolerant(client, &format!("{}.old", target))
        .await
        .map_err(FileFailure::of)?;
    cleanup_empty_parents(client, target)
        .await
        .map_err(FileFailure::of)?;
    Ok(())
}

/// `rm` where a missing path is fine.
async fn remove_tolerant(client: &RemoteClient, path: &str) -> Result<(), SshError> {
    let command = format!("rm {}", quote(path));
    let out = client.run(&command, TIMEOUT_MUTATE).await?;
    if out.success() || out.stderr.contains("No such file or directory") {
        return Ok(());
    }
    Err(SshError::RemoteCommand {
        command,
        exit: out.exit,
        stderr: out.stderr.trim().to_string(),
    })
}

/// Walks upward from the deleted file removing now-empty directories,
/// stopping at the first non-empty ancestor, the root, or any probe error.
async fn cleanup_empty_parents(client: &RemoteClient, target: &str) -> Result<(), SshError> {
    let mut dir = parent_dir(target);
    for _ in 0..MAX_DIRECTORY_LOOP {
        if dir.is_empty() || dir == "/" {
            break;
        }
        let out = client.run(&format!("ls -A {}", quote(&dir)), TIMEOUT_STAT).await?;
        if !out.success() || !out.stdout.trim().is_empty() {
            break;
        }
        client
            .run_ok(&format!("rmdir {}", quote(&dir)), TIMEOUT_MUTATE)
            .await?;
        info!(dir = %dir, "removed empty parent directory");
        dir = parent_dir(&dir);
    }
    Ok(())
}

async fn create_symlink(
    client: &RemoteClient,
    path: &str,
    link_target: &str,
) -> Result<(), FileError> {
    let (present, _) = client.exists(path, false).await?;
    if present {
        return Err(FileError::SymlinkTargetExists {
            path: path.to_string(),
        });
    }
    client
        .run_ok(
            &format!("ln -s {} {}", quote(link_target), quote(path)),
            TIMEOUT_MUTATE,
        )
        .await?;
    Ok(())
}

async fn run_commands(
    client: &RemoteClient,
    commands: &[String],
    timeout: std::time::Duration,
) -> Result<(), SshError> {
    for command in commands {
        client.run_ok(command, timeout).await?;
    }
    Ok(())
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}
