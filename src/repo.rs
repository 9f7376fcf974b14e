/// Commit planning: opens the repository, resolves the commit to deploy,
/// and turns its diff (or its whole tree) into a validated [`ChangeSet`].
use crate::config::Config;
use crate::error::FatalError;
use crate::metadata::{self, FileInfo};
use git2::{Delta, DiffFindOptions, DiffOptions, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

static COMMIT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-fA-F]{40}$").unwrap());

const MODE_REGULAR: i32 = 0o100644;
const MODE_SYMLINK: i32 = 0o120000;

/// Operation attached to a repository path in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
    SymlinkCreate { target: String },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Delete => write!(f, "delete"),
            Action::SymlinkCreate { target } => write!(f, "symlinkcreate to target {}", target),
        }
    }
}

/// Repository path -> action, for one commit.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub commit_id: String,
    pub actions: BTreeMap<String, Action>,
}

impl ChangeSet {
    pub fn has_deletions(&self) -> bool {
        self.actions.values().any(|a| matches!(a, Action::Delete))
    }
}

/// Full-tree file index: top-level directory -> deployable repo paths.
pub type RepoIndex = BTreeMap<String, BTreeSet<String>>;

/// Kind of a raw tree-entry mode (0100644 regular, 0120000 symlink).
fn file_kind(mode: i32) -> FileKind {
    match mode {
        MODE_REGULAR => FileKind::Regular,
        MODE_SYMLINK => FileKind::Symlink,
        _ => FileKind::Unsupported,
    }
}

fn diff_kind(mode: git2::FileMode) -> FileKind {
    match mode {
        git2::FileMode::Blob => FileKind::Regular,
        git2::FileMode::Link => FileKind::Symlink,
        _ => FileKind::Unsupported,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Regular,
    Symlink,
    Unsupported,
}

enum TopClass<'a> {
    RootLevel,
    Ignored,
    Deployable(&'a str),
    Unknown(&'a str),
}

fn classify_top<'a>(cfg: &Config, path: &'a str) -> TopClass<'a> {
    let top = match path.split('/').next() {
        Some(t) if t != path => t,
        _ => return TopClass::RootLevel,
    };
    if cfg.is_ignored_dir(top) {
        TopClass::Ignored
    } else if cfg.is_host_dir(top) || cfg.is_universal_dir(top) || cfg.is_group_dir(top) {
        TopClass::Deployable(top)
    } else {
        TopClass::Unknown(top)
    }
}

pub fn open_repository(cfg: &Config) -> Result<Repository, FatalError> {
    Repository::open(&cfg.repository_path).map_err(|e| {
        FatalError::repo(
            format!("could not open repository at `{}`", cfg.repository_path.display()),
            e,
        )
    })
}

/// Resolves the commit to deploy: the given 40-hex id, or HEAD.
pub fn resolve_commit<'r>(
    repo: &'r Repository,
    commit_id: Option<&str>,
) -> Result<git2::Commit<'r>, FatalError> {
    match commit_id {
        Some(id) => {
            if !COMMIT_ID_RE.is_match(id) {
                return Err(FatalError::PlanValidation(format!(
                    "`{}` is not a 40-character hex commit id",
                    id
                )));
            }
            let oid = Oid::from_str(id)
                .map_err(|e| FatalError::repo(format!("invalid commit id `{}`", id), e))?;
            repo.find_commit(oid)
                .map_err(|e| FatalError::repo(format!("could not find commit `{}`", id), e))
        }
        None => repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| FatalError::repo("could not resolve HEAD", e)),
    }
}

/// Builds the ChangeSet from the commit's diff against its first parent.
pub fn changeset_from_diff(
    cfg: &Config,
    repo: &Repository,
    commit: &git2::Commit<'_>,
    allow_deletions: bool,
) -> Result<ChangeSet, FatalError> {
    let tree = commit
        .tree()
        .map_err(|e| FatalError::repo("could not read commit tree", e))?;
    let parent_tree = match commit.parent_count() {
        0 => None,
        _ => Some(
            commit
                .parent(0)
                .and_then(|p| p.tree())
                .map_err(|e| FatalError::repo("could not read parent tree", e))?,
        ),
    };

    let mut opts = DiffOptions::new();
    opts.include_typechange(true);
    let mut diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))
        .map_err(|e| FatalError::repo("could not diff commit against parent", e))?;
    let mut find = DiffFindOptions::new();
    find.renames(true).copies(true);
    diff.find_similar(Some(&mut find))
        .map_err(|e| FatalError::repo("rename detection failed", e))?;

    let mut changeset = ChangeSet {
        commit_id: commit.id().to_string(),
        actions: BTreeMap::new(),
    };

    for delta in diff.deltas() {
        let to_path = diff_file_path(&delta.new_file());
        let from_path = diff_file_path(&delta.old_file());
        let to_kind = diff_kind(delta.new_file().mode());
        let from_kind = diff_kind(delta.old_file().mode());

        match delta.status() {
            Delta::Added => {
                add_create(cfg, repo, &mut changeset, &to_path, to_kind, delta.new_file().id())?;
            }
            Delta::Deleted => {
                add_delete(cfg, &mut changeset, &from_path, from_kind)?;
            }
            Delta::Renamed | Delta::Copied => {
                add_create(cfg, repo, &mut changeset, &to_path, to_kind, delta.new_file().id())?;
                // Rename vs copy: the old path is gone from disk on a rename.
                let still_on_disk = repo
                    .workdir()
                    .map(|w| w.join(&from_path).exists())
                    .unwrap_or(false);
                if !still_on_disk {
                    add_delete(cfg, &mut changeset, &from_path, from_kind)?;
                }
            }
            Delta::Modified | Delta::Typechange => {
                add_create(cfg, repo, &mut changeset, &to_path, to_kind, delta.new_file().id())?;
            }
            _ => {
                debug!(status = ?delta.status(), path = %to_path, "skipping diff delta");
            }
        }
    }

    if !allow_deletions && changeset.has_deletions() {
        return Err(FatalError::PlanValidation(
            "commit contains deletions; re-run with --allow-deletions to push them".to_string(),
        ));
    }

    Ok(changeset)
}

/// Deploy-all: synthesizes a `create` for every deployable file in the tree.
pub fn changeset_whole_tree(
    cfg: &Config,
    repo: &Repository,
    commit: &git2::Commit<'_>,
) -> Result<ChangeSet, FatalError> {
    let mut changeset = ChangeSet {
        commit_id: commit.id().to_string(),
        actions: BTreeMap::new(),
    };
    for (path, mode, id) in tree_files(commit)? {
        add_create(cfg, repo, &mut changeset, &path, file_kind(mode), id)?;
    }
    Ok(changeset)
}

/// Full-tree index used by the resolver's host-override dedup. Unknown
/// top-level directories are simply absent; only changed paths are held to
/// the fatal-validation rule.
pub fn index_tree(cfg: &Config, commit: &git2::Commit<'_>) -> Result<RepoIndex, FatalError> {
    let mut index = RepoIndex::new();
    for (path, mode, _) in tree_files(commit)? {
        if file_kind(mode) == FileKind::Unsupported {
            continue;
        }
        if let TopClass::Deployable(top) = classify_top(cfg, &path) {
            index.entry(top.to_string()).or_default().insert(path);
        }
    }
    Ok(index)
}

fn tree_files(commit: &git2::Commit<'_>) -> Result<Vec<(String, i32, Oid)>, FatalError> {
    let tree = commit
        .tree()
        .map_err(|e| FatalError::repo("could not read commit tree", e))?;
    let mut files = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                files.push((format!("{}{}", dir, name), entry.filemode(), entry.id()));
            }
        }
        TreeWalkResult::Ok
    })
    .map_err(|e| FatalError::repo("could not walk commit tree", e))?;
    Ok(files)
}

fn add_create(
    cfg: &Config,
    repo: &Repository,
    changeset: &mut ChangeSet,
    path: &str,
    kind: FileKind,
    blob_id: Oid,
) -> Result<(), FatalError> {
    match classify_top(cfg, path) {
        TopClass::RootLevel | TopClass::Ignored => return Ok(()),
        TopClass::Unknown(top) => return Err(unknown_top_error(top, path)),
        TopClass::Deployable(_) => {}
    }
    let action = match kind {
        FileKind::Regular => Action::Create,
        FileKind::Symlink => {
            let blob = repo
                .find_blob(blob_id)
                .map_err(|e| FatalError::repo(format!("could not read symlink blob `{}`", path), e))?;
            let raw = std::str::from_utf8(blob.content()).map_err(|_| {
                FatalError::PlanValidation(format!("symlink `{}` has a non-UTF-8 target", path))
            })?;
            link_target_action(path, raw)?
        }
        FileKind::Unsupported => {
            debug!("skipping `{}`: unsupported file kind", path);
            return Ok(());
        }
    };
    changeset.actions.insert(path.to_string(), action);
    Ok(())
}

fn add_delete(
    cfg: &Config,
    changeset: &mut ChangeSet,
    path: &str,
    kind: FileKind,
) -> Result<(), FatalError> {
    match classify_top(cfg, path) {
        TopClass::RootLevel | TopClass::Ignored => return Ok(()),
        TopClass::Unknown(top) => return Err(unknown_top_error(top, path)),
        TopClass::Deployable(_) => {}
    }
    if kind == FileKind::Unsupported {
        return Ok(());
    }
    changeset.actions.insert(path.to_string(), Action::Delete);
    Ok(())
}

fn unknown_top_error(top: &str, path: &str) -> FatalError {
    FatalError::PlanValidation(format!(
        "`{}`: top-level directory `{}` is not a configured host, universal, or group directory",
        path, top
    ))
}

/// Turns a symlink's stored target into a `symlinkcreate` action, rejecting
/// links that leave their own top-level directory.
pub(crate) fn link_target_action(repo_path: &str, raw_target: &str) -> Result<Action, FatalError> {
    let top = repo_path.split('/').next().unwrap_or("");

    let target = if let Some(stripped) = raw_target.strip_prefix('/') {
        // Absolute targets are already remote paths on the same host.
        format!("/{}", stripped)
    } else {
        let mut parts: Vec<&str> = repo_path.split('/').collect();
        parts.pop();
        for comp in raw_target.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(FatalError::PlanValidation(format!(
                            "symlink `{}` target `{}` escapes the repository",
                            repo_path, raw_target
                        )));
                    }
                }
                c => parts.push(c),
            }
        }
        if parts.first().map(|t| *t != top).unwrap_or(true) {
            return Err(FatalError::PlanValidation(format!(
                "cannot have symbolic link between host directories: `{}` -> `{}`",
                repo_path, raw_target
            )));
        }
        if parts.len() < 2 {
            return Err(FatalError::PlanValidation(format!(
                "symlink `{}` target `{}` does not name a file",
                repo_path, raw_target
            )));
        }
        format!("/{}", parts[1..].join("/"))
    };

    Ok(Action::SymlinkCreate { target })
}

/// Reads blobs for every `create` in the ChangeSet and splits out metadata.
pub fn collect_file_infos(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    changeset: &ChangeSet,
) -> Result<BTreeMap<String, FileInfo>, FatalError> {
    let tree = commit
        .tree()
        .map_err(|e| FatalError::repo("could not read commit tree", e))?;
    let mut infos = BTreeMap::new();
    for (path, action) in &changeset.actions {
        let info = match action {
            Action::Create => {
                let entry = tree.get_path(Path::new(path)).map_err(|e| {
                    FatalError::repo(format!("could not look up `{}` in commit tree", path), e)
                })?;
                let blob = repo.find_blob(entry.id()).map_err(|e| {
                    FatalError::repo(format!("could not read blob for `{}`", path), e)
                })?;
                let (meta, body) = metadata::extract(path, blob.content())?;
                let hash = metadata::sha256_hex(&body);
                FileInfo {
                    action: Action::Create,
                    content: body,
                    hash,
                    metadata: meta,
                }
            }
            other => FileInfo::without_content(other.clone()),
        };
        infos.insert(path.clone(), info);
    }
    Ok(infos)
}

/// Hook-mode recovery for a commit the planner rejected: move HEAD's branch
/// back to the commit's first parent. Soft reset; the working tree keeps the
/// bad content so it can be fixed and re-committed.
pub fn rollback_head_to_parent(repo: &Repository) -> Result<(), FatalError> {
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| FatalError::repo("could not resolve HEAD for rollback", e))?;
    if head.parent_count() == 0 {
        return Err(FatalError::Repository(
            "cannot roll back: HEAD has no parent".to_string(),
        ));
    }
    let parent = head
        .parent(0)
        .map_err(|e| FatalError::repo("could not resolve HEAD's parent", e))?;
    warn!(
        "rolling HEAD back from {} to {}; the working tree is untouched",
        head.id(),
        parent.id()
    );
    repo.reset(parent.as_object(), git2::ResetType::Soft, None)
        .map_err(|e| FatalError::repo("HEAD rollback failed", e))
}

fn diff_file_path(file: &git2::DiffFile<'_>) -> String {
    file.path()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}
