/// Host resolution: expands the ChangeSet into one ordered file list per
/// host, overlaying universal and group directories and applying the
/// host-override dedup rule.
use crate::config::{Config, HostSettings};
use crate::error::FatalError;
use crate::metadata::FileInfo;
use crate::repo::{Action, ChangeSet, RepoIndex};
use crate::tracker::ReplayScope;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, info};

/// One file scheduled for a host.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub repo_path: String,
    /// Absolute path on the remote host.
    pub target_path: String,
    pub info: FileInfo,
}

/// Everything one worker needs to deploy one host.
#[derive(Debug, Clone)]
pub struct HostPlan {
    pub settings: HostSettings,
    pub files: Vec<PlannedFile>,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    pub commit_id: String,
    pub hosts: Vec<HostPlan>,
}

impl DeploymentPlan {
    pub fn total_files(&self) -> usize {
        self.hosts.iter().map(|h| h.files.len()).sum()
    }
}

/// Host/file override patterns: globs by default, regexes with `--regex`.
#[derive(Debug)]
pub enum PatternSet {
    Empty,
    Globs(Vec<glob::Pattern>),
    Regexes(Vec<Regex>),
}

impl PatternSet {
    pub fn compile(patterns: &[String], use_regex: bool) -> Result<PatternSet, FatalError> {
        if patterns.is_empty() {
            return Ok(PatternSet::Empty);
        }
        if use_regex {
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        FatalError::ConfigInvalid(format!("invalid override regex `{}`: {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PatternSet::Regexes(compiled))
        } else {
            let compiled = patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).map_err(|e| {
                        FatalError::ConfigInvalid(format!("invalid override pattern `{}`: {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PatternSet::Globs(compiled))
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PatternSet::Empty)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            PatternSet::Empty => false,
            PatternSet::Globs(globs) => globs.iter().any(|g| g.matches(candidate)),
            PatternSet::Regexes(regexes) => regexes.iter().any(|r| r.is_match(candidate)),
        }
    }

    /// True when the set is empty (no restriction) or the candidate matches.
    pub fn allows(&self, candidate: &str) -> bool {
        self.is_empty() || self.matches(candidate)
    }
}

pub struct PlanFilters<'a> {
    pub hosts: &'a PatternSet,
    pub files: &'a PatternSet,
    pub ignore_deployment_state: bool,
    pub replay: Option<&'a ReplayScope>,
}

/// Builds the per-host deployment plan from a validated ChangeSet.
pub fn build_plan(
    cfg: &Config,
    changeset: &ChangeSet,
    index: &RepoIndex,
    infos: &BTreeMap<String, FileInfo>,
    filters: &PlanFilters<'_>,
) -> Result<DeploymentPlan, FatalError> {
    let mut plan = DeploymentPlan {
        commit_id: changeset.commit_id.clone(),
        hosts: Vec::new(),
    };

    for name in cfg.hosts.keys() {
        let settings = match cfg.host_settings(name) {
            Some(s) => s,
            None => continue,
        };
        if settings.offline && !filters.ignore_deployment_state {
            info!(host = %name, "skipping offline host");
            continue;
        }
        if !filters.hosts.allows(name) {
            continue;
        }
        let replay_files = match filters.replay {
            Some(scope) => match scope.hosts.get(name) {
                Some(files) => Some(files),
                None => continue,
            },
            None => None,
        };

        // Remote target path -> repo path. Universal first, then groups,
        // then the host's own entries, so later layers win on conflicts.
        let mut chosen: BTreeMap<String, String> = BTreeMap::new();
        if !settings.ignore_universal_confs {
            if let Some(universal) = cfg.universal_directory.as_deref() {
                overlay_directory(&mut chosen, changeset, index, universal, name);
            }
            for group in cfg.groups_for_host(name) {
                overlay_directory(&mut chosen, changeset, index, group, name);
            }
        }
        for (path, _) in entries_under(changeset, name) {
            if let Some(rest) = path.strip_prefix(&format!("{}/", name)) {
                chosen.insert(format!("/{}", rest), path.to_string());
            }
        }

        let mut files = Vec::new();
        for (target_path, repo_path) in chosen {
            if !filters.files.allows(&repo_path) {
                continue;
            }
            if let Some(Some(only)) = replay_files {
                if !only.iter().any(|f| f == &target_path) {
                    continue;
                }
            }
            let info = infos.get(&repo_path).ok_or_else(|| {
                FatalError::PlanValidation(format!("no file info collected for `{}`", repo_path))
            })?;
            files.push(PlannedFile {
                repo_path,
                target_path,
                info: info.clone(),
            });
        }

        if files.is_empty() {
            debug!(host = %name, "host has no planned files");
            continue;
        }

        // Deterministic order, with deletions deferred to the end so parent
        // directory cleanup cannot race a later create.
        files.sort_by(|a, b| a.repo_path.cmp(&b.repo_path));
        files.sort_by_key(|f| matches!(f.info.action, Action::Delete));

        plan.hosts.push(HostPlan { settings, files });
    }

    Ok(plan)
}

fn entries_under<'c>(
    changeset: &'c ChangeSet,
    top: &str,
) -> impl Iterator<Item = (&'c String, &'c Action)> {
    let prefix = format!("{}/", top);
    changeset
        .actions
        .iter()
        .filter(move |(path, _)| path.starts_with(&prefix))
}

/// Adds a universal/group directory's entries, skipping any target path the
/// host also carries in its own directory anywhere in the full tree.
fn overlay_directory(
    chosen: &mut BTreeMap<String, String>,
    changeset: &ChangeSet,
    index: &RepoIndex,
    dir: &str,
    host: &str,
) {
    let host_files = index.get(host);
    for (path, _) in entries_under(changeset, dir) {
        let rest = match path.strip_prefix(&format!("{}/", dir)) {
            Some(r) => r,
            None => continue,
        };
        let own_equivalent = format!("{}/{}", host, rest);
        if host_files.map_or(false, |files| files.contains(&own_equivalent)) {
            debug!(host, path = %path, "host-specific file overrides universal candidate");
            continue;
        }
        chosen.insert(format!("/{}", rest), path.to_string());
    }
}

/// Human-readable plan listing for `--dry-run`.
pub fn render_plan(plan: &DeploymentPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "deployment plan for commit {}", plan.commit_id);
    if plan.hosts.is_empty() {
        let _ = writeln!(out, "  no hosts have planned files");
        return out;
    }
    for host in &plan.hosts {
        let _ = writeln!(
            out,
            "  {} ({}:{}, {} file(s))",
            host.settings.name,
            host.settings.endpoint,
            host.settings.port,
            host.files.len()
        );
        for file in &host.files {
            let _ = writeln!(
                out,
                "    {} <- {} [{}]",
                file.target_path, file.repo_path, file.info.action
            );
            if !file.info.metadata.reload_commands.is_empty() {
                let _ = writeln!(
                    out,
                    "      reload: {}",
                    file.info.metadata.reload_commands.join(" && ")
                );
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileMetadata;

    const CFG: &str = r#"
RepositoryPath: /srv/configs
UniversalDirectory: UniversalConfs
UniversalGroups:
  UniversalConfs_Web:
    - web
Hosts:
  webA:
    GroupTags: [web]
  webB:
    GroupTags: [web]
"#;

    fn create_info() -> FileInfo {
        FileInfo {
            action: Action::Create,
            content: b"body\n".to_vec(),
            hash: crate::metadata::sha256_hex(b"body\n"),
            metadata: FileMetadata {
                owner_group: "root:root".to_string(),
                permissions: 644,
                ..FileMetadata::default()
            },
        }
    }

    fn changeset(paths: &[(&str, Action)]) -> ChangeSet {
        ChangeSet {
            commit_id: "a".repeat(40),
            actions: paths
                .iter()
                .map(|(p, a)| (p.to_string(), a.clone()))
                .collect(),
        }
    }

    fn infos_for(changeset: &ChangeSet) -> BTreeMap<String, FileInfo> {
        changeset
            .actions
            .iter()
            .map(|(p, a)| {
                let info = match a {
                    Action::Create => create_info(),
                    other => FileInfo::without_content(other.clone()),
                };
                (p.clone(), info)
            })
            .collect()
    }

    fn no_filters() -> (PatternSet, PatternSet) {
        (PatternSet::Empty, PatternSet::Empty)
    }

    fn plan_with(
        cfg: &Config,
        cs: &ChangeSet,
        index: &RepoIndex,
        filters: &PlanFilters<'_>,
    ) -> DeploymentPlan {
        build_plan(cfg, cs, index, &infos_for(cs), filters).unwrap()
    }

    #[test]
    fn host_specific_file_beats_universal_even_if_unchanged() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[("UniversalConfs/etc/motd", Action::Create)]);
        // webA carries its own motd in the full tree; webB does not.
        let mut index = RepoIndex::new();
        index
            .entry("webA".to_string())
            .or_default()
            .insert("webA/etc/motd".to_string());
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &index, &filters);

        let names: Vec<&str> = plan.hosts.iter().map(|h| h.settings.name.as_str()).collect();
        assert_eq!(names, vec!["webB"]);
        assert_eq!(plan.hosts[0].files[0].target_path, "/etc/motd");
        assert_eq!(plan.hosts[0].files[0].repo_path, "UniversalConfs/etc/motd");
    }

    #[test]
    fn own_entry_wins_over_universal_in_same_commit() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[
            ("UniversalConfs/etc/motd", Action::Create),
            ("webA/etc/motd", Action::Create),
        ]);
        let mut index = RepoIndex::new();
        index
            .entry("webA".to_string())
            .or_default()
            .insert("webA/etc/motd".to_string());
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &index, &filters);

        let web_a = plan.hosts.iter().find(|h| h.settings.name == "webA").unwrap();
        let motd: Vec<_> = web_a
            .files
            .iter()
            .filter(|f| f.target_path == "/etc/motd")
            .collect();
        assert_eq!(motd.len(), 1);
        assert_eq!(motd[0].repo_path, "webA/etc/motd");
    }

    #[test]
    fn group_directory_applies_to_members_only() {
        let raw = CFG.replace("  webB:\n    GroupTags: [web]", "  webB: {}");
        let cfg = Config::parse(&raw).unwrap();
        let cs = changeset(&[("UniversalConfs_Web/etc/nginx.conf", Action::Create)]);
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        let names: Vec<&str> = plan.hosts.iter().map(|h| h.settings.name.as_str()).collect();
        assert_eq!(names, vec!["webA"]);
    }

    #[test]
    fn ignore_universal_confs_means_never_planned() {
        let raw = CFG.replace(
            "  webA:\n    GroupTags: [web]",
            "  webA:\n    GroupTags: [web]\n    IgnoreUniversalConfs: true",
        );
        let cfg = Config::parse(&raw).unwrap();
        let cs = changeset(&[
            ("UniversalConfs/etc/motd", Action::Create),
            ("webA/etc/own", Action::Create),
        ]);
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        let web_a = plan.hosts.iter().find(|h| h.settings.name == "webA").unwrap();
        assert_eq!(web_a.files.len(), 1);
        assert_eq!(web_a.files[0].repo_path, "webA/etc/own");
    }

    #[test]
    fn deletions_are_ordered_after_creates() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[
            ("webA/etc/a-removed", Action::Delete),
            ("webA/etc/b-added", Action::Create),
        ]);
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        let actions: Vec<_> = plan.hosts[0]
            .files
            .iter()
            .map(|f| f.info.action.clone())
            .collect();
        assert_eq!(actions, vec![Action::Create, Action::Delete]);
    }

    #[test]
    fn file_override_intersects_plan() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[
            ("webA/etc/keep", Action::Create),
            ("webA/etc/drop", Action::Create),
        ]);
        let (hosts, _) = no_filters();
        let files = PatternSet::compile(&["webA/etc/keep".to_string()], false).unwrap();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        assert_eq!(plan.hosts[0].files.len(), 1);
        assert_eq!(plan.hosts[0].files[0].repo_path, "webA/etc/keep");
    }

    #[test]
    fn glob_and_regex_pattern_sets() {
        let globs = PatternSet::compile(&["web*".to_string()], false).unwrap();
        assert!(globs.matches("webA"));
        assert!(!globs.matches("db1"));

        let regexes = PatternSet::compile(&["^web[AB]$".to_string()], true).unwrap();
        assert!(regexes.matches("webB"));
        assert!(!regexes.matches("webC"));

        assert!(PatternSet::compile(&["[".to_string()], true).is_err());
    }

    #[test]
    #[tracing_test::traced_test]
    fn offline_hosts_are_skipped_unless_ignored() {
        let raw = CFG.replace(
            "  webB:\n    GroupTags: [web]",
            "  webB:\n    GroupTags: [web]\n    HostState: offline",
        );
        let cfg = Config::parse(&raw).unwrap();
        let cs = changeset(&[("webB/etc/x", Action::Create)]);
        let (hosts, files) = no_filters();
        let mut filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: None,
        };
        assert!(plan_with(&cfg, &cs, &RepoIndex::new(), &filters).hosts.is_empty());
        assert!(logs_contain("skipping offline host"));

        filters.ignore_deployment_state = true;
        assert_eq!(plan_with(&cfg, &cs, &RepoIndex::new(), &filters).hosts.len(), 1);
    }

    #[test]
    fn replay_scope_narrows_hosts_and_files() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[
            ("webA/a", Action::Create),
            ("webA/b", Action::Create),
            ("webB/c", Action::Create),
        ]);
        let mut scope = ReplayScope {
            commit_id: cs.commit_id.clone(),
            hosts: BTreeMap::new(),
        };
        scope
            .hosts
            .insert("webA".to_string(), Some(vec!["/a".to_string()]));
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: Some(&scope),
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        assert_eq!(plan.hosts.len(), 1);
        assert_eq!(plan.hosts[0].settings.name, "webA");
        assert_eq!(plan.hosts[0].files.len(), 1);
        assert_eq!(plan.hosts[0].files[0].target_path, "/a");
    }

    #[test]
    fn replay_na_host_keeps_all_files() {
        let cfg = Config::parse(CFG).unwrap();
        let cs = changeset(&[("webB/c", Action::Create), ("webB/d", Action::Create)]);
        let mut scope = ReplayScope {
            commit_id: cs.commit_id.clone(),
            hosts: BTreeMap::new(),
        };
        scope.hosts.insert("webB".to_string(), None);
        let (hosts, files) = no_filters();
        let filters = PlanFilters {
            hosts: &hosts,
            files: &files,
            ignore_deployment_state: false,
            replay: Some(&scope),
        };
        let plan = plan_with(&cfg, &cs, &RepoIndex::new(), &filters);
        assert_eq!(plan.hosts.len(), 1);
        assert_eq!(plan.hosts[0].files.len(), 2);
    }
}
