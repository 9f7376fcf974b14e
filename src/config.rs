/// Controller configuration, loaded from a YAML file.
///
/// Host connection settings come in two layers: `HostDefaults` applies to
/// every host, and each entry under `Hosts` may override any of them. The
/// repository side (universal directory, universal groups, ignore list) is
/// global.
use crate::error::FatalError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_TRANSFER_BUFFER: &str = "/tmp/.scmp-transfer-buf";
pub const DEFAULT_BACKUP_DIR: &str = "/tmp/.scmp-backups";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    pub repository_path: PathBuf,

    #[serde(rename = "KnownHostsFile", default = "default_known_hosts")]
    pub known_hosts_file: PathBuf,

    #[serde(rename = "MaxSSHConcurrency", default = "default_concurrency")]
    pub max_ssh_concurrency: usize,

    #[serde(default)]
    pub universal_directory: Option<String>,

    /// Group directory name -> member host names or group tags.
    #[serde(default)]
    pub universal_groups: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub ignore_directories: Vec<String>,

    #[serde(default)]
    pub host_defaults: HostDefaults,

    #[serde(default)]
    pub hosts: BTreeMap<String, HostOverrides>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HostDefaults {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(rename = "UseSSHAgent", default)]
    pub use_ssh_agent: bool,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_transfer_buffer")]
    pub remote_transfer_buffer: String,

    #[serde(default = "default_backup_dir")]
    pub remote_backup_dir: String,
}

impl Default for HostDefaults {
    fn default() -> Self {
        HostDefaults {
            port: DEFAULT_SSH_PORT,
            user: default_user(),
            identity_file: None,
            use_ssh_agent: false,
            password: None,
            remote_transfer_buffer: DEFAULT_TRANSFER_BUFFER.to_string(),
            remote_backup_dir: DEFAULT_BACKUP_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct HostOverrides {
    /// Address to dial; the host's directory name when absent.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(rename = "UseSSHAgent", default)]
    pub use_ssh_agent: Option<bool>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub remote_transfer_buffer: Option<String>,

    #[serde(default)]
    pub remote_backup_dir: Option<String>,

    #[serde(default)]
    pub ignore_universal_confs: bool,

    /// "offline" hosts are skipped unless `--ignore-deployment-state`.
    #[serde(default)]
    pub host_state: Option<String>,

    /// Tags assigning the host to universal group directories.
    #[serde(default)]
    pub group_tags: Vec<String>,
}

/// Fully resolved connection settings for one host.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub name: String,
    pub endpoint: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub use_ssh_agent: bool,
    pub password: Option<String>,
    pub transfer_buffer: String,
    pub backup_dir: String,
    pub ignore_universal_confs: bool,
    pub offline: bool,
    pub group_tags: Vec<String>,
}

fn default_known_hosts() -> PathBuf {
    PathBuf::from("~/.ssh/known_hosts")
}

fn default_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_user() -> String {
    "root".to_string()
}

fn default_transfer_buffer() -> String {
    DEFAULT_TRANSFER_BUFFER.to_string()
}

fn default_backup_dir() -> String {
    DEFAULT_BACKUP_DIR.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, FatalError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FatalError::ConfigInvalid(format!("could not read `{}`: {}", path.display(), e))
        })?;
        Config::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, FatalError> {
        let mut cfg: Config = serde_yaml::from_str(raw)
            .map_err(|e| FatalError::ConfigInvalid(e.to_string()))?;
        cfg.repository_path = expand_tilde(&cfg.repository_path);
        cfg.known_hosts_file = expand_tilde(&cfg.known_hosts_file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), FatalError> {
        if self.max_ssh_concurrency == 0 {
            return Err(FatalError::ConfigInvalid(
                "MaxSSHConcurrency must be at least 1".to_string(),
            ));
        }
        if let Some(universal) = &self.universal_directory {
            if self.hosts.contains_key(universal) {
                return Err(FatalError::ConfigInvalid(format!(
                    "UniversalDirectory `{}` is also a configured host",
                    universal
                )));
            }
        }
        for group in self.universal_groups.keys() {
            if self.hosts.contains_key(group) {
                return Err(FatalError::ConfigInvalid(format!(
                    "universal group `{}` is also a configured host",
                    group
                )));
            }
        }
        Ok(())
    }

    pub fn host_settings(&self, name: &str) -> Option<HostSettings> {
        let overrides = self.hosts.get(name)?;
        let defaults = &self.host_defaults;
        Some(HostSettings {
            name: name.to_string(),
            endpoint: overrides.endpoint.clone().unwrap_or_else(|| name.to_string()),
            port: overrides.port.unwrap_or(defaults.port),
            user: overrides.user.clone().unwrap_or_else(|| defaults.user.clone()),
            identity_file: overrides
                .identity_file
                .clone()
                .or_else(|| defaults.identity_file.clone())
                .map(|p| expand_tilde(&p)),
            use_ssh_agent: overrides.use_ssh_agent.unwrap_or(defaults.use_ssh_agent),
            password: overrides.password.clone().or_else(|| defaults.password.clone()),
            transfer_buffer: overrides
                .remote_transfer_buffer
                .clone()
                .unwrap_or_else(|| defaults.remote_transfer_buffer.clone()),
            backup_dir: overrides
                .remote_backup_dir
                .clone()
                .unwrap_or_else(|| defaults.remote_backup_dir.clone()),
            ignore_universal_confs: overrides.ignore_universal_confs,
            offline: overrides
                .host_state
                .as_deref()
                .map_or(false, |s| s.eq_ignore_ascii_case("offline")),
            group_tags: overrides.group_tags.clone(),
        })
    }

    pub fn is_host_dir(&self, top: &str) -> bool {
        self.hosts.contains_key(top)
    }

    pub fn is_universal_dir(&self, top: &str) -> bool {
        self.universal_directory.as_deref() == Some(top)
    }

    pub fn is_group_dir(&self, top: &str) -> bool {
        self.universal_groups.contains_key(top)
    }

    pub fn is_ignored_dir(&self, top: &str) -> bool {
        self.ignore_directories.iter().any(|d| d == top)
    }

    /// Group directories the named host belongs to. Membership: the group's
    /// member list names the host itself or intersects its GroupTags.
    pub fn groups_for_host(&self, host: &str) -> Vec<&str> {
        let tags = self
            .hosts
            .get(host)
            .map(|h| h.group_tags.as_slice())
            .unwrap_or(&[]);
        self.universal_groups
            .iter()
            .filter(|(_, members)| {
                members
                    .iter()
                    .any(|m| m == host || tags.iter().any(|t| t == m))
            })
            .map(|(dir, _)| dir.as_str())
            .collect()
    }
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = match path.to_str() {
        Some(s) => s,
        None => return path.to_path_buf(),
    };
    if s == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
RepositoryPath: /srv/configs
KnownHostsFile: /home/deployer/.ssh/known_hosts
MaxSSHConcurrency: 4
UniversalDirectory: UniversalConfs
UniversalGroups:
  UniversalConfs_Web:
    - web
IgnoreDirectories:
  - docs
HostDefaults:
  Port: 22
  User: deployer
  RemoteTransferBuffer: /tmp/buf
  RemoteBackupDir: /tmp/backups
Hosts:
  webA:
    GroupTags: [web]
  webB:
    Endpoint: 10.0.0.2
    Port: 2222
    User: root
    HostState: offline
    IgnoreUniversalConfs: true
  db1: {}
"#;

    #[test]
    fn parses_and_resolves_overrides() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.max_ssh_concurrency, 4);

        let a = cfg.host_settings("webA").unwrap();
        assert_eq!(a.endpoint, "webA");
        assert_eq!(a.port, 22);
        assert_eq!(a.user, "deployer");
        assert!(!a.offline);
        assert_eq!(a.transfer_buffer, "/tmp/buf");

        let b = cfg.host_settings("webB").unwrap();
        assert_eq!(b.endpoint, "10.0.0.2");
        assert_eq!(b.port, 2222);
        assert_eq!(b.user, "root");
        assert!(b.offline);
        assert!(b.ignore_universal_confs);

        assert!(cfg.host_settings("nosuch").is_none());
    }

    #[test]
    fn classifies_top_level_directories() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert!(cfg.is_host_dir("webA"));
        assert!(cfg.is_universal_dir("UniversalConfs"));
        assert!(cfg.is_group_dir("UniversalConfs_Web"));
        assert!(cfg.is_ignored_dir("docs"));
        assert!(!cfg.is_host_dir("UniversalConfs"));
    }

    #[test]
    fn group_membership_via_tags_and_names() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.groups_for_host("webA"), vec!["UniversalConfs_Web"]);
        assert!(cfg.groups_for_host("db1").is_empty());

        // A group may also name the host directly.
        let raw = SAMPLE.replace("- web\n", "- web\n    - db1\n");
        let cfg = Config::parse(&raw).unwrap();
        assert_eq!(cfg.groups_for_host("db1"), vec!["UniversalConfs_Web"]);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let raw = SAMPLE.replace("MaxSSHConcurrency: 4", "MaxSSHConcurrency: 0");
        assert!(matches!(
            Config::parse(&raw),
            Err(FatalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_universal_directory_clashing_with_host() {
        let raw = SAMPLE.replace("UniversalDirectory: UniversalConfs", "UniversalDirectory: webA");
        assert!(matches!(
            Config::parse(&raw),
            Err(FatalError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn tilde_expansion_uses_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_tilde(Path::new("~/.ssh/known_hosts")),
            PathBuf::from("/home/tester/.ssh/known_hosts")
        );
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
