/// Process-wide registry of verified SSH host keys.
///
/// The configured known-hosts file is parsed once at startup. Lookups
/// support both plain entries (`host1,host2 alg key`) and OpenSSH's hashed
/// form (`|1|b64(salt)|b64(HMAC-SHA1(salt, host)) alg key`). Unknown hosts
/// are key-scanned and the operator is asked once, behind a mutex so
/// concurrent workers cannot interleave prompts; accepted keys are appended
/// to the file as fresh hashed entries.
use crate::error::{FatalError, SshError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process;
use tracing::{info, warn};

type HmacSha1 = Hmac<Sha1>;

const HASH_MAGIC: &str = "|1|";
const SALT_LEN: usize = 20;

#[derive(Debug)]
enum HostPattern {
    Hashed { salt: Vec<u8>, mac: Vec<u8> },
    Plain(Vec<String>),
}

#[derive(Debug)]
struct KnownHostEntry {
    pattern: HostPattern,
    key_alg: String,
    key_b64: String,
}

struct RegistryState {
    entries: Vec<KnownHostEntry>,
    /// Set when the operator answers "all": later unknown hosts are
    /// accepted without another prompt.
    accept_all: bool,
}

pub struct HostKeyRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
    prompt_gate: tokio::sync::Mutex<()>,
}

impl HostKeyRegistry {
    /// Parses the known-hosts file. A missing file is an empty registry;
    /// the file is created on the first accepted key.
    pub fn load(path: &Path) -> Result<HostKeyRegistry, FatalError> {
        let mut entries = Vec::new();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                for line in raw.lines() {
                    if let Some(entry) = parse_line(line) {
                        entries.push(entry);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FatalError::ConfigInvalid(format!(
                    "could not read known-hosts file `{}`: {}",
                    path.display(),
                    e
                )))
            }
        }
        Ok(HostKeyRegistry {
            path: path.to_path_buf(),
            state: Mutex::new(RegistryState {
                entries,
                accept_all: false,
            }),
            prompt_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn is_known(&self, host: &str) -> bool {
        let cleaned = clean_host(host);
        let state = self.state.lock().expect("known-hosts mutex poisoned");
        state.entries.iter().any(|e| entry_matches(e, &cleaned))
    }

    /// Verifies the host before a connection is dialed. Unknown hosts are
    /// scanned and prompted for; refusal fails the handshake.
    pub async fn ensure_known(&self, host: &str, port: u16) -> Result<(), SshError> {
        if self.is_known(host) {
            return Ok(());
        }

        let _gate = self.prompt_gate.lock().await;
        // A concurrent worker may have verified the same address while we
        // waited on the gate.
        if self.is_known(host) {
            return Ok(());
        }

        let (alg, key_b64) = keyscan(host, port).await?;
        let accept_all = {
            let state = self.state.lock().expect("known-hosts mutex poisoned");
            state.accept_all
        };
        if !accept_all {
            match prompt_for_key(host, &alg, &key_b64).await? {
                PromptAnswer::Yes => {}
                PromptAnswer::All => {
                    let mut state = self.state.lock().expect("known-hosts mutex poisoned");
                    state.accept_all = true;
                }
                PromptAnswer::No => {
                    return Err(SshError::AuthFailure {
                        host: host.to_string(),
                        reason: "host key rejected by operator".to_string(),
                    });
                }
            }
        } else {
            info!(host, "accepting host key (blanket accept in effect)");
        }

        self.record_accepted(host, &alg, &key_b64)
            .map_err(|e| SshError::AuthFailure {
                host: host.to_string(),
                reason: format!("could not record accepted host key: {}", e),
            })
    }

    /// Appends a freshly salted hashed entry for the host, both in memory
    /// and in the known-hosts file. A second acceptance of the same
    /// host/key pair is a no-op.
    pub fn record_accepted(&self, host: &str, alg: &str, key_b64: &str) -> std::io::Result<()> {
        let cleaned = clean_host(host);
        {
            let state = self.state.lock().expect("known-hosts mutex poisoned");
            let already = state.entries.iter().any(|e| {
                entry_matches(e, &cleaned) && e.key_alg == alg && e.key_b64 == key_b64
            });
            if already {
                return Ok(());
            }
        }
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mac = hash_host(&salt, &cleaned);
        let line = format!(
            "{}{}|{} {} {}",
            HASH_MAGIC,
            BASE64.encode(&salt),
            BASE64.encode(&mac),
            alg,
            key_b64
        );

        let mut state = self.state.lock().expect("known-hosts mutex poisoned");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        state.entries.push(KnownHostEntry {
            pattern: HostPattern::Hashed { salt, mac },
            key_alg: alg.to_string(),
            key_b64: key_b64.to_string(),
        });
        info!(host, alg, "added host key to {}", self.path.display());
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<KnownHostEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    let hosts_field = fields.next()?;
    let key_alg = fields.next()?.to_string();
    let key_b64 = fields.next()?.to_string();

    let pattern = if let Some(rest) = hosts_field.strip_prefix(HASH_MAGIC) {
        let (salt_b64, mac_b64) = rest.split_once('|')?;
        let salt = BASE64.decode(salt_b64).ok()?;
        let mac = BASE64.decode(mac_b64).ok()?;
        HostPattern::Hashed { salt, mac }
    } else {
        HostPattern::Plain(hosts_field.split(',').map(|s| s.to_string()).collect())
    };

    Some(KnownHostEntry {
        pattern,
        key_alg,
        key_b64,
    })
}

fn entry_matches(entry: &KnownHostEntry, cleaned_host: &str) -> bool {
    match &entry.pattern {
        HostPattern::Hashed { salt, mac } => hash_host(salt, cleaned_host) == *mac,
        HostPattern::Plain(names) => names.iter().any(|n| clean_host(n) == cleaned_host),
    }
}

/// HMAC-SHA1 of the hostname, keyed by the entry's salt (OpenSSH hashed
/// known-hosts scheme).
fn hash_host(salt: &[u8], host: &str) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(host.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Strips IPv6 brackets and a bracketed-form port suffix.
fn clean_host(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    host.to_string()
}

enum PromptAnswer {
    Yes,
    No,
    All,
}

async fn prompt_for_key(host: &str, alg: &str, key_b64: &str) -> Result<PromptAnswer, SshError> {
    let fingerprint = key_fingerprint(key_b64);
    eprintln!(
        "The authenticity of host `{}` can't be established.\n{} key fingerprint is {}.",
        host, alg, fingerprint
    );
    eprint!("Accept and add to known hosts? (yes/no/all): ");
    let answer = tokio::task::spawn_blocking(|| {
        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf).map(|_| buf)
    })
    .await
    .map_err(|e| SshError::AuthFailure {
        host: host.to_string(),
        reason: format!("prompt task failed: {}", e),
    })?
    .map_err(|e| SshError::AuthFailure {
        host: host.to_string(),
        reason: format!("could not read prompt answer: {}", e),
    })?;

    match answer.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" => Ok(PromptAnswer::Yes),
        "all" | "a" => Ok(PromptAnswer::All),
        _ => Ok(PromptAnswer::No),
    }
}

fn key_fingerprint(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(raw) => {
            let mut hasher = Sha256::new();
            hasher.update(&raw);
            let digest = BASE64.encode(hasher.finalize());
            format!("SHA256:{}", digest.trim_end_matches('='))
        }
        Err(_) => "(unfingerprintable key)".to_string(),
    }
}

/// Fetches the host's key with `ssh-keyscan`, pinned to ED25519 so a single
/// key type is presented across runs.
async fn keyscan(host: &str, port: u16) -> Result<(String, String), SshError> {
    let out = process::Command::new("ssh-keyscan")
        .arg("-t")
        .arg("ed25519")
        .arg("-p")
        .arg(port.to_string())
        .arg(host)
        .output()
        .await
        .map_err(|e| SshError::Connect {
            host: host.to_string(),
            reason: format!("could not execute ssh-keyscan: {}", e),
        })?;
    if !out.status.success() {
        return Err(SshError::Connect {
            host: host.to_string(),
            reason: format!(
                "ssh-keyscan failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        });
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    for line in stdout.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(_), Some(alg), Some(key)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        return Ok((alg.to_string(), key.to_string()));
    }
    warn!(host, "ssh-keyscan returned no usable key");
    Err(SshError::Connect {
        host: host.to_string(),
        reason: "ssh-keyscan returned no usable key".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashed_line_for(host: &str, salt: &[u8]) -> String {
        let mac = hash_host(salt, host);
        format!(
            "{}{}|{} ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDfakekeyfakekeyfakekeyfakekey",
            HASH_MAGIC,
            BASE64.encode(salt),
            BASE64.encode(mac)
        )
    }

    fn registry_with_lines(dir: &tempfile::TempDir, lines: &[String]) -> HostKeyRegistry {
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, lines.join("\n")).unwrap();
        HostKeyRegistry::load(&path).unwrap()
    }

    #[test]
    fn hashed_entry_matches_only_its_host() {
        let dir = tempfile::tempdir().unwrap();
        let salt = [7u8; SALT_LEN];
        let registry = registry_with_lines(&dir, &[hashed_line_for("10.0.0.5", &salt)]);
        assert!(registry.is_known("10.0.0.5"));
        assert!(!registry.is_known("10.0.0.6"));
    }

    #[test]
    fn ipv6_brackets_are_stripped_before_matching() {
        let dir = tempfile::tempdir().unwrap();
        let salt = [9u8; SALT_LEN];
        let registry = registry_with_lines(&dir, &[hashed_line_for("fe80::1", &salt)]);
        assert!(registry.is_known("[fe80::1]"));
        assert!(registry.is_known("[fe80::1]:2222"));
    }

    #[test]
    fn plain_entries_match_by_name_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_lines(
            &dir,
            &["webA,10.0.0.1 ssh-ed25519 AAAAkey".to_string()],
        );
        assert!(registry.is_known("webA"));
        assert!(registry.is_known("10.0.0.1"));
        assert!(!registry.is_known("webB"));
    }

    #[test]
    fn comments_markers_and_garbage_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_lines(
            &dir,
            &[
                "# comment".to_string(),
                "@revoked webX ssh-ed25519 AAAA".to_string(),
                "short-line".to_string(),
                "webA ssh-ed25519 AAAAkey".to_string(),
            ],
        );
        assert!(registry.is_known("webA"));
        assert!(!registry.is_known("webX"));
    }

    #[test]
    fn missing_file_is_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HostKeyRegistry::load(&dir.path().join("absent")).unwrap();
        assert!(!registry.is_known("anything"));
    }

    #[test]
    fn record_accepted_round_trips_through_a_fresh_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let registry = HostKeyRegistry::load(&path).unwrap();
        registry
            .record_accepted("10.1.2.3", "ssh-ed25519", "AAAAkeymaterial")
            .unwrap();
        assert!(registry.is_known("10.1.2.3"));

        // The appended line must be a parseable hashed entry.
        let reloaded = HostKeyRegistry::load(&path).unwrap();
        assert!(reloaded.is_known("10.1.2.3"));
        assert!(!reloaded.is_known("10.1.2.4"));
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with(HASH_MAGIC));
    }

    #[test]
    fn accepting_the_same_key_twice_appends_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let registry = HostKeyRegistry::load(&path).unwrap();
        registry
            .record_accepted("10.1.2.3", "ssh-ed25519", "AAAAkeymaterial")
            .unwrap();
        registry
            .record_accepted("10.1.2.3", "ssh-ed25519", "AAAAkeymaterial")
            .unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }
}
