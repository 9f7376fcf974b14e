/// SSH utilities: one multiplexed session per host with the typed remote
/// primitives the deployment state machine is built from.
use crate::config::HostSettings;
use crate::error::SshError;
use crate::known_hosts::HostKeyRegistry;
use once_cell::sync::Lazy;
use openssh::{KnownHosts, SessionBuilder, Stdio};
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Stat/existence probes.
pub const TIMEOUT_STAT: Duration = Duration::from_secs(10);
/// Mutating one-liners: cp, mv, rm, mkdir, ln, chown, chmod.
pub const TIMEOUT_MUTATE: Duration = Duration::from_secs(30);
/// Hashing, uploads, and check commands.
pub const TIMEOUT_TRANSFER: Duration = Duration::from_secs(90);
/// Reload and install commands.
pub const TIMEOUT_RELOAD: Duration = Duration::from_secs(180);

static SHA256_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[0-9a-f]{64}").unwrap());

#[derive(Debug)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: Option<i32>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit == Some(0)
    }

    fn collect(stdout: Vec<u8>, stderr: Vec<u8>, exit: Option<i32>) -> CmdOutput {
        CmdOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit,
        }
    }
}

pub struct RemoteClient {
    session: openssh::Session,
    host: String,
    /// Privilege escalation for mutating commands; uploads stay unprivileged.
    sudo: bool,
    sudo_password: Option<String>,
}

impl RemoteClient {
    /// Verifies the host key through the registry, then dials. The session
    /// is started strict against the registry's file, so the handshake can
    /// only agree with what the registry verified.
    pub async fn connect(
        settings: &HostSettings,
        registry: &HostKeyRegistry,
        escalate: bool,
    ) -> Result<RemoteClient, SshError> {
        registry.ensure_known(&settings.endpoint, settings.port).await?;

        info!(host = %settings.name, endpoint = %settings.endpoint, "establishing SSH session");
        let mut builder = SessionBuilder::default();
        builder
            .user(settings.user.clone())
            .port(settings.port)
            .known_hosts_check(KnownHosts::Strict)
            .user_known_hosts_file(registry.file_path())
            .control_directory("/tmp") // Default is "./", which litters the repository.
            .connect_timeout(Duration::from_secs(30));
        if let Some(identity) = &settings.identity_file {
            builder.keyfile(identity);
        }
        if settings.use_ssh_agent {
            if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
                builder.ssh_auth_sock(sock);
            }
        }
        let session = builder
            .connect(&settings.endpoint)
            .await
            .map_err(|e| SshError::Connect {
                host: settings.name.clone(),
                reason: e.to_string(),
            })?;
        info!(host = %settings.name, "SSH session established");

        Ok(RemoteClient {
            session,
            host: settings.name.clone(),
            sudo: escalate,
            sudo_password: settings.password.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs a command under the client's escalation setting. Transport and
    /// timeout problems are errors; a non-zero exit is reported in the
    /// returned [`CmdOutput`] so callers can interpret stderr themselves.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<CmdOutput, SshError> {
        self.exec(command, timeout, self.sudo).await
    }

    /// Like [`run`](Self::run), but additionally fails on a non-zero exit
    /// or any stderr output.
    pub async fn run_ok(&self, command: &str, timeout: Duration) -> Result<CmdOutput, SshError> {
        let out = self.run(command, timeout).await?;
        if !out.success() || !out.stderr.trim().is_empty() {
            return Err(SshError::RemoteCommand {
                command: command.to_string(),
                exit: out.exit,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        escalate: bool,
    ) -> Result<CmdOutput, SshError> {
        let full = if escalate {
            // -S reads the password from stdin exactly once; -k drops any
            // cached credential so the read is deterministic.
            format!("sudo -S -k -p '' sh -c {}", quote(command))
        } else {
            format!("sh -c {}", quote(command))
        };
        debug!(host = %self.host, %command, "running remote command");
        let deadline = tokio::time::Instant::now() + timeout;

        let mut remote = self.session.raw_command(&full);
        remote
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = remote.spawn().await.map_err(|e| SshError::RemoteCommand {
            command: command.to_string(),
            exit: None,
            stderr: format!("could not spawn remote command: {}", e),
        })?;

        if let Some(mut stdin) = child.stdin().take() {
            if escalate {
                if let Some(password) = &self.sudo_password {
                    let mut line = password.clone();
                    line.push('\n');
                    let _ = stdin.write_all(line.as_bytes()).await;
                }
            }
            // Dropping the handle closes the remote stdin.
            drop(stdin);
        }

        let timed_out = || SshError::Timeout {
            command: command.to_string(),
            seconds: timeout.as_secs(),
        };
        let broke = |e: String| SshError::RemoteCommand {
            command: command.to_string(),
            exit: None,
            stderr: e,
        };

        // Drain both pipes under the deadline while the child handle stays
        // in hand, so a hung command can still be terminated.
        let mut stdout_pipe = child.stdout().take();
        let mut stderr_pipe = child.stderr().take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let drain = async {
            tokio::try_join!(
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        pipe.read_to_end(&mut stdout).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        pipe.read_to_end(&mut stderr).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
            )?;
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout_at(deadline, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.disconnect().await;
                return Err(broke(e.to_string()));
            }
            Err(_) => {
                // Sever the channel so the remote command loses its stdio
                // and is not left attached to a dead run.
                let _ = child.disconnect().await;
                return Err(timed_out());
            }
        }

        // Both pipes are at EOF, so the exit status is imminent.
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => Ok(CmdOutput::collect(stdout, stderr, status.code())),
            Ok(Err(e)) => Err(broke(e.to_string())),
            Err(_) => Err(timed_out()),
        }
    }

    /// Streams bytes into `remote_path` through the session. The caller is
    /// expected to point this at the unprivileged transfer buffer; the
    /// privileged move onto the real target happens separately. Any failure
    /// kills the receiver and scrubs the partially written buffer.
    pub async fn upload(&self, bytes: &[u8], remote_path: &str) -> Result<(), SshError> {
        debug!(host = %self.host, path = %remote_path, len = bytes.len(), "uploading");
        let deadline = tokio::time::Instant::now() + TIMEOUT_TRANSFER;
        let receiver = format!("sh -c {}", quote(&format!("cat > {}", quote(remote_path))));
        let mut remote = self.session.raw_command(&receiver);
        remote
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = remote.spawn().await.map_err(|e| SshError::Transport {
            path: remote_path.to_string(),
            reason: format!("could not spawn receiver: {}", e),
        })?;

        let mut stdin = child.stdin().take().ok_or_else(|| SshError::Transport {
            path: remote_path.to_string(),
            reason: "receiver has no stdin".to_string(),
        })?;
        let mut stderr_pipe = child.stderr().take();
        let mut stderr = Vec::new();

        let timed_out = || SshError::Timeout {
            command: format!("upload to {}", remote_path),
            seconds: TIMEOUT_TRANSFER.as_secs(),
        };
        let broke = |reason: String| SshError::Transport {
            path: remote_path.to_string(),
            reason,
        };

        let feed = async {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
            drop(stdin);
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        match tokio::time::timeout_at(deadline, feed).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.disconnect().await;
                self.scrub_buffer(remote_path).await;
                return Err(broke(e.to_string()));
            }
            Err(_) => {
                // Kill the receiver before reporting; a live `cat` would
                // keep writing the buffer underneath the next attempt.
                let _ = child.disconnect().await;
                self.scrub_buffer(remote_path).await;
                return Err(timed_out());
            }
        }

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(_)) => {
                self.scrub_buffer(remote_path).await;
                Err(broke(String::from_utf8_lossy(&stderr).trim().to_string()))
            }
            Ok(Err(e)) => {
                self.scrub_buffer(remote_path).await;
                Err(broke(e.to_string()))
            }
            Err(_) => {
                self.scrub_buffer(remote_path).await;
                Err(timed_out())
            }
        }
    }

    /// Best-effort removal of a partially written transfer buffer after a
    /// failed upload, so the next attempt starts from nothing.
    async fn scrub_buffer(&self, remote_path: &str) {
        let command = format!("rm -f {}", quote(remote_path));
        if let Err(e) = self.exec(&command, TIMEOUT_MUTATE, false).await {
            debug!(host = %self.host, path = %remote_path, "could not scrub transfer buffer: {}", e);
        }
    }

    /// `ls -l`/`ls -ld` probe. "No such file or directory" on stderr is the
    /// canonical non-error miss; anything else unexpected is an error.
    pub async fn exists(&self, path: &str, is_dir: bool) -> Result<(bool, String), SshError> {
        let flag = if is_dir { "-ld" } else { "-l" };
        let command = format!("ls {} {}", flag, quote(path));
        let out = self.run(&command, TIMEOUT_STAT).await?;
        if out.success() {
            let line = out.stdout.lines().next().unwrap_or("").to_string();
            return Ok((true, line));
        }
        if out.stderr.contains("No such file or directory") {
            return Ok((false, String::new()));
        }
        Err(SshError::RemoteCommand {
            command,
            exit: out.exit,
            stderr: out.stderr.trim().to_string(),
        })
    }

    /// Remote SHA-256 via `sha256sum`.
    pub async fn hash(&self, path: &str) -> Result<String, SshError> {
        let command = format!("sha256sum {}", quote(path));
        let out = self.run_ok(&command, TIMEOUT_TRANSFER).await?;
        extract_sha256(&out.stdout).ok_or_else(|| SshError::RemoteCommand {
            command,
            exit: out.exit,
            stderr: format!("unexpected sha256sum output: {}", out.stdout.trim()),
        })
    }

    pub async fn close(self) {
        if let Err(e) = self.session.close().await {
            debug!(host = %self.host, "session close failed: {}", e);
        }
    }
}

/// First word of `sha256sum` output, accepted only as exactly 64 hex chars
/// at the start.
pub(crate) fn extract_sha256(output: &str) -> Option<String> {
    SHA256_RE.find(output).map(|m| m.as_str().to_string())
}

pub(crate) fn quote(raw: &str) -> String {
    match shlex::try_quote(raw) {
        Ok(quoted) => quoted.into_owned(),
        // Only NUL bytes are unquotable; a path carrying one can never be
        // valid remotely either, so pass it through to fail there.
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_extractor_wants_exactly_64_hex_at_start() {
        let digest = "a".repeat(64);
        let line = format!("{}  /etc/hosts", digest);
        assert_eq!(extract_sha256(&line), Some(digest.clone()));
        assert_eq!(extract_sha256(&format!(" {}", digest)), None);
        assert_eq!(extract_sha256(&digest[..63]), None);
        assert_eq!(extract_sha256("sha256sum: missing operand"), None);
    }

    #[test]
    fn sha256_extractor_takes_prefix_of_longer_word() {
        let line = format!("{}extra", "b".repeat(64));
        assert_eq!(extract_sha256(&line), Some("b".repeat(64)));
    }

    #[test]
    fn quote_wraps_shell_metacharacters() {
        assert_eq!(quote("/etc/hosts"), "/etc/hosts");
        let quoted = quote("/etc/with space/and'quote");
        assert!(quoted.contains("with space"));
        assert_ne!(quoted, "/etc/with space/and'quote");
    }

    #[test]
    fn cmd_output_success_requires_zero_exit() {
        let ok = CmdOutput { stdout: String::new(), stderr: String::new(), exit: Some(0) };
        let bad = CmdOutput { stdout: String::new(), stderr: String::new(), exit: Some(2) };
        let gone = CmdOutput { stdout: String::new(), stderr: String::new(), exit: None };
        assert!(ok.success());
        assert!(!bad.success());
        assert!(!gone.success());
    }
}
