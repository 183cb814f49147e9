//! Remote shell sessions against cluster nodes.
//!
//! Two usage paths:
//! - `RemoteSession`: a reusable, lazily-connected handle owned by exactly
//!   one component (the node probe keeps one against the local node).
//!   Callers re-validate liveness and reconnect on their own schedule; the
//!   session never retries internally.
//! - `run_once` / `exec_on_node`: ad hoc one-shot commands against
//!   arbitrary hosts, credentials resolved through the controller
//!   configuration cache, connection always closed afterwards.
//!
//! Command execution is blocking by contract: a long-running remote command
//! stalls its caller (async callers go through `spawn_blocking`).

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use ssh2::Session;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::policy::ConfigPolicyCache;

/// Fallback SSH user for the dedicated per-node session.
pub const DEFAULT_SSH_USER: &str = "root";

/// Node-local private key used for all handshakes.
pub const PRIVATE_KEY_PATH: &str = "/root/.ssh/id_rsa";

/// Default SSH port on cluster nodes.
pub const DEFAULT_SSH_PORT: u16 = 22;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls slower than this (or issued on a connection older than this)
/// get their timing log elevated by one level.
const SLOW_THRESHOLD: Duration = Duration::from_secs(2);

/// Output embedded in log lines is cut at this many bytes.
const LOG_OUTPUT_LIMIT: usize = 40_000;

const HOST_KEY_WARNING_HEAD: &str = "Warning: Permanently added";
const HOST_KEY_WARNING_TAIL: &str = "to the list of known hosts.";

#[derive(Debug, Error)]
pub enum SshError {
    /// `run` was called on a handle with no live connection.
    #[error("{0} please init ssh connection first")]
    NotConnected(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ssh error on {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: ssh2::Error,
    },
    #[error("read command output from {addr} failed: {source}")]
    Output {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of one remote command. A non-zero exit is not an error
/// at this layer; callers decide what counts as success.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    /// Stderr with the informational host-key warning stripped (when its
    /// closing phrase was also present, see `strip_host_key_warning`).
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Reusable remote shell handle against one host.
pub struct RemoteSession {
    user: String,
    host: String,
    port: u16,
    tag: String,
    session: Option<Session>,
    created_at: Instant,
    counter: u64,
}

impl RemoteSession {
    /// Builds a handle with no live connection. Never fails.
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        tags: &[&str],
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            tag: format_tag(tags),
            session: None,
            created_at: Instant::now(),
            counter: 0,
        }
    }

    /// Handle against `host` with the default user and port.
    pub fn for_host(host: impl Into<String>, tags: &[&str]) -> Self {
        Self::new(DEFAULT_SSH_USER, host, DEFAULT_SSH_PORT, tags)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Commands executed on the current connection so far.
    pub fn command_count(&self) -> u64 {
        self.counter
    }

    pub fn set_tags(&mut self, tags: &[&str]) {
        self.tag = format_tag(tags);
    }

    /// Restarts the connection-age clock (the slow-call heuristic measures
    /// from here).
    pub fn reset_age(&mut self) {
        self.created_at = Instant::now();
        self.counter = 0;
    }

    /// Performs a fresh handshake, replacing any existing connection.
    ///
    /// Host keys are accepted without verification: nodes live on the
    /// platform's internal management network and are reimaged freely, so
    /// key pinning is deliberately not enforced here.
    pub fn connect(&mut self) -> Result<(), SshError> {
        if self.session.is_some() {
            self.release();
        }
        let start = Instant::now();
        let addr = format!("{}:{}", self.host, self.port);
        info!("{} opening ssh connection to {addr}...", self.tag);

        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|source| SshError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| SshError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "hostname did not resolve",
                ),
            })?;
        let tcp = TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT).map_err(|source| {
            error!("{} connect to {addr} failed: {source}", self.tag);
            SshError::Connect {
                addr: addr.clone(),
                source,
            }
        })?;

        let protocol = |source: ssh2::Error| SshError::Protocol {
            addr: addr.clone(),
            source,
        };
        let mut session = Session::new().map_err(protocol)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session.handshake().map_err(protocol)?;
        session
            .userauth_pubkey_file(&self.user, None, Path::new(PRIVATE_KEY_PATH), None)
            .map_err(protocol)?;
        // No further client-side timeout: a long remote command is allowed
        // to hold its caller.
        session.set_timeout(0);

        info!(
            "{} ssh connection to {addr} ready in {:.2}s",
            self.tag,
            start.elapsed().as_secs_f64()
        );
        self.session = Some(session);
        self.created_at = Instant::now();
        self.counter = 0;
        Ok(())
    }

    /// Cheap liveness probe: opens and closes a remote channel.
    pub fn is_alive(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        match session.channel_session() {
            Ok(mut channel) => {
                let _ = channel.close();
                true
            }
            Err(_) => false,
        }
    }

    /// Reconnects when the handle has no live connection or the liveness
    /// probe fails. Errors are returned to the caller, who retries on its
    /// own schedule.
    pub fn ensure_connected(&mut self) -> Result<(), SshError> {
        if self.is_alive() {
            return Ok(());
        }
        self.connect()
    }

    /// Runs one command over a short-lived channel on the current
    /// connection, capturing stdout and stderr separately.
    ///
    /// `verbose` raises the timing log to info; slow calls (see
    /// `SLOW_THRESHOLD`) are raised regardless. With `auto_close` the
    /// connection is released afterwards even on failure.
    pub fn run(
        &mut self,
        command: &str,
        auto_close: bool,
        verbose: bool,
    ) -> Result<RunOutput, SshError> {
        let result = self.run_on_channel(command, verbose);
        if auto_close {
            self.release();
        }
        result
    }

    fn run_on_channel(&mut self, command: &str, verbose: bool) -> Result<RunOutput, SshError> {
        let Some(session) = self.session.as_ref() else {
            error!(
                "{} please init ssh connection on [{}] first!",
                self.tag, self.host
            );
            return Err(SshError::NotConnected(self.tag.clone()));
        };

        let addr = format!("{}:{}", self.host, self.port);
        let start = Instant::now();
        let protocol = |source: ssh2::Error| SshError::Protocol {
            addr: addr.clone(),
            source,
        };
        let output_err = |source: std::io::Error| SshError::Output {
            addr: addr.clone(),
            source,
        };

        let mut channel = session.channel_session().map_err(|e| {
            error!("{} ssh open channel on [{}] err: {e}", self.tag, self.host);
            protocol(e)
        })?;
        self.counter += 1;

        channel.exec(command).map_err(protocol)?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(output_err)?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(output_err)?;
        let _ = channel.wait_close();
        let exit_code = channel.exit_status().ok();

        let stderr = strip_host_key_warning(&stderr);

        let call_spend = start.elapsed();
        let total_spend = self.created_at.elapsed();
        let slow = call_spend >= SLOW_THRESHOLD || total_spend >= SLOW_THRESHOLD;
        let stdout_line = flatten_for_log(&stdout);
        let stderr_line = flatten_for_log(&stderr);
        if verbose || slow {
            info!(
                "{} runSsh:{} cost[{:.2}s],total[{:.2}s] command [{command}]:[{}], out:[[{stdout_line}]], errOut:[[{stderr_line}]], exit:[{exit_code:?}]",
                self.tag,
                self.counter,
                call_spend.as_secs_f64(),
                total_spend.as_secs_f64(),
                self.host,
            );
        } else {
            debug!(
                "{} runSsh:{} cost[{:.2}s],total[{:.2}s] command [{command}]:[{}], out:[[{stdout_line}]], errOut:[[{stderr_line}]], exit:[{exit_code:?}]",
                self.tag,
                self.counter,
                call_spend.as_secs_f64(),
                total_spend.as_secs_f64(),
                self.host,
            );
        }

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Closes the underlying connection if present. Idempotent.
    pub fn release(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("{} closing ssh connection to {}...", self.tag, self.host);
            let _ = session.disconnect(None, "session released", None);
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Runs one command on `host` over a one-shot connection. Credentials come
/// from the controller configuration; the connection is always closed
/// before returning.
pub async fn run_once(
    policy: &ConfigPolicyCache,
    command: &str,
    host: &str,
    tags: &[&str],
) -> anyhow::Result<RunOutput> {
    use anyhow::Context;

    let tag = format_tag(tags);
    let config = policy.get().await.map_err(|err| {
        error!("{tag} runSsh command [{command}] failed, get ssh user error: {err:#}");
        err
    })?;

    info!("{tag} runSsh command [{command}] on [{host}]");
    let user = config.ssh_user;
    let host = host.to_string();
    let command = command.to_string();
    let join = tokio::task::spawn_blocking(move || {
        let mut session = RemoteSession::new(user, host, DEFAULT_SSH_PORT, &[]);
        session.tag = tag;
        session.connect()?;
        session.run(&command, true, true)
    })
    .await
    .context("ssh command task panicked")?;
    Ok(join?)
}

/// Runs `commands` in order on `host`, treating each as failed when the
/// caller-supplied predicate over (stdout, error) rejects it.
pub async fn exec_on_node<F>(
    policy: &ConfigPolicyCache,
    host: &str,
    commands: &[&str],
    check_succeeded: F,
) -> anyhow::Result<()>
where
    F: Fn(&str, Option<&str>) -> bool,
{
    for command in commands {
        let (stdout, error) = match run_once(policy, command, host, &[]).await {
            Ok(output) => {
                let error = if !output.stderr.trim().is_empty() {
                    Some(output.stderr.trim().to_string())
                } else {
                    match output.exit_code {
                        Some(0) | None => None,
                        Some(code) => Some(format!("command exited with status {code}")),
                    }
                };
                (output.stdout, error)
            }
            Err(err) => (String::new(), Some(format!("{err:#}"))),
        };
        if !check_succeeded(&stdout, error.as_deref()) {
            let detail = error.unwrap_or_default();
            error!("execute cmd [{command}] result: [{stdout}], [{detail}]");
            anyhow::bail!("execute cmd [{command}] failed: {detail}");
        }
    }
    Ok(())
}

/// Strips the informational "Permanently added ... known hosts" line from
/// stderr. The span up to and including the closing phrase is removed only
/// when the opening phrase is also present before it; otherwise the input
/// is returned unmodified, so unrelated stderr containing just the closing
/// words is not mangled.
pub fn strip_host_key_warning(stderr: &str) -> String {
    let Some(tail_pos) = stderr.find(HOST_KEY_WARNING_TAIL) else {
        return stderr.to_string();
    };
    let head = &stderr[..tail_pos];
    if !head.contains(HOST_KEY_WARNING_HEAD) {
        return stderr.to_string();
    }
    stderr[tail_pos + HOST_KEY_WARNING_TAIL.len()..]
        .trim()
        .to_string()
}

/// Cuts `text` to `limit` bytes (on a char boundary) for embedding in a
/// log line, appending `...` when cut. The caller's copy stays complete.
pub fn truncate_for_log(text: &str, limit: usize) -> String {
    if limit == 0 || text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

fn flatten_for_log(text: &str) -> String {
    truncate_for_log(text, LOG_OUTPUT_LIMIT).replace('\n', "\\n")
}

fn format_tag(tags: &[&str]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!("[{}]", tags.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_span_is_removed_when_both_phrases_present() {
        let stderr = "Warning: Permanently added 'db-node-1' (ED25519) \
                      to the list of known hosts.\nreal error follows";
        assert_eq!(strip_host_key_warning(stderr), "real error follows");
    }

    #[test]
    fn closing_phrase_alone_is_left_untouched() {
        let stderr = "something about to the list of known hosts. but no prefix";
        assert_eq!(strip_host_key_warning(stderr), stderr);
    }

    #[test]
    fn missing_closing_phrase_is_left_untouched() {
        let stderr = "Warning: Permanently added but the line was cut";
        assert_eq!(strip_host_key_warning(stderr), stderr);
    }

    #[test]
    fn whole_warning_only_strips_to_empty() {
        let stderr = "Warning: Permanently added 'h' to the list of known hosts.\n";
        assert_eq!(strip_host_key_warning(stderr), "");
    }

    #[test]
    fn truncation_appends_ellipsis() {
        let text = "x".repeat(50);
        assert_eq!(truncate_for_log(&text, 10), format!("{}...", "x".repeat(10)));
        assert_eq!(truncate_for_log("short", 10), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééééé"; // 2 bytes per char
        let cut = truncate_for_log(text, 3);
        assert!(cut.starts_with('é'));
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn tags_format_like_a_bracketed_pipe_list() {
        assert_eq!(format_tag(&[]), "");
        assert_eq!(format_tag(&["cnt=3", "NetProbe"]), "[cnt=3|NetProbe]");
    }

    #[test]
    fn run_without_connection_is_rejected() {
        let mut session = RemoteSession::for_host("db-node-1", &["test"]);
        let err = session.run("true", false, false).unwrap_err();
        assert!(matches!(err, SshError::NotConnected(_)));
        assert!(err.to_string().contains("please init ssh connection first"));
    }

    #[test]
    fn release_is_idempotent_without_connection() {
        let mut session = RemoteSession::for_host("db-node-1", &[]);
        session.release();
        session.release();
        assert!(!session.is_connected());
        assert!(!session.is_alive());
    }

    #[test]
    fn acquiring_a_handle_never_connects() {
        let session = RemoteSession::new("root", "db-node-1", DEFAULT_SSH_PORT, &["a", "b"]);
        assert_eq!(session.host(), "db-node-1");
        assert_eq!(session.command_count(), 0);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn exec_on_node_feeds_failures_to_the_predicate() {
        use crate::store::memory::MemoryStore;
        use std::sync::Arc;

        // No controller config record: every command reaches the caller's
        // predicate as an error instead of output.
        let store = Arc::new(MemoryStore::new());
        let policy = ConfigPolicyCache::new(store);

        let tolerant = exec_on_node(&policy, "db-node-1", &["true"], |_, _| true).await;
        assert!(tolerant.is_ok());

        let strict =
            exec_on_node(&policy, "db-node-1", &["true"], |_, error| error.is_none()).await;
        assert!(strict.is_err());
    }
}
