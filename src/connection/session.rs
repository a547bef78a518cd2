use super::bastion::{open_tunnel, BastionTunnel};
use super::{ConnectionConfig, ConnectionIdentity, Endpoint};
use crate::constants::files::UPLOAD_MODE;
use crate::constants::network::{
    KEEPALIVE_INTERVAL_SECS, POLL_INTERVAL_MS, TIMEOUT_TCP_DIAL_MS,
};
use crate::constants::retry::{BASE_DELAY_MS, CANCEL_CHECK_MS, MAX_DELAY_MS};
use crate::constants::script::{RANDOM_PLACEHOLDER, UPLOAD_MODE as SCRIPT_UPLOAD_MODE};
use crate::errors::RemoteError;
use crate::executor::{CommandOutput, Executor, RemoteCommand};
use crate::services::logger::Logger;
use crate::utils::shell::quote_command;
use base64::Engine;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

// libssh2 session error codes that mean the network dropped, not that the
// peer refused us.
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

struct Link {
    session: ssh2::Session,
    // Dropped after `session`: the tunnel carries its bytes.
    _tunnel: Option<BastionTunnel>,
}

enum State {
    Unconnected,
    Connected(Link),
    Failed(RemoteError),
}

#[derive(Debug, Clone)]
pub enum SessionStatus {
    Unconnected,
    Connected,
    Failed(RemoteError),
}

/// Owns at most one authenticated SSH connection.
///
/// The first operation connects, retrying network failures until the
/// configured window closes. A failed attempt is terminal: every later call
/// gets the same error, and a new `Session` is needed to try again. All
/// operations hold the state lock for their whole duration, so commands
/// issued through one session never interleave on the wire. [`status`]
/// reads a separate snapshot and never waits on that lock.
///
/// [`status`]: Session::status
pub struct Session {
    identity: ConnectionIdentity,
    config: ConnectionConfig,
    logger: Logger,
    state: Mutex<State>,
    snapshot: Mutex<SessionStatus>,
    cancelled: AtomicBool,
}

impl Session {
    pub fn new(identity: ConnectionIdentity, config: ConnectionConfig, logger: Logger) -> Self {
        Self {
            identity,
            config,
            logger: logger.child("session"),
            state: Mutex::new(State::Unconnected),
            snapshot: Mutex::new(SessionStatus::Unconnected),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn publish(&self, state: &State) {
        let status = match state {
            State::Unconnected => SessionStatus::Unconnected,
            State::Connected(_) => SessionStatus::Connected,
            State::Failed(err) => SessionStatus::Failed(err.clone()),
        };
        *self.snapshot.lock().unwrap_or_else(|err| err.into_inner()) = status;
    }

    /// Stops a pending connect retry loop at its next check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Best-effort teardown. The session cannot be reused afterwards.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        if let State::Connected(link) = &*state {
            let _ = link.session.disconnect(None, "closing", None);
            self.logger.debug(
                "SSH session closed",
                Some(&serde_json::json!({"identity": self.identity.as_str()})),
            );
        }
        if !matches!(&*state, State::Failed(_)) {
            *state = State::Failed(RemoteError::internal(format!(
                "SSH session '{}' was closed",
                self.identity
            )));
            self.publish(&state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Runs `op` against the live connection, connecting first if needed.
    fn with_session<T>(
        &self,
        op: impl FnOnce(&ssh2::Session) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.lock();
        if matches!(&*state, State::Unconnected) {
            *state = match self.connect_with_retry() {
                Ok(link) => State::Connected(link),
                Err(err) => {
                    self.logger.error(
                        "SSH connection failed",
                        Some(&serde_json::json!({
                            "identity": self.identity.as_str(),
                            "error": err.message,
                        })),
                    );
                    State::Failed(err)
                }
            };
            self.publish(&state);
        }
        match &*state {
            State::Connected(link) => op(&link.session),
            State::Failed(err) => Err(err.clone()),
            State::Unconnected => Err(RemoteError::internal("SSH session is not connected")),
        }
    }

    fn connect_with_retry(&self) -> Result<Link, RemoteError> {
        let window = self.config.connect_timeout()?;
        let started = Instant::now();
        let deadline = started.checked_add(window).ok_or_else(|| {
            RemoteError::invalid_params(format!("timeout '{}' is too long", self.config.timeout))
        })?;
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        let mut attempt: u32 = 0;
        let secrets = self.config.secrets();

        loop {
            attempt += 1;
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(RemoteError::transport("SSH connect cancelled")
                    .context(self.identity.as_str()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let dial_timeout = remaining
                .min(Duration::from_millis(TIMEOUT_TCP_DIAL_MS))
                .max(Duration::from_millis(100));

            match open_link(&self.config, dial_timeout) {
                Ok(link) => {
                    self.logger.info(
                        "SSH connected",
                        Some(&serde_json::json!({
                            "identity": self.identity.as_str(),
                            "host": self.config.host,
                            "port": self.config.port,
                            "attempts": attempt,
                        })),
                    );
                    return Ok(link);
                }
                Err(err) if err.retryable => {
                    let err = err.redacted(&secrets);
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(err.context(format!(
                            "timeout after {}s waiting for SSH on {}:{}",
                            window.as_secs(),
                            self.config.host,
                            self.config.port
                        )));
                    }
                    self.logger.warn(
                        "SSH connect failed, retrying",
                        Some(&serde_json::json!({
                            "identity": self.identity.as_str(),
                            "attempt": attempt,
                            "error": err.message,
                        })),
                    );
                    self.sleep_cancellable(delay.min(deadline - now));
                    delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
                }
                Err(err) => return Err(err.redacted(&secrets)),
            }
        }
    }

    fn sleep_cancellable(&self, total: Duration) {
        let step = Duration::from_millis(CANCEL_CHECK_MS);
        let until = Instant::now() + total;
        while !self.cancelled.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= until {
                return;
            }
            std::thread::sleep(step.min(until - now));
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Executor for Session {
    fn exec(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        self.with_session(|session| exec_blocking(session, command))
    }

    fn upload(&self, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        self.with_session(|session| scp_upload(session, path, content, UPLOAD_MODE))
    }

    fn upload_script(&self, path: &str, content: &[u8]) -> Result<(), RemoteError> {
        self.with_session(|session| {
            scp_upload(session, path, content, SCRIPT_UPLOAD_MODE)?;
            let chmod = quote_command(&["chmod", "0777", path]);
            exec_blocking(session, &RemoteCommand::new(chmod))?;
            Ok(())
        })
    }

    fn script_path(&self) -> Result<String, RemoteError> {
        Ok(self
            .config
            .script_path
            .replace(RANDOM_PLACEHOLDER, &rand::random::<u32>().to_string()))
    }
}

fn open_link(config: &ConnectionConfig, dial_timeout: Duration) -> Result<Link, RemoteError> {
    let target = config.target();
    match config.bastion() {
        None => {
            let tcp = dial(&target, dial_timeout)?;
            let session = establish(tcp, &target)?;
            Ok(Link {
                session,
                _tunnel: None,
            })
        }
        Some(bastion) => {
            let tcp = dial(&bastion, dial_timeout)?;
            let jump = establish(tcp, &bastion)?;
            let (socket, tunnel) = open_tunnel(jump, &target.host, target.port)?;
            let session = establish(socket, &target)?;
            Ok(Link {
                session,
                _tunnel: Some(tunnel),
            })
        }
    }
}

fn dial(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, RemoteError> {
    let addrs: Vec<_> = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|err| {
            RemoteError::transport(format!("resolve {}: {}", endpoint.host, err))
        })?
        .collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(err) => last_err = Some(err),
        }
    }
    let detail = last_err
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no addresses".to_string());
    Err(RemoteError::transport(format!(
        "dial tcp {}:{}: {}",
        endpoint.host, endpoint.port, detail
    )))
}

fn establish<S: 'static + AsRawFd>(
    stream: S,
    endpoint: &Endpoint,
) -> Result<ssh2::Session, RemoteError> {
    let mut session =
        ssh2::Session::new().map_err(|_| RemoteError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(stream);
    session.handshake().map_err(map_ssh_error)?;

    if let Some(expected) = endpoint.host_key.as_ref() {
        verify_host_key(&session, expected, &endpoint.host)?;
    }
    authenticate(&session, endpoint)?;
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    session.set_timeout(0);
    Ok(session)
}

fn verify_host_key(session: &ssh2::Session, expected: &str, host: &str) -> Result<(), RemoteError> {
    let (observed, _) = session
        .host_key()
        .ok_or_else(|| RemoteError::protocol("SSH server did not present a host key"))?;
    let blob = expected
        .split_whitespace()
        .find_map(|token| base64::engine::general_purpose::STANDARD.decode(token).ok())
        .ok_or_else(|| RemoteError::invalid_params("host_key is not a valid public key line"))?;
    if blob != observed {
        return Err(RemoteError::denied(format!(
            "SSH host key mismatch for {}",
            host
        )));
    }
    Ok(())
}

fn authenticate(session: &ssh2::Session, endpoint: &Endpoint) -> Result<(), RemoteError> {
    let user = endpoint.user.as_str();
    let mut last_err: Option<RemoteError> = None;
    let mut attempt = |result: Result<(), ssh2::Error>| -> Result<(), RemoteError> {
        if let Err(err) = result {
            let mapped = map_ssh_error(err);
            if mapped.retryable {
                return Err(mapped);
            }
            last_err = Some(mapped);
        }
        Ok(())
    };

    if let Some(key) = endpoint.private_key.as_ref() {
        attempt(session.userauth_pubkey_memory(
            user,
            endpoint.certificate.as_deref(),
            key,
            None,
        ))?;
    }
    if !session.authenticated() {
        if let Some(password) = endpoint.password.as_ref() {
            attempt(session.userauth_password(user, password))?;
        }
    }
    if !session.authenticated() && endpoint.agent {
        attempt(authenticate_agent(session, user, endpoint.agent_identity.as_deref()))?;
    }

    if !session.authenticated() {
        let detail = last_err
            .map(|err| format!(": {}", err.message))
            .unwrap_or_default();
        return Err(RemoteError::denied(format!(
            "SSH authentication failed for {}@{}{}",
            user, endpoint.host, detail
        )));
    }
    Ok(())
}

fn authenticate_agent(
    session: &ssh2::Session,
    user: &str,
    preferred: Option<&str>,
) -> Result<(), ssh2::Error> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;
    for identity in agent.identities()? {
        if preferred.map(|p| identity.comment() != p).unwrap_or(false) {
            continue;
        }
        if agent.userauth(user, &identity).is_ok() {
            break;
        }
    }
    let _ = agent.disconnect();
    Ok(())
}

/// Runs one command on a fresh channel, feeding stdin and draining stdout
/// and stderr concurrently so neither side can stall on a full window.
fn exec_blocking(
    session: &ssh2::Session,
    command: &RemoteCommand,
) -> Result<CommandOutput, RemoteError> {
    let mut channel = session.channel_session().map_err(map_ssh_error)?;
    channel.exec(&command.command).map_err(map_ssh_error)?;

    session.set_blocking(false);
    let pumped = pump_channel(&mut channel, command.stdin.as_deref().unwrap_or(&[]));
    session.set_blocking(true);
    let (mut stdout, mut stderr) = pumped?;

    channel.read_to_end(&mut stdout)?;
    channel.stderr().read_to_end(&mut stderr)?;
    channel.wait_close().map_err(map_ssh_error)?;

    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let stderr = String::from_utf8_lossy(&stderr).to_string();
    let signal = channel.exit_signal().ok().and_then(|sig| sig.exit_signal);
    if let Some(signal) = signal {
        let stderr = format!("{}\nkilled by signal {}", stderr.trim_end(), signal);
        return Err(RemoteError::exit(&command.command, -1, stdout, stderr));
    }
    let code = channel.exit_status().map_err(map_ssh_error)?;
    if code != 0 {
        return Err(RemoteError::exit(&command.command, code, stdout, stderr));
    }
    Ok(CommandOutput { stdout, stderr })
}

fn pump_channel(
    channel: &mut ssh2::Channel,
    stdin: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), RemoteError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut offset = 0usize;
    let mut eof_sent = false;
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;

        if offset < stdin.len() {
            match channel.write(&stdin[offset..]) {
                Ok(n) if n > 0 => {
                    offset += n;
                    progressed = true;
                }
                Ok(_) => {}
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
                // The remote stopped reading stdin; keep draining output.
                Err(_) => offset = stdin.len(),
            }
        } else if !eof_sent {
            match channel.send_eof() {
                Ok(()) => {
                    eof_sent = true;
                    progressed = true;
                }
                Err(err) if is_eagain(&err) => {}
                Err(_) => eof_sent = true,
            }
        }

        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                stdout.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
            Err(err) => {
                return Err(RemoteError::transport(format!("SSH stdout read failed: {}", err)))
            }
        }
        match channel.stderr().read(&mut buf) {
            Ok(n) if n > 0 => {
                stderr.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
            Err(err) => {
                return Err(RemoteError::transport(format!("SSH stderr read failed: {}", err)))
            }
        }

        if channel.eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }
    Ok((stdout, stderr))
}

fn scp_upload(
    session: &ssh2::Session,
    path: &str,
    content: &[u8],
    mode: i32,
) -> Result<(), RemoteError> {
    let mut remote = session
        .scp_send(Path::new(path), mode, content.len() as u64, None)
        .map_err(|err| map_ssh_error(err).context(format!("upload {}", path)))?;
    remote
        .write_all(content)
        .map_err(|err| RemoteError::transport(format!("upload {}: {}", path, err)))?;
    remote.send_eof().map_err(map_ssh_error)?;
    remote.wait_eof().map_err(map_ssh_error)?;
    remote.close().map_err(map_ssh_error)?;
    remote.wait_close().map_err(map_ssh_error)?;
    Ok(())
}

fn is_eagain(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Network-level libssh2 failures are retryable transport errors; anything
/// else (key exchange, auth, channel refusal) is not.
pub(crate) fn map_ssh_error(err: ssh2::Error) -> RemoteError {
    let network = matches!(
        err.code(),
        ssh2::ErrorCode::Session(
            LIBSSH2_ERROR_BANNER_RECV
                | LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_RECV
        )
    );
    let message = format!("SSH error: {}", err.message());
    if network {
        RemoteError::transport(message)
    } else {
        RemoteError::protocol(message)
    }
}
