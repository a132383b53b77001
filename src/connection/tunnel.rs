//! SSH local port forwarding on top of libssh2.
//!
//! One tunnel owns one SSH session and one listener on `local_host:local_port`.
//! Every accepted local client gets its own `direct-tcpip` channel to
//! `dst_host:dst_port` on the shared session.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::Session;

use crate::connection::broker::TunnelFactory;
use crate::error::{Error, Result};
use crate::models::{SshAuth, SshTunnelConfig};

#[cfg(debug_assertions)]
const APP_NAME: &str = "mango-admin-dev";

#[cfg(not(debug_assertions))]
const APP_NAME: &str = "mango-admin";

pub const KNOWN_HOSTS_ENV: &str = "MANGO_ADMIN_SSH_KNOWN_HOSTS_PATH";

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const IO_IDLE_SLEEP: Duration = Duration::from_millis(1);
const IO_BLOCK_RETRY_SLEEP: Duration = Duration::from_millis(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Session timeout (ms) while relaying, so channel reads and writes return
/// quickly instead of blocking the loop.
const IO_POLL_TIMEOUT_MS: u32 = 50;
/// Session timeout (ms) while opening a `direct-tcpip` channel.
const CHANNEL_OPEN_TIMEOUT_MS: u32 = 10_000;

#[derive(Default, Serialize, Deserialize)]
struct HostKeyStore {
    fingerprints: HashMap<String, String>,
}

/// A running forward. Stopping joins the relay thread.
#[derive(Debug)]
pub struct SshTunnelHandle {
    stop_tx: Sender<()>,
    join_handle: Option<thread::JoinHandle<()>>,
    pub local_host: String,
    pub local_port: u16,
}

impl SshTunnelHandle {
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

impl Drop for SshTunnelHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Production `TunnelFactory`: blocking libssh2 setup and teardown run on the blocking pool.
#[derive(Clone, Debug, Default)]
pub struct SshTunnelFactory;

impl TunnelFactory for SshTunnelFactory {
    type Tunnel = SshTunnelHandle;

    async fn open(&self, config: &SshTunnelConfig) -> Result<SshTunnelHandle> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || start_ssh_tunnel(&config))
            .await
            .map_err(|err| Error::Tunnel(format!("SSH tunnel task failed: {err}")))?
    }

    /// Joining the relay thread waits for a full poll round, so it runs on
    /// the blocking pool.
    async fn close(&self, mut tunnel: SshTunnelHandle) {
        if let Err(err) = tokio::task::spawn_blocking(move || tunnel.stop()).await {
            log::warn!("SSH tunnel stop task failed: {err}");
        }
    }

    fn close_now(&self, mut tunnel: SshTunnelHandle) {
        tunnel.stop();
    }

    fn local_endpoint(&self, tunnel: &SshTunnelHandle) -> String {
        tunnel.local_endpoint()
    }
}

/// Open the forward and start relaying. Every setup failure is `Error::Tunnel`.
pub fn start_ssh_tunnel(config: &SshTunnelConfig) -> Result<SshTunnelHandle> {
    spawn_forward(config).map_err(Error::into_tunnel)
}

fn spawn_forward(config: &SshTunnelConfig) -> Result<SshTunnelHandle> {
    validate_ssh_config(config)?;
    let (session, ssh_socket) = establish_ssh_session(config)?;

    let listener = TcpListener::bind((config.local_host.as_str(), config.local_port))
        .map_err(|err| Error::Tunnel(format!("cannot listen on {}: {err}", config.local_endpoint())))?;
    listener.set_nonblocking(true)?;
    let local_port = listener.local_addr()?.port();
    let local_host = config.local_host.clone();
    let target = ForwardTarget { host: config.dst_host.clone(), port: config.dst_port };

    let (stop_tx, stop_rx) = mpsc::channel();
    let join_handle = thread::Builder::new()
        .name("mango-admin-ssh-tunnel".to_string())
        .spawn(move || {
            run_tunnel_loop(listener, stop_rx, session, ssh_socket, target);
        })
        .map_err(Error::from)?;

    log::info!(
        "SSH tunnel {}:{} -> {}:{} via {}@{}:{}",
        local_host,
        local_port,
        config.dst_host,
        config.dst_port,
        config.username,
        config.host,
        config.port
    );

    Ok(SshTunnelHandle { stop_tx, join_handle: Some(join_handle), local_host, local_port })
}

struct ForwardTarget {
    host: String,
    port: u16,
}

struct ActiveClient {
    local_stream: TcpStream,
    channel: ssh2::Channel,
    last_activity: Instant,
}

struct PollOutcome {
    progressed: bool,
    close: bool,
}

/// Relay loop. All libssh2 calls stay on this thread.
///
/// The session stays in blocking mode with a short timeout so libssh2 keeps
/// pumping the transport; `ssh_socket` is a dup of the session socket used to
/// set matching socket timeouts.
fn run_tunnel_loop(
    listener: TcpListener,
    stop_rx: Receiver<()>,
    session: Session,
    ssh_socket: TcpStream,
    target: ForwardTarget,
) {
    session.set_blocking(true);
    session.set_timeout(IO_POLL_TIMEOUT_MS);
    ssh_socket.set_nonblocking(false).ok();
    ssh_socket.set_read_timeout(Some(Duration::from_millis(IO_POLL_TIMEOUT_MS as u64))).ok();
    ssh_socket.set_write_timeout(Some(Duration::from_millis(IO_POLL_TIMEOUT_MS as u64))).ok();

    let mut clients: Vec<ActiveClient> = Vec::new();
    let mut local_to_remote = [0u8; 8192];
    let mut remote_to_local = [0u8; 8192];

    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }

        let mut any_progress = false;
        let mut i = 0;
        while i < clients.len() {
            let outcome =
                poll_client(&mut clients[i], i, &mut local_to_remote, &mut remote_to_local);

            if outcome.progressed {
                clients[i].last_activity = Instant::now();
                any_progress = true;
            } else if clients[i].last_activity.elapsed() > CLIENT_IDLE_TIMEOUT {
                log::warn!("SSH tunnel client idle timeout reached, closing connection");
                clients.swap_remove(i);
                continue;
            }

            if outcome.close {
                clients.swap_remove(i);
                log::debug!("[client {i}] closed, {} clients left", clients.len());
            } else {
                i += 1;
            }
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("SSH tunnel accepted {peer}");
                if let Some(client) = open_forward(&session, stream, &target) {
                    clients.push(client);
                    any_progress = true;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                log::error!("SSH tunnel listener error: {err}");
                break;
            }
        }

        if !any_progress {
            thread::sleep(if clients.is_empty() { STOP_POLL_INTERVAL } else { IO_IDLE_SLEEP });
        }
    }
}

fn open_forward(session: &Session, stream: TcpStream, target: &ForwardTarget) -> Option<ActiveClient> {
    session.set_timeout(CHANNEL_OPEN_TIMEOUT_MS);
    let channel = session.channel_direct_tcpip(&target.host, target.port, None);
    session.set_timeout(IO_POLL_TIMEOUT_MS);

    match channel {
        Ok(channel) => {
            stream.set_nonblocking(true).ok();
            Some(ActiveClient { local_stream: stream, channel, last_activity: Instant::now() })
        }
        Err(err) => {
            log::error!("SSH channel to {}:{} failed: {err}", target.host, target.port);
            None
        }
    }
}

/// Relay data for a single active client.
fn poll_client(
    client: &mut ActiveClient,
    idx: usize,
    local_to_remote: &mut [u8],
    remote_to_local: &mut [u8],
) -> PollOutcome {
    let mut progressed = false;
    let mut close = false;

    match client.local_stream.read(local_to_remote) {
        Ok(0) => {
            log::debug!("[client {idx}] local EOF");
            let _ = client.channel.send_eof();
            close = true;
        }
        Ok(n) => match write_all_blocking(&mut client.channel, &local_to_remote[..n]) {
            Ok(()) => progressed = true,
            Err(err) => {
                log::debug!("[client {idx}] local->remote write failed: {err}");
                close = true;
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(err) => {
            log::debug!("[client {idx}] local read error: {err}");
            close = true;
        }
    }

    if !close {
        match client.channel.read(remote_to_local) {
            Ok(0) => {}
            Ok(n) => match write_all_nonblocking(&mut client.local_stream, &remote_to_local[..n]) {
                Ok(()) => progressed = true,
                Err(err) => {
                    log::debug!("[client {idx}] remote->local write failed: {err}");
                    close = true;
                }
            },
            Err(err) if is_would_block_or_timeout(&err) => {}
            Err(err) => {
                log::debug!("[client {idx}] channel read error: {err}");
                close = true;
            }
        }

        if client.channel.eof() {
            log::debug!("[client {idx}] channel EOF");
            close = true;
        }
    }

    PollOutcome { progressed, close }
}

fn is_would_block_or_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn write_timed_out() -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "SSH tunnel write timed out"))
}

/// Write through the blocking channel; each call is bounded by the session timeout.
fn write_all_blocking<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    let mut written = 0;
    let deadline = Instant::now() + WRITE_TIMEOUT;
    while written < data.len() {
        if Instant::now() > deadline {
            return Err(write_timed_out());
        }
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write to channel",
                )));
            }
            Ok(bytes) => written += bytes,
            Err(err) if is_would_block_or_timeout(&err) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

fn write_all_nonblocking<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    let mut written = 0;
    let deadline = Instant::now() + WRITE_TIMEOUT;
    while written < data.len() {
        if Instant::now() > deadline {
            return Err(write_timed_out());
        }
        match writer.write(&data[written..]) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write to stream",
                )));
            }
            Ok(bytes) => written += bytes,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(IO_BLOCK_RETRY_SLEEP);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

/// The returned `TcpStream` is a dup of the SSH socket.
fn establish_ssh_session(config: &SshTunnelConfig) -> Result<(Session, TcpStream)> {
    let tcp = connect_ssh_socket(&config.host, config.port)?;
    tcp.set_read_timeout(Some(SSH_CONNECT_TIMEOUT))?;
    tcp.set_write_timeout(Some(SSH_CONNECT_TIMEOUT))?;
    let tcp_ctl = tcp.try_clone()?;

    let mut session = Session::new()
        .map_err(|err| Error::Tunnel(format!("Failed to create SSH session: {err}")))?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    verify_or_learn_host_key(&session, config)?;

    match &config.auth {
        SshAuth::Password { password } => {
            session.userauth_password(config.username.as_str(), password)?;
        }
        SshAuth::PrivateKey { path, passphrase } => {
            let identity_path = resolve_identity_file_path(path);
            session.userauth_pubkey_file(
                config.username.as_str(),
                None,
                identity_path.as_path(),
                passphrase.as_deref(),
            )?;
        }
    }

    if !session.authenticated() {
        return Err(Error::Tunnel("SSH authentication failed".to_string()));
    }

    Ok((session, tcp_ctl))
}

fn connect_ssh_socket(host: &str, port: u16) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, SSH_CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => Error::Io(err),
        None => Error::Tunnel(format!("SSH host {host} did not resolve")),
    })
}

fn verify_or_learn_host_key(session: &Session, config: &SshTunnelConfig) -> Result<()> {
    if !config.strict_host_key_checking {
        return Ok(());
    }

    let (host_key, _host_key_type) = session
        .host_key()
        .ok_or_else(|| Error::Tunnel("Unable to read SSH host key from server".to_string()))?;
    let fingerprint = ssh_host_key_fingerprint(host_key);
    let host_id = format!("{}:{}", config.host, config.port);
    let mut store = load_host_key_store()?;

    match store.fingerprints.get(&host_id) {
        Some(existing) if existing == &fingerprint => Ok(()),
        Some(existing) => Err(Error::Tunnel(format!(
            "SSH host key mismatch for {host_id}. expected {existing}, got {fingerprint}"
        ))),
        None => {
            store.fingerprints.insert(host_id.clone(), fingerprint);
            save_host_key_store(&store)?;
            log::info!("Trusted SSH host key for {}", host_id);
            Ok(())
        }
    }
}

fn ssh_host_key_fingerprint(host_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_key);
    let digest = hasher.finalize();
    format!("SHA256:{}", base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest))
}

pub fn validate_ssh_config(config: &SshTunnelConfig) -> Result<()> {
    if config.host.trim().is_empty() {
        return Err(Error::Tunnel("SSH host is required".to_string()));
    }
    if config.username.trim().is_empty() {
        return Err(Error::Tunnel("SSH username is required".to_string()));
    }
    if config.port == 0 {
        return Err(Error::Tunnel("SSH port must be greater than 0".to_string()));
    }
    if config.local_host.trim().is_empty() {
        return Err(Error::Tunnel("SSH local bind host is required".to_string()));
    }
    if config.dst_host.trim().is_empty() || config.dst_port == 0 {
        return Err(Error::Tunnel("SSH forward destination is required".to_string()));
    }

    match &config.auth {
        SshAuth::Password { password } => {
            if password.trim().is_empty() {
                return Err(Error::Tunnel(
                    "SSH password is required for password authentication".to_string(),
                ));
            }
        }
        SshAuth::PrivateKey { path, .. } => {
            if path.trim().is_empty() {
                return Err(Error::Tunnel(
                    "SSH private key path is required for key authentication".to_string(),
                ));
            }
            let identity_path = resolve_identity_file_path(path);
            if !identity_path.is_file() {
                return Err(Error::Tunnel(format!(
                    "SSH private key is not a readable file: {}",
                    identity_path.display()
                )));
            }
        }
    }

    Ok(())
}

fn resolve_identity_file_path(raw_path: &str) -> PathBuf {
    let trimmed = raw_path.trim();
    if let Some(home_relative) = trimmed.strip_prefix("~/")
        && let Some(home_dir) = dirs::home_dir()
    {
        return home_dir.join(home_relative);
    }
    if trimmed == "~"
        && let Some(home_dir) = dirs::home_dir()
    {
        return home_dir;
    }

    Path::new(trimmed).to_path_buf()
}

fn host_key_store_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(KNOWN_HOSTS_ENV) {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        return Ok(path);
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Tunnel("Could not determine config directory".to_string()))?
        .join(APP_NAME);
    fs::create_dir_all(&config_dir)?;
    Ok(config_dir.join("known_hosts.json"))
}

fn load_host_key_store() -> Result<HostKeyStore> {
    let path = host_key_store_path()?;
    if !path.exists() {
        return Ok(HostKeyStore::default());
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|err| Error::Tunnel(format!("Failed to parse host key store: {err}")))
}

fn save_host_key_store(store: &HostKeyStore) -> Result<()> {
    let path = host_key_store_path()?;
    let serialized = serde_json::to_string_pretty(store)?;
    fs::write(path, serialized)?;
    Ok(())
}
