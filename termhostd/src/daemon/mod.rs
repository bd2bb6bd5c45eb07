//! C6: the Daemon Supervisor. Owns startup (home directory, stale-socket
//! probe, token/pid files, the listener) and orderly shutdown. Grounded on
//! the teacher's `daemon::run` entry point, adapted for this daemon's own
//! auxiliary files (token, not present in the teacher) and its two-socket
//! client model.

pub mod exit_notify;
pub mod host;
pub mod server;
pub mod session;
mod signals;

use std::{
    fs,
    io::Write,
    os::unix::{
        fs::{OpenOptionsExt, PermissionsExt},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use rand::RngCore;
use tracing::{info, instrument, warn};

use crate::{config, consts};
use host::Host;
use server::Server;

const SOCK_NAME: &str = "terminal-host.sock";
const TOKEN_NAME: &str = "terminal-host.token";
const PID_NAME: &str = "terminal-host.pid";

#[instrument(skip_all)]
pub fn run(config_manager: config::Manager, home_dir: PathBuf) -> anyhow::Result<()> {
    install_panic_hook();

    fs::create_dir_all(&home_dir).context("creating daemon home directory")?;
    fs::set_permissions(&home_dir, fs::Permissions::from_mode(0o700))
        .context("setting daemon home directory permissions")?;

    let sock_path = home_dir.join(SOCK_NAME);
    let pid_path = home_dir.join(PID_NAME);
    let token_path = home_dir.join(TOKEN_NAME);

    reclaim_stale_socket(&sock_path, &pid_path)?;

    let token = ensure_token(&token_path)?;

    let host = Host::new(config_manager);
    let server = Server::new(host.clone(), token);
    host.set_exit_sink(server.clone());

    let listener = UnixListener::bind(&sock_path).context("binding daemon socket")?;
    fs::set_permissions(&sock_path, fs::Permissions::from_mode(0o600))
        .context("setting socket permissions")?;

    write_pid_file(&pid_path)?;

    signals::Handler::new(host.clone(), sock_path.clone(), pid_path.clone()).spawn()?;

    info!(socket = %sock_path.display(), "termhostd listening");
    Server::serve(server, listener)?;

    host.dispose();
    let _ = fs::remove_file(&sock_path);
    let _ = fs::remove_file(&pid_path);
    Ok(())
}

/// If a socket file already exists, probe it with a connect attempt: a live
/// daemon answering means we must refuse to start, per §4.6. No answer
/// means the file is stale and both it and the pid file are unlinked.
fn reclaim_stale_socket(sock_path: &Path, pid_path: &Path) -> anyhow::Result<()> {
    if !sock_path.exists() {
        return Ok(());
    }

    if probe_socket_is_live(sock_path, consts::STALE_SOCKET_PROBE_TIMEOUT) {
        return Err(anyhow!("another daemon is already running on {}", sock_path.display()));
    }

    warn!(socket = %sock_path.display(), "found stale socket file, removing");
    fs::remove_file(sock_path).context("removing stale socket")?;
    if pid_path.exists() {
        fs::remove_file(pid_path).context("removing stale pid file")?;
    }
    Ok(())
}

/// Runs the connect attempt on a helper thread bounded by `timeout`, so a
/// listener that never accepts (full backlog, wedged daemon) can't block
/// startup indefinitely. A timed-out probe is treated the same as a failed
/// connect: nothing answered, so the socket is reclaimed as stale.
fn probe_socket_is_live(sock_path: &Path, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let path = sock_path.to_path_buf();
    thread::spawn(move || {
        let _ = tx.send(UnixStream::connect(&path).is_ok());
    });
    rx.recv_timeout(timeout).unwrap_or(false)
}

/// Creates the 64-hex-character auth token file (mode 0600) if it doesn't
/// already exist, and returns its contents either way.
fn ensure_token(token_path: &Path) -> anyhow::Result<String> {
    if token_path.exists() {
        return fs::read_to_string(token_path).context("reading existing token file");
    }

    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = raw.iter().map(|b| format!("{b:02x}")).collect::<String>();

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(token_path)
        .context("creating token file")?;
    file.write_all(token.as_bytes()).context("writing token file")?;
    Ok(token)
}

fn write_pid_file(pid_path: &Path) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(pid_path)
        .context("creating pid file")?;
    write!(file, "{}", std::process::id()).context("writing pid file")?;
    Ok(())
}

/// Replaces the default panic hook so a panicking worker thread still logs
/// through `tracing` (and thus ends up wherever the rest of the daemon's
/// structured logs go) instead of only writing to stderr.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "panicked");
    }));
}
