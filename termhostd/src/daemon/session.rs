//! C3: one PTY child process, its server-side terminal emulator, and the set
//! of stream sockets currently attached to it. Grounded on the teacher's
//! `daemon/shell.rs` (the fork/exec and reader-thread shape) and
//! `daemon/session_restore.rs` (the `shpool_vt100::Parser` usage for
//! snapshotting), with the pager/MOTD/keybindings machinery the teacher
//! layers on top left out -- this daemon's clients render their own UI.

use std::{
    collections::HashMap,
    io::{Read, Write},
    os::unix::io::AsRawFd,
    os::unix::net::UnixStream,
    sync::{Arc, Mutex, Weak},
    thread,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, Context};
use nix::sys::signal::{self, Signal as NixSignal};
use nix::unistd::Pid;
use shpool_pty::fork::Fork;
use termhost_protocol::{EventKind, EventMessage, Signal};
use tracing::{debug, instrument, warn};

use crate::{
    codec, consts,
    daemon::exit_notify::{ExitNotifier, ExitStatus},
    tty,
};

/// Shared ownership point for an authenticated stream socket. The
/// connection registry (`daemon::server`) holds the strong `Arc`; sessions
/// that fan data out to it hold only a [`Weak`], matching the ownership
/// split in the data model (Registry owns lifetime, Sessions hold weak
/// references, released on detach or broken-pipe write).
pub type StreamHandle = Mutex<UnixStream>;

pub struct SpawnArgs {
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub shell: Option<String>,
}

struct Inner {
    fork: Fork,
    emulator: shpool_vt100::Parser,
    size: tty::Size,
    attached: HashMap<String, Weak<StreamHandle>>,
    last_attached_at: SystemTime,
    is_terminating: bool,
    disposed: bool,
}

/// One PTY-backed session. `exit_notifier` is the only piece of state a
/// watcher thread touches directly; everything else lives behind `inner`'s
/// mutex so exactly one mutator runs at a time, mirroring the single-writer
/// guarantee the cooperative event-loop model in §5 relies on.
pub struct Session {
    pub id: String,
    pub workspace_id: Option<String>,
    pub pane_id: Option<String>,
    pub shell: String,
    pub child_pid: libc::pid_t,
    pub created_at: SystemTime,
    pub exit_notifier: Arc<ExitNotifier>,
    scrollback_cap: usize,
    inner: Mutex<Inner>,
}

impl Session {
    /// Forks and execs a shell, wiring its controlling tty to a fresh PTY
    /// master, and starts the background read-pump and exit-watcher
    /// threads. Returns as soon as the fork succeeds; the shell itself may
    /// still exit immediately afterwards (see [`Session::wait_for_ready`]).
    #[instrument(skip(args, emulator_width_cap))]
    pub fn spawn(
        id: String,
        workspace_id: Option<String>,
        pane_id: Option<String>,
        args: SpawnArgs,
        scrollback_cap: usize,
        emulator_width_cap: u16,
    ) -> anyhow::Result<Arc<Session>> {
        let shell = args.shell.clone().unwrap_or_else(default_shell);
        let cwd = args.cwd.clone().unwrap_or_else(default_home);

        let fork = Fork::from_ptmx().map_err(|e| anyhow!("forking pty: {e:?}"))?;
        match fork {
            Fork::Child(_) => {
                // Safety net: `exec` replaces this process image. If it
                // returns at all, exec failed, so exit instead of running
                // the rest of the daemon twice.
                exec_child(&shell, &cwd, &args.env);
                std::process::exit(127);
            }
            Fork::Parent(pid, ref master) => {
                let size = tty::Size { cols: args.cols, rows: args.rows };
                size.set_fd(master.raw_fd().ok_or_else(|| anyhow!("pty master missing fd"))?)
                    .context("sizing new pty")?;

                let emulator = shpool_vt100::Parser::new(
                    args.rows,
                    emulator_width_cap.max(args.cols),
                    scrollback_cap,
                );

                let session = Arc::new(Session {
                    id,
                    workspace_id,
                    pane_id,
                    shell,
                    child_pid: pid,
                    created_at: SystemTime::now(),
                    exit_notifier: Arc::new(ExitNotifier::new()),
                    scrollback_cap,
                    inner: Mutex::new(Inner {
                        fork,
                        emulator,
                        size,
                        attached: HashMap::new(),
                        last_attached_at: SystemTime::now(),
                        is_terminating: false,
                        disposed: false,
                    }),
                });

                spawn_exit_watcher(session.clone());
                spawn_reader(session.clone());

                Ok(session)
            }
        }
    }

    /// Blocks until the child is known either to still be alive after
    /// `timeout` (treated as ready) or to have exited before then (treated
    /// as a failed spawn). Expiry without exit is success, not failure --
    /// callers log it but keep the session.
    pub fn wait_for_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        match self.exit_notifier.wait(Some(timeout)) {
            Some(status) => Err(anyhow!("child exited immediately with status {status}")),
            None => Ok(()),
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.exit_notifier.has_exited()
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.lock().unwrap().is_terminating
    }

    pub fn is_attachable(&self) -> bool {
        self.is_alive() && !self.is_terminating()
    }

    pub fn attached_count(&self) -> usize {
        self.inner.lock().unwrap().attached.len()
    }

    pub fn dimensions(&self) -> (u16, u16) {
        let inner = self.inner.lock().unwrap();
        (inner.size.cols, inner.size.rows)
    }

    pub fn last_attached_at(&self) -> SystemTime {
        self.inner.lock().unwrap().last_attached_at
    }

    /// Registers `stream` under `client_id`, replacing any prior socket for
    /// that client, and returns a snapshot taken after every byte read from
    /// the PTY so far has been folded into the emulator.
    pub fn attach(
        &self,
        client_id: &str,
        stream: Weak<StreamHandle>,
    ) -> termhost_protocol::Snapshot {
        let mut inner = self.inner.lock().unwrap();
        inner.attached.insert(client_id.to_string(), stream);
        inner.last_attached_at = SystemTime::now();
        snapshot_locked(&inner, self.scrollback_cap)
    }

    /// No error if `client_id` was never attached.
    pub fn detach(&self, client_id: &str) {
        self.inner.lock().unwrap().attached.remove(client_id);
    }

    pub fn write(&self, data: &str) -> anyhow::Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut master = inner.fork.is_parent().context("writing to disposed session")?;
        master.write_all(data.as_bytes()).context("writing to pty master")?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let master = inner.fork.is_parent().context("resizing disposed session")?;
        let size = tty::Size { cols, rows };
        size.set_fd(master.raw_fd().ok_or_else(|| anyhow!("pty master missing fd"))?)
            .context("resizing pty")?;
        inner.size = size;
        inner.emulator.screen_mut().set_size(rows, cols);
        Ok(())
    }

    pub fn send_signal(&self, sig: Signal) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(self.child_pid), map_signal(sig))
            .context("sending signal to child")?;
        Ok(())
    }

    /// Marks the session terminating and sends a terminate signal. Does not
    /// block for exit -- the host's fail-safe timer owns the forced
    /// disposal path if the child never goes away.
    pub fn kill(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_terminating {
                return Ok(());
            }
            inner.is_terminating = true;
        }
        signal::kill(Pid::from_raw(self.child_pid), Some(NixSignal::SIGTERM))
            .context("sending SIGTERM to child")?;
        Ok(())
    }

    /// Re-seeds the emulator from its own current screen contents with a
    /// fresh, empty scrollback. The visible screen survives; history does
    /// not.
    pub fn clear_scrollback(&self) {
        let mut inner = self.inner.lock().unwrap();
        let (rows, cols) = inner.emulator.screen().size();
        let screen_bytes = inner.emulator.screen().contents_formatted();
        let width_cap = cols.max(1);
        let mut fresh = shpool_vt100::Parser::new(rows, width_cap, self.scrollback_cap);
        fresh.process(&screen_bytes);
        inner.emulator = fresh;
    }

    /// Idempotent. Safe to call from the exit path and the forced-disposal
    /// path both.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.attached.clear();
        // Dropping the Fork's Master closes the pty master fd, which in
        // turn sends SIGHUP to anything still attached to the slave side.
    }

    pub fn snapshot(&self) -> termhost_protocol::Snapshot {
        let inner = self.inner.lock().unwrap();
        snapshot_locked(&inner, self.scrollback_cap)
    }
}

fn snapshot_locked(inner: &Inner, scrollback_cap: usize) -> termhost_protocol::Snapshot {
    let screen = inner.emulator.screen();
    let (rows, cols) = screen.size();
    let total_wanted = scrollback_cap as u16 + rows;
    let mut lines: Vec<String> =
        screen.last_n_rows_contents(total_wanted).lines().map(str::to_string).collect();

    let screen_lines = if lines.len() >= rows as usize {
        lines.split_off(lines.len() - rows as usize)
    } else {
        std::mem::take(&mut lines)
    };
    let (cursor_row, cursor_col) = screen.cursor_position();

    termhost_protocol::Snapshot {
        cols,
        rows,
        scrollback: lines,
        screen: screen_lines,
        cursor_row,
        cursor_col,
        cursor_visible: !screen.hide_cursor(),
        alternate_screen: screen.alternate_screen(),
    }
}

fn map_signal(sig: Signal) -> Option<NixSignal> {
    Some(match sig {
        Signal::Interrupt => NixSignal::SIGINT,
        Signal::Hangup => NixSignal::SIGHUP,
        Signal::Quit => NixSignal::SIGQUIT,
        Signal::Terminate => NixSignal::SIGTERM,
    })
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| String::from("/bin/sh"))
}

fn default_home() -> String {
    crate::user::info().map(|i| i.home_dir).unwrap_or_else(|_| String::from("/"))
}

/// Runs in the child branch of the fork. Never returns on success.
fn exec_child(shell: &str, cwd: &str, env: &[(String, String)]) -> ! {
    use std::os::unix::process::CommandExt;

    let mut cmd = std::process::Command::new(shell);
    cmd.current_dir(cwd);
    for (k, v) in env {
        cmd.env(k, v);
    }
    // `exec` replaces the process image in place; on success this call
    // never returns.
    let err = cmd.exec();
    eprintln!("termhostd: exec({shell}) failed: {err}");
    std::process::exit(127);
}

/// Waits for the child to exit (blocking this dedicated thread) and relays
/// the result through `session.exit_notifier`. Waits on `child_pid` directly
/// with a raw `waitpid` rather than going through `Fork::wait_for_exit`,
/// which collapses a signal-terminated child down to a bare `None` and
/// throws away the signal number -- this is the one piece of state a caller
/// of `wait_for_exit` cannot recover afterwards.
fn spawn_exit_watcher(session: Arc<Session>) {
    thread::spawn(move || {
        let status = wait_for_child_exit(session.child_pid);
        match status.signal {
            Some(sig) => debug!(session_id = %session.id, signal = sig, "pty child killed by signal"),
            None => debug!(session_id = %session.id, exit_code = ?status.code, "pty child exited"),
        }
        session.exit_notifier.notify_exit(status);
    });
}

/// Blocks in `waitpid(2)` on `pid` until it exits, distinguishing a normal
/// exit from a signal-terminated one. Mirrors the wait loop inside
/// `shpool_pty`'s own `Fork::wait_for_exit`, which this duplicates rather
/// than calls, specifically to keep the raw wait status around long enough
/// to pull `WTERMSIG` out of it.
fn wait_for_child_exit(pid: libc::pid_t) -> ExitStatus {
    loop {
        let mut raw_status: libc::c_int = 0;
        // Safety: `pid` is this session's own child; no other thread waits
        // on it.
        match unsafe { libc::waitpid(pid, &mut raw_status, 0) } {
            0 => continue,
            -1 => {
                warn!(pid, error = %std::io::Error::last_os_error(), "waitpid failed");
                return ExitStatus { code: None, signal: None };
            }
            _ => {
                if libc::WIFEXITED(raw_status) {
                    return ExitStatus { code: Some(libc::WEXITSTATUS(raw_status)), signal: None };
                } else if libc::WIFSIGNALED(raw_status) {
                    return ExitStatus { code: None, signal: Some(libc::WTERMSIG(raw_status)) };
                }
                // Stopped/continued notifications (WUNTRACED/WCONTINUED)
                // can't happen with the default `options` of 0, but loop
                // defensively rather than report a bogus status.
            }
        }
    }
}

/// Pumps bytes off the PTY master, feeding every byte to the emulator
/// before fanning it out to attached stream sockets, per the emulator
/// invariant in §4.3: the emulator must be authoritative before any client
/// sees a byte, so a reattaching client's snapshot always matches what an
/// already-attached client has seen.
fn spawn_reader(session: Arc<Session>) {
    thread::spawn(move || {
        let mut master = {
            let inner = session.inner.lock().unwrap();
            match inner.fork.is_parent() {
                Ok(m) => m,
                Err(_) => return,
            }
        };

        let mut buf = vec![0u8; consts::PTY_READ_BUF_SIZE];
        loop {
            if session.exit_notifier.has_exited() {
                return;
            }
            let n = match master.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };

            let stale: Vec<String> = {
                let mut inner = session.inner.lock().unwrap();
                if inner.disposed {
                    return;
                }
                inner.emulator.process(&buf[..n]);

                let mut stale = Vec::new();
                for (client_id, weak) in inner.attached.iter() {
                    let Some(handle) = weak.upgrade() else {
                        stale.push(client_id.clone());
                        continue;
                    };
                    let event = EventMessage::new(
                        EventKind::Data,
                        session.id.clone(),
                        serde_json::json!({ "bytes": String::from_utf8_lossy(&buf[..n]) }),
                    );
                    let Ok(line) = codec::encode_line(&event) else { continue };
                    let mut sock = handle.lock().unwrap();
                    if sock.write_all(&line).is_err() {
                        stale.push(client_id.clone());
                    }
                }
                for client_id in &stale {
                    inner.attached.remove(client_id);
                }
                stale
            };
            if !stale.is_empty() {
                debug!(session_id = %session.id, count = stale.len(), "dropped stale stream sockets during fan-out");
            }
        }
    });
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("child_pid", &self.child_pid)
            .field("is_alive", &self.is_alive())
            .field("is_terminating", &self.is_terminating())
            .finish()
    }
}
