//! C4: the Terminal Host. Owns the session table, the spawn concurrency
//! limiter, and the kill-timer table, and coordinates create-or-attach.
//! Grounded on the teacher's `daemon::server::Server` (the
//! `shells: Arc<Mutex<HashMap<...>>>` table it threads through every
//! handler).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

use termhost_protocol::{CreateOrAttachResult, ListSessionsResult, Signal, SessionDescriptor};
use tracing::{instrument, warn};

use crate::{
    config,
    consts,
    daemon::exit_notify::ExitStatus,
    daemon::session::{Session, SpawnArgs, StreamHandle},
};

pub struct CreateOrAttachArgs {
    pub session_id: String,
    pub workspace_id: Option<String>,
    pub pane_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub initial_commands: Vec<String>,
    pub shell: Option<String>,
}

/// Called whenever a session that had zero attached clients observes exit,
/// so the dispatcher can broadcast an `exit` event to everyone who *would*
/// have been attached had they not already left -- see §4.4, exit handling.
pub trait UnattachedExitSink: Send + Sync {
    fn on_unattached_exit(&self, session_id: &str, status: Option<ExitStatus>);
}

struct SpawnLimiter {
    permits: Mutex<usize>,
    cond: std::sync::Condvar,
    cap: usize,
}

impl SpawnLimiter {
    fn new(cap: usize) -> Self {
        SpawnLimiter { permits: Mutex::new(0), cond: std::sync::Condvar::new(), cap }
    }

    fn acquire(&self) {
        let mut in_flight = self.permits.lock().unwrap();
        while *in_flight >= self.cap {
            in_flight = self.cond.wait(in_flight).unwrap();
        }
        *in_flight += 1;
    }

    fn release(&self) {
        let mut in_flight = self.permits.lock().unwrap();
        *in_flight = in_flight.saturating_sub(1);
        self.cond.notify_one();
    }
}

pub struct Host {
    config: config::Manager,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    kill_timers: Mutex<HashMap<String, ()>>,
    limiter: SpawnLimiter,
    exit_sink: Mutex<Option<Arc<dyn UnattachedExitSink>>>,
}

impl Host {
    pub fn new(config: config::Manager) -> Arc<Host> {
        let cap = config.get().spawn_concurrency;
        Arc::new(Host {
            config,
            sessions: Mutex::new(HashMap::new()),
            kill_timers: Mutex::new(HashMap::new()),
            limiter: SpawnLimiter::new(cap),
            exit_sink: Mutex::new(None),
        })
    }

    pub fn set_exit_sink(&self, sink: Arc<dyn UnattachedExitSink>) {
        *self.exit_sink.lock().unwrap() = Some(sink);
    }

    fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    #[instrument(skip(self, args, client_id, stream))]
    pub fn create_or_attach(
        self: &Arc<Self>,
        client_id: &str,
        stream: Weak<StreamHandle>,
        args: CreateOrAttachArgs,
    ) -> anyhow::Result<CreateOrAttachResult> {
        // Steps 2-3: a terminating or dead session is disposed and treated
        // as absent, per §4.4.
        if let Some(existing) = self.get(&args.session_id) {
            if existing.is_terminating() || !existing.is_alive() {
                existing.dispose();
                self.sessions.lock().unwrap().remove(&args.session_id);
                self.kill_timers.lock().unwrap().remove(&args.session_id);
            }
        }

        let is_new = self.get(&args.session_id).is_none();

        if is_new {
            self.limiter.acquire();
            let spawned = Session::spawn(
                args.session_id.clone(),
                args.workspace_id.clone(),
                args.pane_id.clone(),
                SpawnArgs {
                    cwd: args.cwd.clone(),
                    cols: args.cols,
                    rows: args.rows,
                    env: args.env.clone(),
                    // A per-request override always wins; otherwise fall
                    // back to the configured default shell before
                    // `Session::spawn` reaches for `$SHELL`.
                    shell: args.shell.clone().or_else(|| self.config.get().shell.clone()),
                },
                self.config.get().scrollback_lines,
                consts::EMULATOR_WIDTH_CAP,
            );
            let session = match spawned {
                Ok(session) => {
                    if let Err(e) = session.wait_for_ready(self.config.spawn_ready_timeout()) {
                        warn!(session_id = %args.session_id, error = %e, "session failed to become ready");
                    }
                    session
                }
                Err(e) => {
                    self.limiter.release();
                    warn!(session_id = %args.session_id, error = %e, "failed to spawn session");
                    return Err(anyhow::anyhow!("CREATE_ATTACH_FAILED"));
                }
            };
            self.limiter.release();

            if !session.is_alive() {
                session.dispose();
                return Err(anyhow::anyhow!("CREATE_ATTACH_FAILED"));
            }

            if !args.initial_commands.is_empty() {
                let joined = format!("{}\n", args.initial_commands.join(" && "));
                if let Err(e) = session.write(&joined) {
                    warn!(session_id = %args.session_id, error = %e, "writing initial commands failed");
                }
            }

            self.sessions.lock().unwrap().insert(args.session_id.clone(), session.clone());
            spawn_exit_watcher(self.clone(), session.clone());

            let snapshot = session.attach(client_id, stream);
            return Ok(CreateOrAttachResult {
                is_new: true,
                was_recovered: false,
                pid: session.child_pid,
                snapshot,
            });
        }

        let session = self.get(&args.session_id).expect("just checked present");
        // Best-effort resize on reattach; errors are ignored per §4.4 step 5.
        let _ = session.resize(args.cols, args.rows);

        let was_recovered = session.is_alive();
        let snapshot = session.attach(client_id, stream);
        Ok(CreateOrAttachResult {
            is_new: false,
            was_recovered,
            pid: session.child_pid,
            snapshot,
        })
    }

    pub fn write(&self, session_id: &str, data: &str) -> Result<(), WriteErr> {
        let session = self.get(session_id).ok_or(WriteErr::NotFound)?;
        if !session.is_attachable() {
            return Err(WriteErr::NotAttachable);
        }
        session.write(data).map_err(|_| WriteErr::NotAttachable)
    }

    /// Silently no-ops on a missing or non-attachable session, to avoid
    /// racing a concurrent kill.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(session) = self.get(session_id) {
            if session.is_attachable() {
                let _ = session.resize(cols, rows);
            }
        }
    }

    pub fn signal(&self, session_id: &str, sig: Signal) {
        if let Some(session) = self.get(session_id) {
            if session.is_attachable() {
                let _ = session.send_signal(sig);
            }
        }
    }

    pub fn detach(&self, client_id: &str, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.detach(client_id);
        }
    }

    pub fn clear_scrollback(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.clear_scrollback();
        }
    }

    /// Arms a fail-safe timer, idempotently: a repeated `kill` on an
    /// already-terminating session is a no-op beyond re-sending the
    /// signal, and never arms a second timer.
    pub fn kill(self: &Arc<Self>, session_id: &str) -> bool {
        let Some(session) = self.get(session_id) else { return false };
        let already_terminating = session.is_terminating();
        let _ = session.kill();
        if !already_terminating {
            self.arm_kill_timer(session_id.to_string());
        }
        true
    }

    pub fn kill_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.kill(&id);
        }
    }

    fn arm_kill_timer(self: &Arc<Self>, session_id: String) {
        {
            let mut timers = self.kill_timers.lock().unwrap();
            if timers.contains_key(&session_id) {
                return;
            }
            timers.insert(session_id.clone(), ());
        }
        let host = self.clone();
        thread::spawn(move || {
            thread::sleep(consts::FORCED_DISPOSAL_TIMEOUT);
            let still_terminating =
                host.get(&session_id).map(|s| s.is_terminating()).unwrap_or(false);
            if still_terminating {
                if let Some(session) = host.get(&session_id) {
                    let _ = session.send_signal(Signal::Terminate);
                    session.dispose();
                }
                host.sessions.lock().unwrap().remove(&session_id);
            }
            host.kill_timers.lock().unwrap().remove(&session_id);
        });
    }

    pub fn list_sessions(&self) -> ListSessionsResult {
        let sessions = self.sessions.lock().unwrap();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let created_at_unix_ms = to_unix_ms(session.created_at);
            let last_attached_at_unix_ms = to_unix_ms(session.last_attached_at());
            out.push(SessionDescriptor {
                session_id: session.id.clone(),
                workspace_id: session.workspace_id.clone(),
                pane_id: session.pane_id.clone(),
                // Deliberately reports `isAttachable`, not raw liveness: a
                // concurrent caller choosing a target must see "not
                // available" the instant a kill begins.
                is_alive: session.is_attachable(),
                attached_clients: session.attached_count(),
                pid: session.child_pid,
                created_at_unix_ms,
                last_attached_at_unix_ms,
                shell: session.shell.clone(),
            });
        }
        ListSessionsResult { sessions: out }
    }

    /// Called by the connection registry on disconnect for every session
    /// the closing socket was attached to.
    pub fn detach_from_all_sessions(&self, client_id: &str) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.detach(client_id);
            if !session.is_alive() && session.attached_count() == 0 {
                session.dispose();
                self.sessions.lock().unwrap().remove(&session.id);
            }
        }
    }

    pub fn dispose(&self) {
        self.kill_timers.lock().unwrap().clear();
        let sessions: Vec<Arc<Session>> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        let deadline = SystemTime::now() + consts::SHUTDOWN_DISPOSE_ALL_CAP;
        for session in sessions {
            session.dispose();
            if SystemTime::now() > deadline {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub enum WriteErr {
    NotFound,
    NotAttachable,
}

fn to_unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Watches a session's own exit notifier and runs the §4.4 exit-handling
/// protocol: clear the kill timer, broadcast to the unattached-exit sink if
/// nobody was attached, then schedule a delayed cleanup that re-schedules
/// itself if a client has since attached.
fn spawn_exit_watcher(host: Arc<Host>, session: Arc<Session>) {
    let notifier = session.exit_notifier.clone();
    thread::spawn(move || {
        let status = notifier.wait(None);
        host.kill_timers.lock().unwrap().remove(&session.id);

        if session.attached_count() == 0 {
            if let Some(sink) = host.exit_sink.lock().unwrap().as_ref() {
                sink.on_unattached_exit(&session.id, status);
            }
        }

        schedule_cleanup(host, session);
    });
}

fn schedule_cleanup(host: Arc<Host>, session: Arc<Session>) {
    thread::spawn(move || {
        thread::sleep(consts::UNATTACHED_EXIT_CLEANUP_DELAY);
        if session.attached_count() == 0 {
            session.dispose();
            host.sessions.lock().unwrap().remove(&session.id);
        } else {
            schedule_cleanup(host, session);
        }
    });
}
