//! A condvar-backed mailbox for a child's exit status, so more than one
//! thread can block on "has this PTY child exited yet" without racing the
//! watcher thread that actually calls `waitpid`. Ported near-verbatim from
//! the teacher's `daemon/exit_notify.rs`.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

/// Either an exit code (normal exit) or a signal number (the child was
/// killed by a signal) -- `waitpid` via `WIFEXITED`/`WIFSIGNALED` only ever
/// produces one of the two, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExitNotifier {
    slot: Mutex<Option<ExitStatus>>,
    cond: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        ExitNotifier { slot: Mutex::new(None), cond: Condvar::new() }
    }

    /// Notify all waiters that the process has exited.
    pub fn notify_exit(&self, status: ExitStatus) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(status);
        self.cond.notify_all();
    }

    /// True if `notify_exit` has already been called.
    pub fn has_exited(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Wait for the process to exit, with an optional timeout to allow the
    /// caller to wake up periodically.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<ExitStatus> {
        let slot = self.slot.lock().unwrap();

        // If a thread waits on the exit status after the child has already
        // exited, just return immediately.
        if slot.is_some() {
            return *slot;
        }

        match timeout {
            Some(t) => {
                let (exit_status, wait_res) = self
                    .cond
                    .wait_timeout_while(slot, t, |exit_status| exit_status.is_none())
                    .unwrap();
                if wait_res.timed_out() { None } else { *exit_status }
            }
            None => *self.cond.wait_while(slot, |exit_status| exit_status.is_none()).unwrap(),
        }
    }
}
