//! C6 signal handling: interrupt, terminate, and hangup all trigger the same
//! orderly shutdown. Grounded on the teacher's `daemon/signals.rs`, adapted
//! to dispose the Terminal Host (not just unlink a socket) before exiting,
//! and to add SIGHUP to the set the teacher watches.

use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{error, info};

use crate::daemon::host::Host;

pub struct Handler {
    host: Arc<Host>,
    sock_path: PathBuf,
    pid_path: PathBuf,
}

impl Handler {
    pub fn new(host: Arc<Host>, sock_path: PathBuf, pid_path: PathBuf) -> Self {
        Handler { host, sock_path, pid_path }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // TERM_SIGNALS covers SIGTERM/SIGINT/SIGQUIT; SIGHUP triggers the
        // same orderly shutdown rather than the default terminate-on-hangup
        // behavior.
        let shutdown_signals: Vec<i32> =
            TERM_SIGNALS.iter().copied().chain(std::iter::once(libc::SIGHUP)).collect();

        // Arms immediate exit on a second shutdown signal, so mashing ^C
        // twice never gets stuck waiting for a graceful shutdown that
        // refuses to finish.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in &shutdown_signals {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(&shutdown_signals).context("creating signal iterator")?;
        thread::spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(shutdown_signals.contains(&signal));

                info!(signal, "received term signal, disposing terminal host");
                self.host.dispose();

                if let Err(e) = std::fs::remove_file(&self.sock_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!(error = %e, "cleaning up socket file");
                    }
                }
                if let Err(e) = std::fs::remove_file(&self.pid_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!(error = %e, "cleaning up pid file");
                    }
                }

                info!("exiting after signal shutdown");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
