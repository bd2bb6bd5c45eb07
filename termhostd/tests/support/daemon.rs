use std::{
    fs,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::termhostd_bin;

/// A handle to a `termhostd daemon` subprocess. Kills the subprocess, and
/// removes its temp dir (if this handle owns one), when dropped. Grounded on
/// the teacher's `tests/support/daemon::Proc`.
pub struct Proc {
    pub proc: process::Child,
    _tmp_dir: Option<TempDir>,
    pub dir: PathBuf,
    pub socket_path: PathBuf,
    pub token: String,
}

impl Proc {
    pub fn new(config_toml: &str) -> anyhow::Result<Proc> {
        let tmp_dir =
            tempfile::Builder::new().prefix("termhostd-test").tempdir().context("creating tmp dir")?;
        let dir = tmp_dir.path().to_path_buf();
        Self::spawn_in(dir, Some(tmp_dir), config_toml)
    }

    /// Starts a second daemon pointed at a directory an earlier `Proc`
    /// already created (and is still holding open), without taking
    /// ownership of that directory's lifetime. Used to exercise the
    /// stale-socket reclaim path against a real leftover socket file.
    pub fn new_in_existing_dir(dir: &Path, config_toml: &str) -> anyhow::Result<Proc> {
        Self::spawn_in(dir.to_path_buf(), None, config_toml)
    }

    fn spawn_in(dir: PathBuf, tmp_dir: Option<TempDir>, config_toml: &str) -> anyhow::Result<Proc> {
        let config_path = dir.join("config.toml");
        fs::write(&config_path, config_toml).context("writing test config")?;

        let log_file = dir.join("daemon.log");
        let mut cmd = Command::new(termhostd_bin()?);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--dir")
            .arg("termhost-test")
            .arg("--config-file")
            .arg(&config_path)
            .env("XDG_RUNTIME_DIR", &dir)
            .arg("daemon");
        let proc = cmd.spawn().context("spawning termhostd daemon process")?;

        let socket_path = dir.join("termhost-test").join("terminal-host.sock");
        let token_path = dir.join("termhost-test").join("terminal-host.token");

        super::wait_until(|| Ok(UnixStream::connect(&socket_path).is_ok()))
            .context("waiting for daemon socket to come up")?;

        let mut sleep_dur = time::Duration::from_millis(5);
        let token = loop {
            match fs::read_to_string(&token_path) {
                Ok(t) if !t.is_empty() => break t,
                _ => {
                    std::thread::sleep(sleep_dur);
                    sleep_dur *= 2;
                }
            }
        };

        Ok(Proc { proc, _tmp_dir: tmp_dir, dir, socket_path, token })
    }

    pub fn connect(&self) -> anyhow::Result<UnixStream> {
        UnixStream::connect(&self.socket_path).context("connecting to daemon socket")
    }

    /// Sends `SIGKILL` directly, leaving the socket file behind the way an
    /// unclean shutdown would (unlike a graceful `kill()`, which would let
    /// the signal handler clean up after itself).
    pub fn hard_kill(&mut self) {
        unsafe {
            libc::kill(self.proc.id() as libc::pid_t, libc::SIGKILL);
        }
        let _ = self.proc.wait();
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
    }
}
