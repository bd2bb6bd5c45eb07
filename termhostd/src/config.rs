use std::{fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::{consts, user};

/// Tunable policy values. The spec is explicit that these are "policy, not
/// contract" (§9) -- implementations may retune them, but must not remove
/// the bound they express. Every field has a default so an empty or absent
/// config file still produces a fully-specified `Config`.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Number of lines of scrollback the emulator keeps per session.
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,

    /// Max number of PTY spawns allowed in flight at once.
    #[serde(default = "default_spawn_concurrency")]
    pub spawn_concurrency: usize,

    /// Directory name (under the daemon home) holding the socket/token/pid
    /// files. Lets a caller run more than one daemon, one per workspace.
    #[serde(default = "default_dir_name")]
    pub dir_name: String,

    /// Shell to launch when a session doesn't ask for a specific command.
    #[serde(default)]
    pub shell: Option<String>,
}

fn default_scrollback_lines() -> usize {
    10_000
}

fn default_spawn_concurrency() -> usize {
    3
}

fn default_dir_name() -> String {
    String::from("termhost")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scrollback_lines: default_scrollback_lines(),
            spawn_concurrency: default_spawn_concurrency(),
            dir_name: default_dir_name(),
            shell: None,
        }
    }
}

/// Loads a `Config`, falling back to `Config::default()` piece by piece for
/// anything the file doesn't specify. Mirrors the teacher's
/// `read_config`/`config::Manager` split: parsing is a pure function, kept
/// separate from the long-lived handle the rest of the daemon holds.
#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    if let Some(path) = config_file {
        info!("parsing explicitly passed in config ({})", path);
        let raw = fs::read_to_string(path).context("reading config toml")?;
        return toml::from_str(&raw).context("parsing config file");
    }

    let mut default_path = PathBuf::from(user::info()?.home_dir);
    default_path.push(".config");
    default_path.push("termhost");
    default_path.push("config.toml");
    if default_path.exists() {
        let raw = fs::read_to_string(&default_path).context("reading default config toml")?;
        return toml::from_str(&raw).context("parsing default config file");
    }

    Ok(Config::default())
}

/// A cheaply-cloneable handle to an immutable config snapshot, loaded once
/// at startup. Kept as its own type (rather than a bare `Config`) so that
/// call sites read `config.get()` the way the rest of the daemon's
/// teacher-derived modules expect, leaving room for hot-reload later
/// without changing every call site.
#[derive(Clone, Debug)]
pub struct Manager {
    config: Config,
}

impl Manager {
    pub fn new(config_file: &Option<String>) -> anyhow::Result<Self> {
        Ok(Manager { config: read_config(config_file)? })
    }

    pub fn get(&self) -> &Config {
        &self.config
    }

    pub fn spawn_ready_timeout(&self) -> std::time::Duration {
        consts::SPAWN_READY_TIMEOUT
    }
}
