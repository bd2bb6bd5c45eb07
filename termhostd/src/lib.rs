//! termhostd: a long-lived background process that owns OS PTY child
//! processes on behalf of transient GUI clients, multiplexing many
//! concurrent sessions and many concurrent clients per session over a local
//! Unix-domain socket.
//!
//! See `daemon` (C2-C6), `codec` (C1), and the sibling `termhost-protocol`
//! crate for the wire types. CLI shape and the logging/runtime-dir setup in
//! `run` are grounded on the teacher's `libshpool::Args`/`libshpool::run`.

use std::{env, fs, io, path::PathBuf, sync::Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod codec;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod tty;
pub mod user;

/// Command-line arguments for termhostd. There is exactly one subcommand:
/// this daemon has no human-facing attach/detach/list CLI of its own, since
/// every client in scope is a GUI speaking the wire protocol directly.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to; defaults to stderr")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        help = "Directory name under the daemon home holding the socket/token/pid files"
    )]
    pub dir: Option<String>,

    #[clap(short, long, action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Starts the terminal host daemon")]
    Daemon,
}

pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file).context("opening log file")?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config_manager = config::Manager::new(&args.config_file)?;

    let home_dir = match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            PathBuf::from(user::info()?.home_dir).join(".local").join("state")
        }
    }
    .join(args.dir.as_deref().unwrap_or(&config_manager.get().dir_name));

    let res = match args.command {
        Commands::Daemon => daemon::run(config_manager, home_dir),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
