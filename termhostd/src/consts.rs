use std::time;

/// How long `createOrAttach` waits for a freshly spawned PTY to report
/// itself runnable before giving up (spawn is still usable afterwards, see
/// §5). Matches the teacher's `SOCK_STREAM_TIMEOUT`/`HEARTBEAT_DURATION`
/// convention of naming every timing knob as a `const`.
pub const SPAWN_READY_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Connect timeout used when probing a pre-existing socket file at startup
/// to decide whether a daemon is already live on it.
pub const STALE_SOCKET_PROBE_TIMEOUT: time::Duration = time::Duration::from_secs(1);

/// How long a `terminating` session is given to exit on its own before
/// `kill`'s fail-safe timer force-disposes it.
pub const FORCED_DISPOSAL_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Overall wall-clock cap on disposing every session during shutdown.
pub const SHUTDOWN_DISPOSE_ALL_CAP: time::Duration = time::Duration::from_secs(5);

/// Grace period between replying to `shutdown` and actually exiting.
pub const SHUTDOWN_GRACE: time::Duration = time::Duration::from_millis(100);

/// How long an unattached-and-dead session is kept around before cleanup,
/// to give a notified client time to detach cleanly.
pub const UNATTACHED_EXIT_CLEANUP_DELAY: time::Duration = time::Duration::from_secs(5);

/// Upper bound on the length of a line logged verbatim on a decode failure.
/// Longer lines are truncated before redaction and logging.
pub const MAX_LOGGED_LINE: usize = 100;

/// `write` request ids with this prefix suppress their success response
/// (see §4.5, the notify-write optimization).
pub const NOTIFY_ID_PREFIX: &str = "notify_";

/// Read buffer size used when pumping bytes out of a PTY master.
pub const PTY_READ_BUF_SIZE: usize = 1024 * 16;

/// Column width handed to the emulator's internal rope. Kept large (as the
/// teacher's `VTERM_WIDTH` is) because the emulator eagerly allocates rows.
pub const EMULATOR_WIDTH_CAP: u16 = 1024;
