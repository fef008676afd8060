//! Process-wide typed options.
//!
//! The series file and the kernel command line populate one record of
//! well-known options. Access follows a borrow/remit discipline: callers
//! obtain exclusive access through [`GlobalOptsStore::borrow`], mutate or
//! read, and remit by dropping the guard. There are no concurrent readers;
//! the store is consulted rarely (startup, dispatch decisions, shutdown).

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::cgroup::CgroupConfig;
use crate::elos::EventFilter;
use crate::envset::EnvSet;
use crate::lock_ext::MutexExt;

pub const DEFAULT_TASK_DIR: &str = "/etc/crinit";
pub const DEFAULT_TASK_SUFFIX: &str = ".crinit";
pub const DEFAULT_INCLUDE_SUFFIX: &str = ".crincl";
pub const DEFAULT_LAUNCHER_CMD: &str = "/usr/bin/crinit-launch";
pub const DEFAULT_SIGKEY_DIR: &str = "/etc/crinit/keys";
pub const DEFAULT_ELOS_SERVER: &str = "127.0.0.1";
pub const DEFAULT_ELOS_PORT: u16 = 54321;
pub const DEFAULT_ELOS_POLL_INTERVAL_US: u64 = 500_000;
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_US: u64 = 100_000;

/// The typed global option record. Field defaults are set by
/// [`GlobalOpts::default`]; the series-file and kernel-cmdline handlers
/// overwrite them.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    /// `DEBUG` — verbose logging.
    pub debug: bool,
    /// `USE_SYSLOG` — hand the log stream to syslog once the socket exists.
    pub use_syslog: bool,
    /// `USE_ELOS` — enable the external-event poller.
    pub use_elos: bool,
    /// `ELOS_SERVER` / `ELOS_PORT` — where the event manager listens.
    pub elos_server: String,
    pub elos_port: u16,
    /// `ELOS_EVENT_POLL_INTERVAL` — polling cadence, microseconds in the
    /// file, non-zero.
    pub elos_poll_interval: Duration,
    /// `SHUTDOWN_GRACE_PERIOD_US` — time between SIGTERM and SIGKILL.
    pub shutdown_grace_period: Duration,
    /// `LAUNCHER_CMD` — path of the privilege-dropping launch helper.
    pub launcher_cmd: PathBuf,
    /// `TASKS` — explicit task file names, loaded in addition to the
    /// `TASKDIR` scan.
    pub tasks: Vec<String>,
    /// `TASKDIR` / `TASK_SUFFIX` / `TASKDIR_FOLLOW_SYMLINKS` — task scan.
    pub task_dir: PathBuf,
    pub task_suffix: String,
    pub task_dir_follow_symlinks: bool,
    /// `INCLUDEDIR` — where `INCLUDE` directives resolve; defaults to the
    /// task directory when unset.
    pub include_dir: Option<PathBuf>,
    pub include_suffix: String,
    /// Global `ENV_SET` entries, merged under every task's fragment.
    pub env: EnvSet,
    /// Global `FILTER_DEFINE` entries.
    pub filters: Vec<EventFilter>,
    /// Root-level `CGROUP` declarations that task cgroups may nest under.
    pub root_cgroups: Vec<CgroupConfig>,
    /// `crinit.signatures` — require signature verification of config files.
    pub signatures: bool,
    /// `crinit.sigkeydir` — where signed signer keys live.
    pub sigkey_dir: PathBuf,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            debug: false,
            use_syslog: false,
            use_elos: false,
            elos_server: DEFAULT_ELOS_SERVER.to_owned(),
            elos_port: DEFAULT_ELOS_PORT,
            elos_poll_interval: Duration::from_micros(DEFAULT_ELOS_POLL_INTERVAL_US),
            shutdown_grace_period: Duration::from_micros(DEFAULT_SHUTDOWN_GRACE_PERIOD_US),
            launcher_cmd: PathBuf::from(DEFAULT_LAUNCHER_CMD),
            tasks: Vec::new(),
            task_dir: PathBuf::from(DEFAULT_TASK_DIR),
            task_suffix: DEFAULT_TASK_SUFFIX.to_owned(),
            task_dir_follow_symlinks: true,
            include_dir: None,
            include_suffix: DEFAULT_INCLUDE_SUFFIX.to_owned(),
            env: EnvSet::default(),
            filters: Vec::new(),
            root_cgroups: Vec::new(),
            signatures: false,
            sigkey_dir: PathBuf::from(DEFAULT_SIGKEY_DIR),
        }
    }
}

impl GlobalOpts {
    /// The effective include directory.
    pub fn include_dir(&self) -> PathBuf {
        self.include_dir
            .clone()
            .unwrap_or_else(|| self.task_dir.clone())
    }
}

/// Exclusive-access wrapper around the option record.
pub struct GlobalOptsStore {
    inner: Mutex<GlobalOpts>,
}

impl Default for GlobalOptsStore {
    fn default() -> Self {
        Self::new(GlobalOpts::default())
    }
}

impl GlobalOptsStore {
    pub fn new(opts: GlobalOpts) -> Self {
        Self {
            inner: Mutex::new(opts),
        }
    }

    /// Borrow the record exclusively. Dropping the guard remits it.
    pub fn borrow(&self) -> MutexGuard<'_, GlobalOpts> {
        self.inner.lock_poisoned()
    }
}
