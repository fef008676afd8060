//! Startup wiring for the init process.
//!
//! Boot order: kernel-cmdline overrides → signature subsystem (when enabled)
//! → series file → logging → root cgroups → task loading → helper threads →
//! dispatcher. A failure before the task database exists is fatal (the exit
//! code is non-zero only when the initial configuration could not be
//! loaded); afterwards, errors stay confined to their task.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use signal_hook::iterator::Signals;

use crate::conf;
use crate::dispatch;
use crate::elos;
use crate::error::Result;
use crate::fseries::FileSeries;
use crate::global_opts::GlobalOpts;
use crate::logging;
use crate::runtime_info::{ArcRuntimeInfo, RuntimeInfo};
use crate::shutdown;
use crate::sig::{DEFAULT_ROOT_KEY_DESC, SigContext};
use crate::signal_handler::{self, HANDLED_SIGNALS};
use crate::task_db::TaskDb;

const DEFAULT_SERIES_FILE: &str = "/etc/crinit/default.series";

#[derive(Parser, Debug)]
#[command(name = "crinit", about = "Task-based init and service supervisor")]
struct CliArgs {
    /// Path of the series file to boot from.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    dry_run: bool,
}

/// Main entry of the init process. Returns only on clean non-PID-1 exit.
pub fn run_init() {
    let cli = CliArgs::parse();
    let series_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERIES_FILE));

    let mut opts = GlobalOpts::default();

    // The kernel command line decides whether configuration must be signed,
    // so it is parsed before any file is trusted.
    if let Err(e) = conf::parse_proc_cmdline(&mut opts) {
        // Logging is not up yet.
        eprintln!("crinit: could not parse kernel command line: {e}");
    }

    let sig = match init_signatures(&opts) {
        Ok(sig) => sig,
        Err(e) => {
            eprintln!("crinit: signature subsystem failed: {e}");
            std::process::exit(1);
        }
    };

    if let Some(sig) = &sig {
        if let Err(e) = sig.verify_file(&series_path) {
            eprintln!(
                "crinit: series file {} failed signature verification: {e}",
                series_path.display()
            );
            std::process::exit(1);
        }
    }
    if let Err(e) = conf::parse_series_file(&series_path, &mut opts) {
        eprintln!(
            "crinit: could not load series file {}: {e}",
            series_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = logging::setup_logging(opts.debug) {
        eprintln!("crinit: {e}");
    }
    info!("crinit starting (series file {})", series_path.display());
    if opts.use_syslog {
        // The sink itself is external; the stream stays on stdout for the
        // forwarder to pick up.
        info!("USE_SYSLOG set, log stream is handed to the system log forwarder");
    }

    for cg in &opts.root_cgroups {
        if let Err(e) = cg.configure() {
            warn!("Could not configure root cgroup {}: {e}", cg.name);
        }
    }

    let db = match load_task_db(&opts, sig.as_ref()) {
        Ok(db) => db,
        Err(e) => {
            error!("Could not load the initial task set: {e}");
            std::process::exit(1);
        }
    };
    if db.is_empty() {
        warn!("No tasks loaded; nothing to supervise");
    }

    if cli.dry_run {
        info!("Dry run: {} task(s) loaded and validated, exiting", db.len());
        return;
    }

    let run_info = RuntimeInfo::new(db, opts, sig);

    let signals = match Signals::new(HANDLED_SIGNALS) {
        Ok(signals) => signals,
        Err(e) => {
            error!("Could not set up signal handling: {e}");
            std::process::exit(1);
        }
    };
    spawn_signal_thread(signals, run_info.clone());
    spawn_elos_thread(run_info.clone());

    match dispatch::run_dispatcher(&run_info) {
        Some(req) => shutdown::shutdown_sequence(&run_info, req),
        None => info!("Task database drained; exiting"),
    }
}

/// Bring up the signature subsystem if the kernel command line asked for it.
/// Errors here are fatal to the caller: required signatures that cannot be
/// checked must not degrade into unchecked loading.
fn init_signatures(opts: &GlobalOpts) -> Result<Option<SigContext>> {
    if !opts.signatures {
        return Ok(None);
    }
    let ctx = SigContext::from_keyring(DEFAULT_ROOT_KEY_DESC)?;
    ctx.load_signed_keys(&opts.sigkey_dir)?;
    Ok(Some(ctx))
}

/// Build the task database from the `TASKDIR` scan plus the explicit `TASKS`
/// list. Per-file errors (bad syntax, failed signature, duplicate name) are
/// logged and skip that file; cross-file dependency validation failures are
/// fatal because the scheduler must not run with dangling references.
pub fn load_task_db(opts: &GlobalOpts, sig: Option<&SigContext>) -> Result<TaskDb> {
    let series = FileSeries::from_dir(
        &opts.task_dir,
        &opts.task_suffix,
        opts.task_dir_follow_symlinks,
    )?;

    let mut paths: Vec<PathBuf> = series.paths().collect();
    for name in &opts.tasks {
        let path = if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            opts.task_dir.join(name)
        };
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    let mut db = TaskDb::new();
    for path in &paths {
        if let Err(e) = load_one_task(&mut db, path, opts, sig) {
            error!("Skipping task file {}: {e}", path.display());
        }
    }

    db.validate_deps()?;
    Ok(db)
}

fn load_one_task(
    db: &mut TaskDb,
    path: &Path,
    opts: &GlobalOpts,
    sig: Option<&SigContext>,
) -> Result<()> {
    if let Some(sig) = sig {
        sig.verify_file(path)?;
    }
    let task = conf::parse_task_file(path, opts)?;
    info!("Loaded task {} from {}", task.name, path.display());
    db.insert(task)
}

fn spawn_signal_thread(signals: Signals, run_info: ArcRuntimeInfo) {
    std::thread::spawn(move || {
        signal_handler::handle_signals(signals, run_info);
    });
}

/// Start the external-event poller when `USE_ELOS` is on.
fn spawn_elos_thread(run_info: ArcRuntimeInfo) {
    let conf = {
        let opts = run_info.opts.borrow();
        if !opts.use_elos {
            return;
        }
        elos::ElosConfig {
            server: opts.elos_server.clone(),
            port: opts.elos_port,
            poll_interval: opts.elos_poll_interval,
        }
    };
    let filters = dispatch::collect_filters(&run_info);
    let state = Arc::clone(&run_info.ext_events);
    std::thread::spawn(move || {
        elos::poll_external_events(&conf, &filters, &run_info.bus, &state);
    });
}
