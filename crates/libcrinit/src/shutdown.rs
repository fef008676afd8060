//! Graceful shutdown and the final reboot.
//!
//! When a termination signal latches a shutdown request, the dispatcher
//! returns and hands control here. Active tasks are stopped in reverse
//! dependency order — a task stops before anything it depends on — with
//! tasks of the same level stopped in parallel on a worker pool. Each task's
//! stop commands run through the launcher first, then the main child gets
//! SIGTERM; after the grace period (`SHUTDOWN_GRACE_PERIOD_US`) stragglers
//! are SIGKILLed. The sequence ends in `reboot(2)` when running as PID 1,
//! or a plain return otherwise.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use threadpool::ThreadPool;

use crate::dispatch;
use crate::error::{Error, Result};
use crate::events::ShutdownRequest;
use crate::launcher::build_launcher_argv;
use crate::lock_ext::{MutexExt, RwLockExt};
use crate::runtime_info::{ArcRuntimeInfo, PidEntry};
use crate::task::{Task, TaskState};

/// Worker threads used to stop independent tasks in parallel.
const STOP_POOL_SIZE: usize = 4;

/// How often the wait loops poll for state changes.
const POLL_STEP: Duration = Duration::from_millis(10);

/// Stop all active tasks, then perform the requested final action. Returns
/// only for [`ShutdownRequest::Exit`] or when not PID 1.
pub fn shutdown_sequence(run_info: &ArcRuntimeInfo, req: ShutdownRequest) {
    info!("Shutting down ({req:?})");
    stop_all_tasks(run_info);
    finalize(req);
}

/// Stop every `RUNNING`/`STARTING` task, level by level in reverse
/// dependency order.
pub fn stop_all_tasks(run_info: &ArcRuntimeInfo) {
    let grace = run_info.opts.borrow().shutdown_grace_period;
    let levels = reverse_dependency_levels(run_info);
    let pool = ThreadPool::new(STOP_POOL_SIZE);

    for level in levels {
        for name in &level {
            let run_info = run_info.clone();
            let name = name.clone();
            pool.execute(move || {
                if let Err(e) = stop_one_task(&run_info, &name) {
                    warn!("Stopping task {name}: {e}");
                }
            });
        }
        pool.join();
        // Exits that arrived while stopping feed back into the state
        // machine before the next level is computed.
        drain_exits(run_info);
    }

    // Grace period for everything signalled above.
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        drain_exits(run_info);
        if run_info.task_db.read_poisoned().active_count() == 0 {
            break;
        }
        std::thread::sleep(POLL_STEP);
    }

    // SIGKILL the stragglers.
    let stragglers: Vec<(String, nix::unistd::Pid)> = {
        let db = run_info.task_db.read_poisoned();
        db.iter()
            .filter_map(|t| t.pid.map(|pid| (t.name.clone(), pid)))
            .collect()
    };
    for (name, pid) in stragglers {
        warn!("Task {name} (pid {pid}) survived the grace period, sending SIGKILL");
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    }

    // Give the kills a moment to be reaped so the database settles.
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        drain_exits(run_info);
        if run_info.task_db.read_poisoned().active_count() == 0 {
            return;
        }
        std::thread::sleep(POLL_STEP);
    }
}

fn drain_exits(run_info: &ArcRuntimeInfo) {
    for (name, exit) in run_info.bus.drain_exits() {
        // The dispatcher has returned; the shutdown path applies exit policy
        // so states stay consistent. Respawn re-entries stay WAITING since
        // nothing dispatches anymore.
        dispatch::handle_task_exit(run_info, &name, exit);
    }
}

/// Group active tasks into levels such that every task appears in an earlier
/// level than all tasks it depends on. Ties within a level follow insertion
/// order. Dependency cycles collapse into one final level.
fn reverse_dependency_levels(run_info: &ArcRuntimeInfo) -> Vec<Vec<String>> {
    let db = run_info.task_db.read_poisoned();
    let active: Vec<&Task> = db
        .iter()
        .filter(|t| matches!(t.state, TaskState::Running | TaskState::Starting))
        .collect();

    // dependents[b] = number of active tasks depending on b. A task may stop
    // once no active task depends on it.
    let mut dependents: HashMap<&str, usize> = active.iter().map(|t| (t.name.as_str(), 0)).collect();
    for task in &active {
        for dep in &task.deps {
            if let Some(count) = dependents.get_mut(dep.task.as_str()) {
                *count += 1;
            }
        }
    }

    let mut remaining: Vec<&Task> = active.clone();
    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let (level, rest): (Vec<&Task>, Vec<&Task>) = remaining
            .into_iter()
            .partition(|t| dependents.get(t.name.as_str()).copied().unwrap_or(0) == 0);
        if level.is_empty() {
            // Cycle among the rest; stop them together rather than never.
            warn!("Dependency cycle among tasks to stop; stopping them in one level");
            levels.push(rest.into_iter().map(|t| t.name.clone()).collect());
            break;
        }
        for task in &level {
            for dep in &task.deps {
                if let Some(count) = dependents.get_mut(dep.task.as_str()) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        levels.push(level.into_iter().map(|t| t.name.clone()).collect());
        remaining = rest;
    }
    levels
}

/// Run one task's stop commands through the launcher, then SIGTERM its main
/// child if still alive.
fn stop_one_task(run_info: &ArcRuntimeInfo, name: &str) -> Result<()> {
    let grace = run_info.opts.borrow().shutdown_grace_period;
    let (task_snapshot, launcher) = {
        let db = run_info.task_db.read_poisoned();
        let opts = run_info.opts.borrow();
        let task = db
            .lookup(name)
            .ok_or_else(|| Error::NotFound(format!("task {name} vanished during shutdown")))?;
        (task.clone(), opts.launcher_cmd.clone())
    };

    for cmd in &task_snapshot.stop_cmds {
        trace!("Task {name}: running stop command {:?}", cmd.argv);
        let argv = build_launcher_argv(&launcher, &task_snapshot, cmd)?;
        let env_vec = task_snapshot
            .env
            .iter()
            .map(|(k, v)| {
                CString::new(format!("{k}={v}"))
                    .map_err(|_| Error::InvalidInput(format!("NUL byte in environment entry {k}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let pid = dispatch::spawn_via_launcher(
            run_info,
            PidEntry::Helper(name.to_owned()),
            argv,
            env_vec,
            task_snapshot.ioredir.clone(),
        )?;
        wait_for_helper(run_info, pid, grace);
    }

    let pid = {
        let db = run_info.task_db.read_poisoned();
        db.lookup(name).and_then(|t| t.pid)
    };
    if let Some(pid) = pid {
        trace!("Task {name}: sending SIGTERM to pid {pid}");
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            if e != nix::Error::ESRCH {
                return Err(Error::os(format!("SIGTERM to task {name}"), e));
            }
        }
    }
    Ok(())
}

/// Poll the PID table until the stop helper exited or the deadline passed.
fn wait_for_helper(run_info: &ArcRuntimeInfo, pid: nix::unistd::Pid, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        {
            let mut pid_table = run_info.pid_table.lock_poisoned();
            match pid_table.get(&pid) {
                Some(PidEntry::HelperExited(exit)) => {
                    if !exit.clean() {
                        warn!("Stop helper {pid} finished with {exit}");
                    }
                    pid_table.remove(&pid);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
        if Instant::now() >= deadline {
            warn!("Stop helper {pid} did not finish within the grace period, killing it");
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
            return;
        }
        std::thread::sleep(POLL_STEP);
    }
}

/// The final action. `reboot(2)` never returns on success.
pub fn finalize(req: ShutdownRequest) {
    nix::unistd::sync();

    if nix::unistd::getpid().as_raw() != 1 {
        info!("Not PID 1; leaving the system alone and exiting");
        return;
    }

    let mode = match req {
        ShutdownRequest::Exit => {
            // As PID 1 a plain exit would panic the kernel; treat it as
            // poweroff.
            nix::sys::reboot::RebootMode::RB_POWER_OFF
        }
        ShutdownRequest::Halt => nix::sys::reboot::RebootMode::RB_HALT_SYSTEM,
        ShutdownRequest::Poweroff => nix::sys::reboot::RebootMode::RB_POWER_OFF,
        ShutdownRequest::Reboot => nix::sys::reboot::RebootMode::RB_AUTOBOOT,
    };
    if let Err(e) = nix::sys::reboot::reboot(mode) {
        error!("reboot(2) failed: {e}");
    }
}
