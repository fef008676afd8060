//! The dependency resolver and dispatcher.
//!
//! A single dispatcher context owns the run queue and is the only
//! steady-state writer of the task database. Each pass drains reaped child
//! exits, re-evaluates which waiting tasks became ready, dispatches them in
//! deterministic `(insertion_index, name)` order, and then blocks on the
//! event bus until something changes.
//!
//! Dispatching a task forks and execs the external launcher; the child
//! applies I/O redirections and substitutes `${TASK_PID}` into the argument
//! vector before `execve`, so the command sees its own PID even though the
//! supervisor built the argv beforehand.

use std::ffi::CString;

use log::{error, trace, warn};

use crate::error::{Error, Result};
use crate::events::ShutdownRequest;
use crate::launcher::build_launcher_argv;
use crate::lock_ext::{MutexExt, RwLockExt};
use crate::ready_queue::ReadyQueue;
use crate::runtime_info::{ArcRuntimeInfo, PidEntry};
use crate::task::{
    IoRedirect, RedirMode, RedirStream, RedirTarget, TaskExit, TaskState, expand_task_pid,
};

/// Fallback wait when no external-event poll deadline applies.
const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

/// Run the dispatcher until a shutdown request is latched or the task
/// database is empty. Returns the request, or `None` when the database
/// drained.
pub fn run_dispatcher(run_info: &ArcRuntimeInfo) -> Option<ShutdownRequest> {
    let mut queue = ReadyQueue::new();
    let mut last_seq = 0u64;

    loop {
        // Child exits first: a task's wait/fail event must be published
        // before anything depending on it is re-evaluated.
        for (name, exit) in run_info.bus.drain_exits() {
            handle_task_exit(run_info, &name, exit);
        }

        if let Some(req) = run_info.bus.shutdown_requested() {
            // Pending dispatches are dropped; the stop sequence owns the
            // database from here.
            while queue.pop_front().is_some() {}
            trace!("Dispatcher observed shutdown latch ({req:?})");
            return Some(req);
        }

        collect_ready(run_info, &mut queue);
        while let Some(name) = queue.pop_front() {
            start_task(run_info, &name);
        }

        if run_info.task_db.read_poisoned().is_empty() {
            trace!("Task database is empty, dispatcher done");
            return None;
        }

        let timeout = {
            let opts = run_info.opts.borrow();
            if opts.use_elos {
                opts.elos_poll_interval
            } else {
                IDLE_WAIT
            }
        };
        last_seq = run_info.bus.wait_for_activity(last_seq, timeout);
    }
}

/// Move every waiting task whose constraints are satisfied to `READY` and
/// queue it. Iteration follows database insertion order, which makes the
/// drain order the `(insertion_index, name)` tuple order.
fn collect_ready(run_info: &ArcRuntimeInfo, queue: &mut ReadyQueue) {
    let bus = &run_info.bus;
    let ext = &run_info.ext_events;
    let mut db = run_info.task_db.write_poisoned();

    for task in db.iter_mut() {
        if task.state == TaskState::Loaded {
            task.set_state(TaskState::Waiting);
        }
        // Completed tasks with a trigger set re-enter the evaluation path.
        let reentry =
            matches!(task.state, TaskState::Done | TaskState::Failed) && !task.trig.is_empty();
        if task.state != TaskState::Waiting && !reentry {
            continue;
        }

        if !task.deps.iter().all(|dep| bus.has_fired(dep)) {
            continue;
        }
        if !task.filters.iter().all(|f| ext.satisfied(f)) {
            continue;
        }
        if !task.trig.is_empty() {
            let armed = task
                .trig
                .iter()
                .any(|t| bus.fired_after(t, task.last_completion_seq));
            if !armed {
                continue;
            }
        }

        task.set_state(TaskState::Ready);
        queue.push_back(&task.name);
    }
}

/// Dispatch the current start command of a ready task.
///
/// Any error on the way to `execve` is recorded on the task (`FAILED` plus a
/// published `fail` event) and does not abort the dispatcher.
pub fn start_task(run_info: &ArcRuntimeInfo, name: &str) {
    match spawn_current_command(run_info, name) {
        Ok(()) => {}
        Err(e) => {
            error!("Could not start task {name}: {e}");
            let mut db = run_info.task_db.write_poisoned();
            if let Some(task) = db.lookup_mut(name) {
                task.mark_failed(&run_info.bus);
            }
        }
    }
}

fn spawn_current_command(run_info: &ArcRuntimeInfo, name: &str) -> Result<()> {
    let (argv, env_vec, redirs, cgroup) = {
        let mut db = run_info.task_db.write_poisoned();
        let opts = run_info.opts.borrow();
        let task = db
            .lookup_mut(name)
            .ok_or_else(|| Error::NotFound(format!("task {name} vanished before dispatch")))?;
        if !matches!(task.state, TaskState::Ready | TaskState::Running) {
            return Err(Error::Conflict(format!(
                "task {name} is {} and cannot be dispatched",
                task.state
            )));
        }
        task.set_state(TaskState::Starting);
        let cmd = task.start_cmds[task.current_cmd].clone();
        trace!("Dispatching task {name} command #{}: {:?}", task.current_cmd, cmd.argv);

        let argv = build_launcher_argv(&opts.launcher_cmd, task, &cmd)?;
        let mut env = opts.env.clone();
        env.merge_from(&task.env);
        let env_vec = env
            .iter()
            .map(|(k, v)| {
                CString::new(format!("{k}={v}")).map_err(|_| {
                    Error::InvalidInput(format!("NUL byte in environment entry {k}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        (argv, env_vec, task.ioredir.clone(), task.cgroup.clone())
    };

    // The launcher moves the child into the cgroup; the supervisor only
    // makes sure the group exists with its parameters applied.
    if let Some(cg) = &cgroup {
        cg.configure()?;
    }

    let pid = spawn_via_launcher(run_info, PidEntry::Task(name.to_owned()), argv, env_vec, redirs)?;

    let mut db = run_info.task_db.write_poisoned();
    if let Some(task) = db.lookup_mut(name) {
        task.mark_spawned(pid, &run_info.bus);
    }
    Ok(())
}

/// Fork and exec an argument vector built for the launcher, registering the
/// child in the PID table under `entry`.
///
/// The PID-table lock is held across the fork so the signal thread cannot
/// observe the child's exit before its entry exists.
pub fn spawn_via_launcher(
    run_info: &ArcRuntimeInfo,
    entry: PidEntry,
    argv: Vec<CString>,
    env: Vec<CString>,
    redirs: Vec<IoRedirect>,
) -> Result<nix::unistd::Pid> {
    let mut pid_table = run_info.pid_table.lock_poisoned();
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => child_setup_and_exec(argv, env, redirs),
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            pid_table.insert(child, entry);
            Ok(child)
        }
        Err(e) => Err(Error::os("fork", e)),
    }
}

/// Everything the child does between fork and exec.
///
/// DO NOT USE THE LOGGER HERE: it takes a global lock that another thread of
/// the parent may have held at fork time, and in the child that lock will
/// never be released. Errors go to the raw stderr fd instead.
fn child_setup_and_exec(argv: Vec<CString>, env: Vec<CString>, redirs: Vec<IoRedirect>) -> ! {
    let pid = nix::unistd::getpid();

    // Per-instance expansion: the PID only exists after fork, so the marker
    // is substituted here, just before execve.
    let mut expanded = Vec::with_capacity(argv.len());
    for arg in &argv {
        let Ok(text) = arg.to_str() else {
            child_die("launcher argument is not UTF-8");
        };
        let Ok(arg) = CString::new(expand_task_pid(text, pid)) else {
            child_die("expanded launcher argument contains NUL");
        };
        expanded.push(arg);
    }

    if let Err(msg) = apply_redirections(&redirs) {
        child_die(msg);
    }

    let _ = nix::unistd::execve(&expanded[0], &expanded, &env);
    child_die("execve of the launcher failed");
}

fn child_die(msg: &str) -> ! {
    // write(2) straight to stderr; no allocation, no locks.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr().cast(),
            msg.len(),
        );
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }
    std::process::exit(127);
}

/// Apply `IO_REDIRECT` descriptors in the child.
fn apply_redirections(redirs: &[IoRedirect]) -> std::result::Result<(), &'static str> {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    for redir in redirs {
        match &redir.target {
            RedirTarget::Stream(src) => {
                // fd-to-fd: point the redirected stream at the other one.
                if unsafe { libc::dup2(src.fd(), redir.stream.fd()) } < 0 {
                    return Err("dup2 of stream redirection failed");
                }
            }
            RedirTarget::Path(path) => {
                let mode_bits = redir.file_mode.unwrap_or(0o644);
                let mode = Mode::from_bits_truncate(mode_bits);
                if redir.mode == RedirMode::Pipe {
                    match nix::unistd::mkfifo(path.as_path(), mode) {
                        Ok(()) | Err(nix::Error::EEXIST) => {}
                        Err(_) => return Err("mkfifo for PIPE redirection failed"),
                    }
                }
                let flags = match (redir.stream, redir.mode) {
                    (RedirStream::Stdin, _) => OFlag::O_RDONLY,
                    (_, RedirMode::Append) => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
                    (_, RedirMode::Truncate) => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                    (_, RedirMode::Pipe) => OFlag::O_WRONLY,
                };
                let fd = match nix::fcntl::open(path.as_path(), flags, mode) {
                    Ok(fd) => fd,
                    Err(_) => return Err("open of redirection target failed"),
                };
                use std::os::fd::AsRawFd;
                if unsafe { libc::dup2(fd.as_raw_fd(), redir.stream.fd()) } < 0 {
                    return Err("dup2 of redirection target failed");
                }
                // fd is closed when the OwnedFd drops.
            }
        }
    }
    Ok(())
}

/// Apply the exit policy for a task whose child left.
pub fn handle_task_exit(run_info: &ArcRuntimeInfo, name: &str, exit: TaskExit) {
    let continue_sequence = {
        let mut db = run_info.task_db.write_poisoned();
        let Some(task) = db.lookup_mut(name) else {
            warn!("Exit of unknown task {name} ({exit})");
            return;
        };
        if !matches!(task.state, TaskState::Running | TaskState::Starting) {
            warn!("Task {name} child exited ({exit}) but task is {}", task.state);
            return;
        }

        if exit.clean() {
            task.current_cmd += 1;
            if task.current_cmd < task.start_cmds.len() {
                // Next command of the sequence; the task stays RUNNING.
                task.clear_pid();
                true
            } else {
                trace!("Task {name} completed its command sequence");
                task.mark_done(&run_info.bus);
                false
            }
        } else if task.respawn_budget_left() {
            trace!(
                "Task {name} left with {exit}; respawning (retry {}/{})",
                task.retries_used + 1,
                task.respawn_retries
            );
            task.mark_respawning();
            false
        } else {
            error!("Task {name} failed with {exit}");
            task.mark_failed(&run_info.bus);
            false
        }
    };

    if continue_sequence {
        start_task(run_info, name);
    }
}

/// Collect every filter the external-event poller must evaluate: global
/// definitions plus each task's own.
pub fn collect_filters(run_info: &ArcRuntimeInfo) -> Vec<crate::elos::EventFilter> {
    let mut filters = run_info.opts.borrow().filters.clone();
    let db = run_info.task_db.read_poisoned();
    for task in db.iter() {
        filters.extend(task.filters.iter().cloned());
    }
    filters
}

/// Check the `RUNNING` holds-a-PID invariant over the whole database.
#[cfg(test)]
pub fn running_pid_invariant_holds(db: &crate::task_db::TaskDb) -> bool {
    db.iter().all(|t| match t.state {
        TaskState::Running => t.pid.is_some(),
        TaskState::Starting => true,
        _ => t.pid.is_none(),
    })
}
