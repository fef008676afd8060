//! Handle signals sent to the init process.
//!
//! A `signal-hook` iterator thread receives the signals outside of signal
//! context (the crate's internal handler only writes a self-pipe byte), so
//! everything here may take locks and allocate. `SIGCHLD` triggers a
//! `waitpid(-1, WNOHANG)` reap loop; each reaped PID is reduced to a
//! [`TaskExit`] and routed through the PID table — main-task exits are
//! queued on the event bus for the dispatcher's exit policy, stop-helper
//! exits are parked in the table for the shutdown path to poll. Termination
//! signals only latch a shutdown request; the dispatcher performs the actual
//! stop sequence, so the task database keeps a single writer.

use log::{error, info, trace};
use signal_hook::iterator::Signals;

use crate::events::ShutdownRequest;
use crate::lock_ext::MutexExt;
use crate::runtime_info::{ArcRuntimeInfo, PidEntry};
use crate::task::TaskExit;

/// The signals the orchestrator listens for.
pub const HANDLED_SIGNALS: &[libc::c_int] = &[
    signal_hook::consts::SIGCHLD,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGUSR1,
];

pub fn handle_signals(mut signals: Signals, run_info: ArcRuntimeInfo) {
    for signal in signals.forever() {
        match signal as libc::c_int {
            signal_hook::consts::SIGCHLD => reap_children(&run_info),
            signal_hook::consts::SIGTERM => {
                info!("Received SIGTERM, initiating poweroff");
                run_info.bus.request_shutdown(ShutdownRequest::Poweroff);
            }
            signal_hook::consts::SIGINT => {
                // Ctrl-Alt-Del arrives as SIGINT on PID 1.
                info!("Received SIGINT, initiating reboot");
                run_info.bus.request_shutdown(ShutdownRequest::Reboot);
            }
            signal_hook::consts::SIGUSR1 => {
                info!("Received SIGUSR1, initiating halt");
                run_info.bus.request_shutdown(ShutdownRequest::Halt);
            }
            _ => unreachable!(),
        }
    }
}

/// Reap every ready child and route its exit. One SIGCHLD may stand for any
/// number of exited children, so this loops until the kernel has nothing
/// more to report.
fn reap_children(run_info: &ArcRuntimeInfo) {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};

    loop {
        let status = match waitpid(nix::unistd::Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            // No children at all right now.
            Err(nix::Error::ECHILD) => return,
            Err(e) => {
                error!("waitpid failed while reaping: {e}");
                return;
            }
        };
        let (pid, exit) = match status {
            WaitStatus::Exited(pid, 0) => (pid, TaskExit::Clean),
            WaitStatus::Exited(pid, code) => (pid, TaskExit::Code(code)),
            WaitStatus::Signaled(pid, signal, _core_dumped) => (pid, TaskExit::Signal(signal)),
            WaitStatus::StillAlive => return,
            other => {
                // Stop/continue notifications are of no interest to the
                // supervisor.
                trace!("Ignored child state change: {other:?}");
                continue;
            }
        };
        route_exit(run_info, pid, exit);
    }
}

fn route_exit(run_info: &ArcRuntimeInfo, pid: nix::unistd::Pid, exit: TaskExit) {
    let task_name = {
        let mut pid_table = run_info.pid_table.lock_poisoned();
        match pid_table.get(&pid) {
            Some(PidEntry::Task(name)) => {
                let name = name.clone();
                pid_table.remove(&pid);
                Some(name)
            }
            Some(PidEntry::Helper(name)) => {
                trace!("Stop helper for task {name} finished ({exit})");
                pid_table.insert(pid, PidEntry::HelperExited(exit));
                None
            }
            Some(PidEntry::HelperExited(_)) => {
                error!("PID {pid} was reaped twice");
                None
            }
            None => {
                trace!("Reaped PID {pid} without a table entry; adopted orphan");
                None
            }
        }
    };

    if let Some(name) = task_name {
        trace!("Task {name} child {pid} left ({exit})");
        run_info.bus.push_exit(name, exit);
    }
}
