//! Shared runtime state.
//!
//! One `RuntimeInfo` is created at startup and handed (as an `Arc`) to the
//! dispatcher, the signal thread, and the external-event poller. The
//! dispatcher is the only steady-state writer of the task database; the
//! other threads communicate with it through the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::elos::ExternalEventState;
use crate::events::EventBus;
use crate::global_opts::{GlobalOpts, GlobalOptsStore};
use crate::sig::SigContext;
use crate::task::TaskExit;
use crate::task_db::TaskDb;

/// What a reaped PID belonged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidEntry {
    /// Main child of the named task.
    Task(String),
    /// A stop-command helper run for the named task.
    Helper(String),
    /// A helper that has exited; the stop sequence polls for this.
    HelperExited(TaskExit),
}

pub type PidTable = HashMap<nix::unistd::Pid, PidEntry>;

pub struct RuntimeInfo {
    pub task_db: RwLock<TaskDb>,
    pub pid_table: Mutex<PidTable>,
    pub bus: EventBus,
    pub opts: GlobalOptsStore,
    pub ext_events: Arc<ExternalEventState>,
    /// Present when signature checking was enabled on the kernel cmdline.
    pub sig: Option<SigContext>,
}

pub type ArcRuntimeInfo = Arc<RuntimeInfo>;

impl RuntimeInfo {
    pub fn new(task_db: TaskDb, opts: GlobalOpts, sig: Option<SigContext>) -> ArcRuntimeInfo {
        Arc::new(Self {
            task_db: RwLock::new(task_db),
            pid_table: Mutex::new(PidTable::default()),
            bus: EventBus::new(),
            opts: GlobalOptsStore::new(opts),
            ext_events: Arc::new(ExternalEventState::default()),
            sig,
        })
    }
}
