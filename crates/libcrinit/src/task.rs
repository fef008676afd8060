//! The in-memory task model.
//!
//! A task is a named, supervised unit of work: ordered start/stop command
//! sequences, dependency and trigger sets, an environment fragment, identity
//! and capability settings for the launcher, and a runtime state machine.
//! Tasks are produced by the configuration parser (via [`TaskBuilder`]),
//! owned by the task database, and driven by the dispatcher.

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use log::trace;

use crate::cgroup::CgroupConfig;
use crate::elos::EventFilter;
use crate::envset::EnvSet;
use crate::error::{Error, Result};
use crate::events::EventBus;

/// Built-in event fired when a task's main command has been started.
pub const EVENT_SPAWN: &str = "spawn";
/// Built-in event fired after a task's command sequence completed successfully.
pub const EVENT_WAIT: &str = "wait";
/// Built-in event fired on non-recoverable failure.
pub const EVENT_FAIL: &str = "fail";

/// Marker substituted with the child PID in command arguments.
pub const TASK_PID_MARKER: &str = "${TASK_PID}";

/// A `(task_name, event_name)` pair, used both for dependencies/triggers and
/// as the payload of bus events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepRef {
    pub task: String,
    pub event: String,
}

impl DepRef {
    /// Parse the `name:event` form used by `DEPENDS` and `TRIGGER`.
    pub fn parse(text: &str) -> Result<Self> {
        let (task, event) = text.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!("dependency is not of the form name:event: {text}"))
        })?;
        if task.is_empty() || event.is_empty() {
            return Err(Error::InvalidInput(format!(
                "dependency has empty task or event name: {text}"
            )));
        }
        Ok(Self {
            task: task.to_owned(),
            event: event.to_owned(),
        })
    }
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task, self.event)
    }
}

/// An argument vector for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
}

impl Command {
    /// Split a `COMMAND` / `STOP_COMMAND` value into an argument vector,
    /// honoring shell-style quoting.
    pub fn parse(text: &str) -> Result<Self> {
        let argv = shlex::split(text)
            .ok_or_else(|| Error::InvalidInput(format!("unbalanced quoting in command: {text}")))?;
        if argv.is_empty() {
            return Err(Error::InvalidInput("empty command".into()));
        }
        Ok(Self { argv })
    }
}

/// Standard stream named in an `IO_REDIRECT` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirStream {
    Stdin,
    Stdout,
    Stderr,
}

impl RedirStream {
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_uppercase().as_str() {
            "STDIN" => Ok(Self::Stdin),
            "STDOUT" => Ok(Self::Stdout),
            "STDERR" => Ok(Self::Stderr),
            _ => Err(Error::InvalidInput(format!(
                "unknown stream in IO_REDIRECT: {text}"
            ))),
        }
    }

    pub fn fd(self) -> RawFd {
        match self {
            Self::Stdin => libc::STDIN_FILENO,
            Self::Stdout => libc::STDOUT_FILENO,
            Self::Stderr => libc::STDERR_FILENO,
        }
    }
}

/// Where a redirected stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirTarget {
    /// A path opened according to the mode.
    Path(PathBuf),
    /// Another standard stream (fd-to-fd duplication).
    Stream(RedirStream),
}

/// Open mode for path targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirMode {
    Truncate,
    Append,
    /// The path is a named pipe, created if missing.
    Pipe,
}

/// One I/O redirection of a task's child processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRedirect {
    pub stream: RedirStream,
    pub target: RedirTarget,
    pub mode: RedirMode,
    /// Permission bits for newly created files/pipes; `0o644` when absent.
    pub file_mode: Option<u32>,
}

impl IoRedirect {
    /// Parse an `IO_REDIRECT` value:
    /// `<STREAM> <PATH|STREAM> [APPEND|TRUNCATE|PIPE] [octal-mode]`.
    pub fn parse(text: &str) -> Result<Self> {
        let words = shlex::split(text).ok_or_else(|| {
            Error::InvalidInput(format!("unbalanced quoting in IO_REDIRECT: {text}"))
        })?;
        if words.len() < 2 || words.len() > 4 {
            return Err(Error::InvalidInput(format!(
                "IO_REDIRECT wants 2 to 4 fields, got {}: {text}",
                words.len()
            )));
        }
        let stream = RedirStream::parse(&words[0])?;
        let target = match RedirStream::parse(&words[1]) {
            Ok(s) => {
                if words.len() > 2 {
                    return Err(Error::InvalidInput(format!(
                        "stream-to-stream IO_REDIRECT takes no mode: {text}"
                    )));
                }
                if s == stream {
                    return Err(Error::InvalidInput(format!(
                        "IO_REDIRECT of a stream to itself: {text}"
                    )));
                }
                RedirTarget::Stream(s)
            }
            Err(_) => {
                if !words[1].starts_with('/') {
                    return Err(Error::InvalidInput(format!(
                        "IO_REDIRECT target must be an absolute path or stream: {text}"
                    )));
                }
                RedirTarget::Path(PathBuf::from(&words[1]))
            }
        };
        let mode = match words.get(2).map(|s| s.to_ascii_uppercase()) {
            None => RedirMode::Truncate,
            Some(m) => match m.as_str() {
                "TRUNCATE" => RedirMode::Truncate,
                "APPEND" => RedirMode::Append,
                "PIPE" => RedirMode::Pipe,
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "unknown IO_REDIRECT mode: {m}"
                    )));
                }
            },
        };
        let file_mode = match words.get(3) {
            None => None,
            Some(bits) => Some(u32::from_str_radix(bits, 8).map_err(|_| {
                Error::InvalidInput(format!("IO_REDIRECT mode bits are not octal: {bits}"))
            })?),
        };
        Ok(Self {
            stream,
            target,
            mode,
            file_mode,
        })
    }
}

/// Runtime state of a task. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Parsed and validated, not yet entered into scheduling.
    Loaded,
    /// Waiting for dependencies, filters, or triggers.
    Waiting,
    /// All start constraints satisfied; queued for dispatch.
    Ready,
    /// Fork issued, child not yet confirmed running.
    Starting,
    /// A child process is alive.
    Running,
    /// Command sequence completed with success.
    Done,
    /// Non-recoverable failure.
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loaded => "LOADED",
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// How one reaped child of a task ended, reduced to what the exit policy
/// needs: a clean exit advances the command sequence (and eventually
/// publishes `wait`); a code or a signal counts against the respawn budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskExit {
    /// Exit code 0.
    Clean,
    /// Non-zero exit code.
    Code(i32),
    /// Terminated by a signal before it could exit.
    Signal(nix::sys::signal::Signal),
}

impl TaskExit {
    #[must_use]
    pub const fn clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl fmt::Display for TaskExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean exit"),
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => write!(f, "{sig}"),
        }
    }
}

/// Unlimited respawn retries.
pub const RESPAWN_UNLIMITED: i64 = -1;

/// A fully validated task record.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub start_cmds: Vec<Command>,
    pub stop_cmds: Vec<Command>,
    pub deps: Vec<DepRef>,
    pub trig: Vec<DepRef>,
    /// Explicit `PROVIDES` names; `spawn`/`wait`/`fail` are always implied.
    pub provides: Vec<String>,
    pub ioredir: Vec<IoRedirect>,
    pub env: EnvSet,
    pub user: libc::uid_t,
    /// Resolved account name, cached at parse time when available.
    pub user_name: Option<String>,
    pub group: libc::gid_t,
    pub group_name: Option<String>,
    pub sup_groups: Vec<libc::gid_t>,
    pub caps_ambient: u64,
    pub caps_inheritable: u64,
    pub cgroup: Option<CgroupConfig>,
    pub respawn: bool,
    /// `-1` means unlimited.
    pub respawn_retries: i64,
    pub filters: Vec<EventFilter>,

    pub state: TaskState,
    pub pid: Option<nix::unistd::Pid>,
    pub retries_used: i64,
    /// Index of the next start command to run while the sequence progresses.
    pub current_cmd: usize,
    /// Bus sequence number at the task's last completion; triggers observed
    /// after this point re-arm the task.
    pub last_completion_seq: u64,
}

impl Task {
    /// Whether this task emits `event` on its own transitions.
    pub fn provides_event(&self, event: &str) -> bool {
        matches!(event, EVENT_SPAWN | EVENT_WAIT | EVENT_FAIL)
            || self.provides.iter().any(|p| p == event)
    }

    pub fn set_state(&mut self, state: TaskState) {
        trace!("Task {}: {} -> {}", self.name, self.state, state);
        self.state = state;
    }

    pub fn record_pid(&mut self, pid: nix::unistd::Pid) {
        self.pid = Some(pid);
    }

    pub fn clear_pid(&mut self) {
        self.pid = None;
    }

    pub fn bump_retries(&mut self) {
        self.retries_used += 1;
    }

    /// Whether the respawn budget still allows another attempt.
    pub fn respawn_budget_left(&self) -> bool {
        self.respawn
            && (self.respawn_retries == RESPAWN_UNLIMITED
                || self.retries_used < self.respawn_retries)
    }

    /// The child of the current start command is alive: record the PID, go to
    /// `RUNNING`, and publish `spawn` for the first command of a sequence.
    pub fn mark_spawned(&mut self, pid: nix::unistd::Pid, bus: &EventBus) {
        let first = self.current_cmd == 0;
        self.record_pid(pid);
        self.set_state(TaskState::Running);
        if first {
            bus.publish(DepRef {
                task: self.name.clone(),
                event: EVENT_SPAWN.to_owned(),
            });
        }
    }

    /// The whole start sequence completed successfully: publish `wait` and
    /// then the explicit provides.
    pub fn mark_done(&mut self, bus: &EventBus) {
        self.clear_pid();
        self.set_state(TaskState::Done);
        bus.publish(DepRef {
            task: self.name.clone(),
            event: EVENT_WAIT.to_owned(),
        });
        for event in &self.provides {
            bus.publish(DepRef {
                task: self.name.clone(),
                event: event.clone(),
            });
        }
        self.last_completion_seq = bus.sequence();
        self.current_cmd = 0;
    }

    /// Non-recoverable failure: publish `fail`.
    pub fn mark_failed(&mut self, bus: &EventBus) {
        self.clear_pid();
        self.set_state(TaskState::Failed);
        bus.publish(DepRef {
            task: self.name.clone(),
            event: EVENT_FAIL.to_owned(),
        });
        self.last_completion_seq = bus.sequence();
        self.current_cmd = 0;
    }

    /// Re-enter the wait state for a respawn attempt. Dependencies count as
    /// still satisfied and an armed trigger stays armed
    /// (`last_completion_seq` is left alone), so the retry can dispatch on
    /// the next tick.
    pub fn mark_respawning(&mut self) {
        self.clear_pid();
        self.bump_retries();
        self.set_state(TaskState::Waiting);
        self.current_cmd = 0;
    }
}

/// Substitute every occurrence of `${TASK_PID}` in one argument.
pub fn expand_task_pid(arg: &str, pid: nix::unistd::Pid) -> String {
    if !arg.contains(TASK_PID_MARKER) {
        return arg.to_owned();
    }
    arg.replace(TASK_PID_MARKER, &pid.as_raw().to_string())
}

/// Accumulates directive values while a task file is parsed, then validates
/// into a [`Task`].
#[derive(Debug, Default)]
pub struct TaskBuilder {
    pub name: Option<String>,
    pub start_cmds: Vec<Command>,
    pub stop_cmds: Vec<Command>,
    pub deps: Vec<DepRef>,
    pub trig: Vec<DepRef>,
    pub provides: Vec<String>,
    pub ioredir: Vec<IoRedirect>,
    pub env: EnvSet,
    pub user: Option<(libc::uid_t, Option<String>)>,
    pub group: Option<(libc::gid_t, Option<String>)>,
    pub sup_groups: Vec<libc::gid_t>,
    pub caps_ambient: Option<u64>,
    pub caps_inheritable: Option<u64>,
    pub cgroup_name: Option<String>,
    pub cgroup_params: Vec<crate::cgroup::CgroupParam>,
    pub respawn: Option<bool>,
    pub respawn_retries: Option<i64>,
    pub filters: Vec<EventFilter>,

    seen: Vec<&'static str>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a non-repeatable directive was handled; a second
    /// occurrence is a conflict.
    pub fn mark_seen(&mut self, key: &'static str) -> Result<()> {
        if self.seen.contains(&key) {
            return Err(Error::Conflict(format!(
                "duplicate directive {key} in task file"
            )));
        }
        self.seen.push(key);
        Ok(())
    }

    pub fn build(self) -> Result<Task> {
        let name = match self.name {
            Some(n) if !n.is_empty() => n,
            _ => {
                return Err(Error::InvalidInput(
                    "task file has no non-empty NAME".into(),
                ));
            }
        };
        if self.start_cmds.is_empty() {
            return Err(Error::InvalidInput(format!(
                "task {name} has no COMMAND"
            )));
        }
        let respawn_retries = self.respawn_retries.unwrap_or(RESPAWN_UNLIMITED);
        if respawn_retries < RESPAWN_UNLIMITED {
            return Err(Error::InvalidInput(format!(
                "task {name}: RESPAWN_RETRIES must be >= -1, got {respawn_retries}"
            )));
        }
        if !self.cgroup_params.is_empty() && self.cgroup_name.is_none() {
            return Err(Error::InvalidInput(format!(
                "task {name}: CGROUP_PARAMS without CGROUP_NAME"
            )));
        }
        let cgroup = self.cgroup_name.map(|cg_name| {
            let (parent, name) = match cg_name.split_once('/') {
                Some((parent, name)) => (Some(parent.to_owned()), name.to_owned()),
                None => (None, cg_name),
            };
            CgroupConfig {
                name,
                params: self.cgroup_params,
                parent,
            }
        });
        let (user, user_name) = self.user.unwrap_or((0, None));
        let (group, group_name) = self.group.unwrap_or((0, None));

        Ok(Task {
            name,
            start_cmds: self.start_cmds,
            stop_cmds: self.stop_cmds,
            deps: self.deps,
            trig: self.trig,
            provides: self.provides,
            ioredir: self.ioredir,
            env: self.env,
            user,
            user_name,
            group,
            group_name,
            sup_groups: self.sup_groups,
            caps_ambient: self.caps_ambient.unwrap_or(0),
            caps_inheritable: self.caps_inheritable.unwrap_or(0),
            cgroup,
            respawn: self.respawn.unwrap_or(false),
            respawn_retries,
            filters: self.filters,
            state: TaskState::Loaded,
            pid: None,
            retries_used: 0,
            current_cmd: 0,
            last_completion_seq: 0,
        })
    }
}
