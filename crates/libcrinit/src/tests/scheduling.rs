//! End-to-end scheduling scenarios.
//!
//! These run the real dispatcher and signal-handler threads against task
//! files in a temp directory, with a tiny shell script standing in for the
//! launcher binary so nothing here needs privileges.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::dispatch;
use crate::entrypoints::load_task_db;
use crate::events::ShutdownRequest;
use crate::global_opts::GlobalOpts;
use crate::lock_ext::RwLockExt;
use crate::runtime_info::{ArcRuntimeInfo, RuntimeInfo};
use crate::signal_handler;
use crate::task::{DepRef, TaskState};

/// Run the scheduling scenarios with a global timeout so a missed SIGCHLD
/// inside the cargo-test process can never hang CI forever.
#[test]
fn scheduling_scenarios() {
    let handle = std::thread::spawn(scheduling_scenarios_inner);

    let timeout = Duration::from_secs(60);
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            handle.join().unwrap();
            return;
        }
        if start.elapsed() >= timeout {
            panic!("scheduling_scenarios timed out after {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn scheduling_scenarios_inner() {
    // Sequential on purpose: each scenario owns the process-wide SIGCHLD
    // stream while it runs.
    single_task_runs_to_done();
    ready_set_order_is_deterministic();
    linear_dependency_orders_dispatch();
    failed_dependency_blocks_dependent();
    respawn_budget_is_honored();
    trigger_rearms_after_completion();
    stop_terminates_running_task();
}

const OK_LAUNCHER: &str = "#!/bin/sh\nexit 0\n";
const FAIL_LAUNCHER: &str = "#!/bin/sh\nexit 1\n";
const SLEEP_LAUNCHER: &str = "#!/bin/sh\nexec sleep 30\n";

struct Harness {
    _dir: tempfile::TempDir,
    run_info: ArcRuntimeInfo,
    /// Subscribed to everything before the dispatcher starts, so no event
    /// of the run is missed.
    all_events: crate::events::SubscriberId,
    dispatcher: Option<std::thread::JoinHandle<Option<ShutdownRequest>>>,
    signal_handle: signal_hook::iterator::Handle,
    signal_thread: Option<std::thread::JoinHandle<()>>,
}

fn write_task(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(format!("{name}.crinit")), content).unwrap();
}

fn write_launcher(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-launch.sh");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn start(tasks: &[(&str, &str)], launcher_body: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let task_dir = dir.path().join("tasks");
    std::fs::create_dir(&task_dir).unwrap();
    for (name, content) in tasks {
        write_task(&task_dir, name, content);
    }

    let mut opts = GlobalOpts::default();
    opts.task_dir = task_dir;
    opts.launcher_cmd = write_launcher(dir.path(), launcher_body);
    opts.shutdown_grace_period = Duration::from_millis(500);

    let db = load_task_db(&opts, None).unwrap();
    let run_info = RuntimeInfo::new(db, opts, None);
    let all_events = run_info.bus.subscribe(None);

    let signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGCHLD]).unwrap();
    let signal_handle = signals.handle();
    let ri = run_info.clone();
    let signal_thread = std::thread::spawn(move || {
        signal_handler::handle_signals(signals, ri);
    });

    let ri = run_info.clone();
    let dispatcher = std::thread::spawn(move || dispatch::run_dispatcher(&ri));

    Harness {
        _dir: dir,
        run_info,
        all_events,
        dispatcher: Some(dispatcher),
        signal_handle,
        signal_thread: Some(signal_thread),
    }
}

impl Harness {
    fn state_of(&self, name: &str) -> TaskState {
        self.run_info
            .task_db
            .read_poisoned()
            .lookup(name)
            .unwrap()
            .state
    }

    fn wait_for_state(&self, name: &str, state: TaskState) {
        assert!(
            self.wait_until(|| self.state_of(name) == state),
            "task {name} never reached {state} (is {})",
            self.state_of(name)
        );
    }

    fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn finish(mut self) {
        self.run_info.bus.request_shutdown(ShutdownRequest::Exit);
        let outcome = self.dispatcher.take().unwrap().join().unwrap();
        assert_eq!(outcome, Some(ShutdownRequest::Exit));
        self.signal_handle.close();
        self.signal_thread.take().unwrap().join().unwrap();
    }
}

fn dep(task: &str, event: &str) -> DepRef {
    DepRef {
        task: task.into(),
        event: event.into(),
    }
}

fn single_task_runs_to_done() {
    let h = start(
        &[("hello", "NAME = hello\nCOMMAND = /bin/echo hi\n")],
        OK_LAUNCHER,
    );
    h.wait_for_state("hello", TaskState::Done);
    assert!(h.run_info.bus.has_fired(&dep("hello", "spawn")));
    assert!(h.run_info.bus.has_fired(&dep("hello", "wait")));
    assert!(!h.run_info.bus.has_fired(&dep("hello", "fail")));
    assert!(dispatch::running_pid_invariant_holds(
        &h.run_info.task_db.read_poisoned()
    ));
    h.finish();
}

fn ready_set_order_is_deterministic() {
    // Three unconstrained tasks become ready in the same tick; dispatch must
    // follow database insertion order (the lexicographic directory scan).
    let tasks = [
        ("alpha", "NAME = alpha\nCOMMAND = /bin/true\n"),
        ("beta", "NAME = beta\nCOMMAND = /bin/true\n"),
        ("gamma", "NAME = gamma\nCOMMAND = /bin/true\n"),
    ];
    let h = start(&tasks, OK_LAUNCHER);
    let mut spawns: Vec<String> = Vec::new();
    assert!(h.wait_until(|| {
        spawns.extend(
            h.run_info
                .bus
                .drain(h.all_events)
                .into_iter()
                .filter(|e| e.event == "spawn")
                .map(|e| e.task),
        );
        spawns.len() >= 3
    }));
    assert_eq!(spawns, vec!["alpha", "beta", "gamma"]);
    h.finish();
}

fn linear_dependency_orders_dispatch() {
    let tasks = [
        ("a", "NAME = a\nCOMMAND = /bin/true\nPROVIDES = a-done\n"),
        ("b", "NAME = b\nCOMMAND = /bin/true\nDEPENDS = a:wait\n"),
    ];
    let h = start(&tasks, OK_LAUNCHER);

    h.wait_for_state("a", TaskState::Done);
    h.wait_for_state("b", TaskState::Done);

    // b's spawn must come after a's wait in bus order.
    let events = h.run_info.bus.drain(h.all_events);
    let a_wait = events.iter().position(|e| *e == dep("a", "wait"));
    let b_spawn = events.iter().position(|e| *e == dep("b", "spawn"));
    match (a_wait, b_spawn) {
        (Some(aw), Some(bs)) => assert!(aw < bs, "b spawned before a completed"),
        other => panic!("missing events in {events:?}: {other:?}"),
    }
    assert!(h.run_info.bus.has_fired(&dep("a", "a-done")));
    h.finish();
}

fn failed_dependency_blocks_dependent() {
    let tasks = [
        ("a", "NAME = a\nCOMMAND = /bin/true\n"),
        ("b", "NAME = b\nCOMMAND = /bin/true\nDEPENDS = a:wait\n"),
    ];
    let h = start(&tasks, FAIL_LAUNCHER);
    h.wait_for_state("a", TaskState::Failed);
    assert!(h.run_info.bus.has_fired(&dep("a", "fail")));
    assert!(!h.run_info.bus.has_fired(&dep("a", "wait")));

    // Give the dispatcher a few ticks: b must stay WAITING indefinitely.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.state_of("b"), TaskState::Waiting);
    assert!(!h.run_info.bus.has_fired(&dep("b", "spawn")));
    h.finish();
}

fn respawn_budget_is_honored() {
    let h = start(
        &[(
            "loop",
            "NAME = loop\nCOMMAND = /bin/false\nRESPAWN = YES\nRESPAWN_RETRIES = 2\n",
        )],
        FAIL_LAUNCHER,
    );
    h.wait_for_state("loop", TaskState::Failed);
    let retries = h
        .run_info
        .task_db
        .read_poisoned()
        .lookup("loop")
        .unwrap()
        .retries_used;
    assert_eq!(retries, 2, "initial dispatch plus two retries");
    h.finish();
}

fn trigger_rearms_after_completion() {
    let h = start(
        &[(
            "tick",
            "NAME = tick\nCOMMAND = /bin/true\nTRIGGER = @elos:go\n",
        )],
        OK_LAUNCHER,
    );
    let sub = h.run_info.bus.subscribe(Some("tick"));

    // No trigger fired yet: the task must not start on its own.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.state_of("tick"), TaskState::Waiting);

    h.run_info.bus.publish(dep("@elos", "go"));
    h.wait_for_state("tick", TaskState::Done);

    // A second firing re-enters the task; two completions total.
    h.run_info.bus.publish(dep("@elos", "go"));
    let mut completions = 0usize;
    assert!(h.wait_until(|| {
        completions += h
            .run_info
            .bus
            .drain(sub)
            .iter()
            .filter(|e| e.event == "wait")
            .count();
        completions >= 2
    }));
    h.finish();
}

fn stop_terminates_running_task() {
    let h = start(
        &[("daemon", "NAME = daemon\nCOMMAND = /bin/sleep 30\n")],
        SLEEP_LAUNCHER,
    );
    h.wait_for_state("daemon", TaskState::Running);
    {
        let db = h.run_info.task_db.read_poisoned();
        assert!(db.lookup("daemon").unwrap().pid.is_some());
    }

    crate::shutdown::stop_all_tasks(&h.run_info);

    assert!(h.wait_until(|| {
        let db = h.run_info.task_db.read_poisoned();
        db.active_count() == 0 && db.lookup("daemon").unwrap().pid.is_none()
    }));
    h.finish();
}
