//! The event bus.
//!
//! Every task state change of interest is published as a `(task, event)`
//! pair. The dispatcher blocks here between scheduling ticks; the signal
//! thread and the external-event poller wake it by publishing. The bus also
//! carries the reaped-children queue and the shutdown latch, so that the
//! dispatcher has exactly one suspension point.
//!
//! Dependency satisfaction is edge-triggered: the bus remembers, per pair,
//! the sequence number of the most recent firing. "Has fired at least once"
//! answers dependency checks; "has fired after sequence N" answers trigger
//! re-arming.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::trace;

use crate::task::{DepRef, TaskExit};

/// What to do once the system is down. Latched by the signal orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Leave the process without touching the machine (PID != 1).
    Exit,
    Halt,
    Poweroff,
    Reboot,
}

#[derive(Default)]
struct BusInner {
    /// Monotonic publish counter. Every publish bumps it; waiters compare
    /// against the value they last observed.
    seq: u64,
    /// Last firing sequence per pair, since database load.
    fired: HashMap<DepRef, u64>,
    /// Queued events per subscriber.
    subscribers: Vec<SubscriberQueue>,
    /// Exits of task main children reaped by the signal thread, in reap
    /// order, already resolved to their task names.
    exits: VecDeque<(String, TaskExit)>,
    shutdown: Option<ShutdownRequest>,
}

struct SubscriberQueue {
    /// Only events whose task name equals the pattern are queued; `None`
    /// subscribes to everything.
    pattern: Option<String>,
    queue: VecDeque<DepRef>,
}

/// Identifies a subscription for draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(usize);

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
    cond: Condvar,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish one event: record it as fired, queue it for matching
    /// subscribers, and wake all waiters.
    pub fn publish(&self, event: DepRef) {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        trace!("Event bus: publish {event} (seq {seq})");
        inner.fired.insert(event.clone(), seq);
        for sub in &mut inner.subscribers {
            let interested = match &sub.pattern {
                Some(p) => *p == event.task,
                None => true,
            };
            if interested {
                sub.queue.push_back(event.clone());
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Register interest in events from `pattern` (a task name), or in all
    /// events when `None`.
    pub fn subscribe(&self, pattern: Option<&str>) -> SubscriberId {
        let mut inner = self.lock();
        inner.subscribers.push(SubscriberQueue {
            pattern: pattern.map(str::to_owned),
            queue: VecDeque::new(),
        });
        SubscriberId(inner.subscribers.len() - 1)
    }

    /// Take all queued events for one subscriber, in publish order.
    pub fn drain(&self, id: SubscriberId) -> Vec<DepRef> {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(id.0) {
            Some(sub) => sub.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Whether the pair has fired at least once since database load.
    pub fn has_fired(&self, dep: &DepRef) -> bool {
        self.lock().fired.contains_key(dep)
    }

    /// Whether the pair has fired after the given sequence number.
    pub fn fired_after(&self, dep: &DepRef, seq: u64) -> bool {
        self.lock().fired.get(dep).is_some_and(|s| *s > seq)
    }

    /// The current publish sequence number.
    pub fn sequence(&self) -> u64 {
        self.lock().seq
    }

    /// Queue a reaped task child for the dispatcher and wake it.
    pub fn push_exit(&self, task_name: String, exit: TaskExit) {
        let mut inner = self.lock();
        inner.exits.push_back((task_name, exit));
        drop(inner);
        self.cond.notify_all();
    }

    /// Take all queued child exits, in reap order.
    pub fn drain_exits(&self) -> Vec<(String, TaskExit)> {
        self.lock().exits.drain(..).collect()
    }

    /// Latch a shutdown request and wake every waiter. The first request
    /// wins; later ones are ignored.
    pub fn request_shutdown(&self, req: ShutdownRequest) {
        let mut inner = self.lock();
        if inner.shutdown.is_none() {
            inner.shutdown = Some(req);
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub fn shutdown_requested(&self) -> Option<ShutdownRequest> {
        self.lock().shutdown
    }

    /// Block until something happened after `last_seen`: a publish, a child
    /// exit, a shutdown request, or the timeout. Returns the sequence number
    /// to pass to the next wait.
    pub fn wait_for_activity(&self, last_seen: u64, timeout: Duration) -> u64 {
        let mut inner = self.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if inner.seq != last_seen || !inner.exits.is_empty() || inner.shutdown.is_some() {
                return inner.seq;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return inner.seq;
            }
            let (guard, _timeout_result) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| {
                    log::warn!("Recovered poisoned event bus lock");
                    e.into_inner()
                });
            inner = guard;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| {
            log::warn!("Recovered poisoned event bus lock");
            e.into_inner()
        })
    }
}
