//! The task database.
//!
//! Owns every task by name. Insertion order is retained because the ready
//! set is drained in `(insertion_index, name)` order; removal leaves a hole
//! so indices of the remaining tasks stay stable.

use std::collections::HashMap;

use crate::elos::ELOS_DEP_NAMESPACE;
use crate::error::{Error, Result};
use crate::task::{DepRef, Task, TaskState};

#[derive(Default)]
pub struct TaskDb {
    slots: Vec<Option<Task>>,
    index: HashMap<String, usize>,
}

impl TaskDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. A duplicate name is a conflict.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.name) {
            return Err(Error::Conflict(format!(
                "duplicate task name: {}",
                task.name
            )));
        }
        self.index.insert(task.name.clone(), self.slots.len());
        self.slots.push(Some(task));
        Ok(())
    }

    /// Remove and return a task by name.
    pub fn remove(&mut self, name: &str) -> Option<Task> {
        let idx = self.index.remove(name)?;
        self.slots[idx].take()
    }

    pub fn lookup(&self, name: &str) -> Option<&Task> {
        let idx = *self.index.get(name)?;
        self.slots[idx].as_ref()
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Task> {
        let idx = *self.index.get(name)?;
        self.slots[idx].as_mut()
    }

    /// The insertion index of a task, stable across removals of others.
    pub fn insertion_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Visit every live task in insertion order.
    pub fn for_each<F: FnMut(&Task)>(&self, mut f: F) {
        for task in self.slots.iter().flatten() {
            f(task);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.slots.iter_mut().flatten()
    }

    /// The task currently holding `pid`, if any.
    pub fn by_pid(&self, pid: nix::unistd::Pid) -> Option<&Task> {
        self.iter().find(|t| t.pid == Some(pid))
    }

    pub fn name_by_pid(&self, pid: nix::unistd::Pid) -> Option<String> {
        self.by_pid(pid).map(|t| t.name.clone())
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of tasks currently in `RUNNING` or `STARTING`.
    pub fn active_count(&self) -> usize {
        self.iter()
            .filter(|t| matches!(t.state, TaskState::Running | TaskState::Starting))
            .count()
    }

    /// Check that every dependency and trigger target exists and provides the
    /// named event, or lives in an external event namespace.
    pub fn validate_deps(&self) -> Result<()> {
        let mut check = |owner: &str, dep: &DepRef| -> Result<()> {
            if dep.task.starts_with(ELOS_DEP_NAMESPACE) {
                return Ok(());
            }
            match self.lookup(&dep.task) {
                Some(target) if target.provides_event(&dep.event) => Ok(()),
                Some(_) => Err(Error::NotFound(format!(
                    "task {owner} references {dep}, but {} does not provide event {}",
                    dep.task, dep.event
                ))),
                None => Err(Error::NotFound(format!(
                    "task {owner} references {dep}, but no task named {} exists",
                    dep.task
                ))),
            }
        };

        for task in self.iter() {
            for dep in task.deps.iter().chain(task.trig.iter()) {
                check(&task.name, dep)?;
            }
        }
        Ok(())
    }
}
