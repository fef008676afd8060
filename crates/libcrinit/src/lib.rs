#![allow(clippy::result_large_err)]

//! `libcrinit` is the core library of crinit-rs, a task-based init and
//! service supervisor. The `crinit` binary is a thin wrapper around
//! [`entrypoints::run_init`].
//!
//! It contains:
//! - Task and series file parsing (flat key/value with a directive table)
//! - The task model and task database
//! - The dependency resolver / dispatcher
//! - Process supervision via the external privilege-dropping launcher
//! - The event bus and the elos external-event adapter
//! - Signature verification rooted in the kernel keyring
//! - Capability, cgroup, and environment handling
//! - Signal handling and the graceful shutdown path

pub mod capabilities;
pub mod cgroup;
pub mod conf;
pub mod dispatch;
pub mod elos;
pub mod entrypoints;
pub mod envset;
pub mod error;
pub mod events;
pub mod fseries;
pub mod global_opts;
pub mod launcher;
pub mod lexers;
pub mod lock_ext;
pub mod logging;
pub mod ready_queue;
pub mod runtime_info;
pub mod shutdown;
pub mod sig;
pub mod signal_handler;
pub mod task;
pub mod task_db;

#[cfg(test)]
mod tests;
