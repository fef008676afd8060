//! Configuration parsing.
//!
//! Two configuration universes share this machinery: the series file (global
//! options) and task files (one task each). Both are flat `KEY = VALUE` text;
//! a third, much smaller universe handles `crinit.*` overrides on the kernel
//! command line.
//!
//! Each universe has a sorted directive table mapping the key to a handler
//! plus two flags: whether the directive may repeat (array-like, values are
//! concatenated) and whether it may be seen through an `INCLUDE` splice.
//! Lookup is binary search; the tables MUST stay alphabetical, and a test
//! fails if they do not.

mod convert;
mod handlers;
mod kcmdline;
mod parser;

pub use convert::{parse_bool, resolve_group_list, resolve_user};
pub use kcmdline::{parse_kernel_cmdline, parse_proc_cmdline};
pub use parser::{parse_series_file, parse_task_file, read_conf_lines};

use crate::error::Result;
use crate::global_opts::GlobalOpts;
use crate::task::TaskBuilder;

/// Which universe a directive is being handled in. Handlers reject contexts
/// they do not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigContext {
    Task,
    Series,
    KernelCmdline,
}

pub type TaskHandler = fn(&mut TaskBuilder, &str, ConfigContext, &GlobalOpts) -> Result<()>;
pub type SeriesHandler = fn(&mut GlobalOpts, &str, ConfigContext) -> Result<()>;

pub struct TaskDirective {
    pub key: &'static str,
    /// May appear multiple times in one file; occurrences concatenate.
    pub array_like: bool,
    /// May be seen through an `INCLUDE` splice.
    pub include_safe: bool,
    pub handler: TaskHandler,
}

pub struct SeriesDirective {
    pub key: &'static str,
    pub array_like: bool,
    pub handler: SeriesHandler,
}

/// Task-file directives, alphabetical by key.
pub static TASK_DIRECTIVES: &[TaskDirective] = &[
    TaskDirective {
        key: "CAPABILITIES_AMBIENT",
        array_like: false,
        include_safe: true,
        handler: handlers::task_caps_ambient,
    },
    TaskDirective {
        key: "CAPABILITIES_INHERITABLE",
        array_like: false,
        include_safe: true,
        handler: handlers::task_caps_inheritable,
    },
    TaskDirective {
        key: "CGROUP_NAME",
        array_like: false,
        include_safe: true,
        handler: handlers::task_cgroup_name,
    },
    TaskDirective {
        key: "CGROUP_PARAMS",
        array_like: true,
        include_safe: true,
        handler: handlers::task_cgroup_params,
    },
    TaskDirective {
        key: "COMMAND",
        array_like: true,
        include_safe: false,
        handler: handlers::task_command,
    },
    TaskDirective {
        key: "DEPENDS",
        array_like: true,
        include_safe: true,
        handler: handlers::task_depends,
    },
    TaskDirective {
        key: "ENV_SET",
        array_like: true,
        include_safe: true,
        handler: handlers::task_env_set,
    },
    TaskDirective {
        key: "FILTER_DEFINE",
        array_like: true,
        include_safe: true,
        handler: handlers::task_filter_define,
    },
    TaskDirective {
        key: "GROUP",
        array_like: false,
        include_safe: true,
        handler: handlers::task_group,
    },
    TaskDirective {
        key: "INCLUDE",
        array_like: true,
        include_safe: false,
        handler: handlers::task_include,
    },
    TaskDirective {
        key: "IO_REDIRECT",
        array_like: true,
        include_safe: true,
        handler: handlers::task_io_redirect,
    },
    TaskDirective {
        key: "NAME",
        array_like: false,
        include_safe: false,
        handler: handlers::task_name,
    },
    TaskDirective {
        key: "PROVIDES",
        array_like: true,
        include_safe: true,
        handler: handlers::task_provides,
    },
    TaskDirective {
        key: "RESPAWN",
        array_like: false,
        include_safe: true,
        handler: handlers::task_respawn,
    },
    TaskDirective {
        key: "RESPAWN_RETRIES",
        array_like: false,
        include_safe: true,
        handler: handlers::task_respawn_retries,
    },
    TaskDirective {
        key: "STOP_COMMAND",
        array_like: true,
        include_safe: false,
        handler: handlers::task_stop_command,
    },
    TaskDirective {
        key: "TRIGGER",
        array_like: true,
        include_safe: true,
        handler: handlers::task_trigger,
    },
    TaskDirective {
        key: "USER",
        array_like: false,
        include_safe: true,
        handler: handlers::task_user,
    },
];

/// Series-file directives, alphabetical by key.
pub static SERIES_DIRECTIVES: &[SeriesDirective] = &[
    SeriesDirective {
        key: "CGROUP",
        array_like: true,
        handler: handlers::series_cgroup,
    },
    SeriesDirective {
        key: "DEBUG",
        array_like: false,
        handler: handlers::series_debug,
    },
    SeriesDirective {
        key: "ELOS_EVENT_POLL_INTERVAL",
        array_like: false,
        handler: handlers::series_elos_poll_interval,
    },
    SeriesDirective {
        key: "ELOS_PORT",
        array_like: false,
        handler: handlers::series_elos_port,
    },
    SeriesDirective {
        key: "ELOS_SERVER",
        array_like: false,
        handler: handlers::series_elos_server,
    },
    SeriesDirective {
        key: "ENV_SET",
        array_like: true,
        handler: handlers::series_env_set,
    },
    SeriesDirective {
        key: "FILTER_DEFINE",
        array_like: true,
        handler: handlers::series_filter_define,
    },
    SeriesDirective {
        key: "INCLUDEDIR",
        array_like: false,
        handler: handlers::series_include_dir,
    },
    SeriesDirective {
        key: "INCLUDE_SUFFIX",
        array_like: false,
        handler: handlers::series_include_suffix,
    },
    SeriesDirective {
        key: "LAUNCHER_CMD",
        array_like: false,
        handler: handlers::series_launcher_cmd,
    },
    SeriesDirective {
        key: "SHUTDOWN_GRACE_PERIOD_US",
        array_like: false,
        handler: handlers::series_shutdown_grace_period,
    },
    SeriesDirective {
        key: "TASKDIR",
        array_like: false,
        handler: handlers::series_task_dir,
    },
    SeriesDirective {
        key: "TASKDIR_FOLLOW_SYMLINKS",
        array_like: false,
        handler: handlers::series_task_dir_symlinks,
    },
    SeriesDirective {
        key: "TASKS",
        array_like: true,
        handler: handlers::series_tasks,
    },
    SeriesDirective {
        key: "TASK_SUFFIX",
        array_like: false,
        handler: handlers::series_task_suffix,
    },
    SeriesDirective {
        key: "USE_ELOS",
        array_like: false,
        handler: handlers::series_use_elos,
    },
    SeriesDirective {
        key: "USE_SYSLOG",
        array_like: false,
        handler: handlers::series_use_syslog,
    },
];

/// Kernel command line overrides, alphabetical by key (already stripped of
/// the `crinit.` prefix).
pub static KCMDLINE_DIRECTIVES: &[SeriesDirective] = &[
    SeriesDirective {
        key: "sigkeydir",
        array_like: false,
        handler: handlers::kcmdline_sigkeydir,
    },
    SeriesDirective {
        key: "signatures",
        array_like: false,
        handler: handlers::kcmdline_signatures,
    },
];

pub fn find_task_directive(key: &str) -> Option<&'static TaskDirective> {
    TASK_DIRECTIVES
        .binary_search_by(|d| d.key.cmp(key))
        .ok()
        .map(|i| &TASK_DIRECTIVES[i])
}

pub fn find_series_directive(key: &str) -> Option<&'static SeriesDirective> {
    SERIES_DIRECTIVES
        .binary_search_by(|d| d.key.cmp(key))
        .ok()
        .map(|i| &SERIES_DIRECTIVES[i])
}

pub fn find_kcmdline_directive(key: &str) -> Option<&'static SeriesDirective> {
    KCMDLINE_DIRECTIVES
        .binary_search_by(|d| d.key.cmp(key))
        .ok()
        .map(|i| &KCMDLINE_DIRECTIVES[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted(keys: &[&str], what: &str) {
        for pair in keys.windows(2) {
            assert!(
                pair[0] < pair[1],
                "{what} directive table not alphabetical: {} >= {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn directive_tables_are_sorted() {
        let task_keys: Vec<_> = TASK_DIRECTIVES.iter().map(|d| d.key).collect();
        assert_sorted(&task_keys, "task");
        let series_keys: Vec<_> = SERIES_DIRECTIVES.iter().map(|d| d.key).collect();
        assert_sorted(&series_keys, "series");
        let kcmdline_keys: Vec<_> = KCMDLINE_DIRECTIVES.iter().map(|d| d.key).collect();
        assert_sorted(&kcmdline_keys, "kernel cmdline");
    }

    #[test]
    fn binary_search_finds_every_directive() {
        for d in TASK_DIRECTIVES {
            assert!(find_task_directive(d.key).is_some(), "{}", d.key);
        }
        for d in SERIES_DIRECTIVES {
            assert!(find_series_directive(d.key).is_some(), "{}", d.key);
        }
        for d in KCMDLINE_DIRECTIVES {
            assert!(find_kcmdline_directive(d.key).is_some(), "{}", d.key);
        }
        assert!(find_task_directive("NO_SUCH_KEY").is_none());
        assert!(find_series_directive("NO_SUCH_KEY").is_none());
    }
}
