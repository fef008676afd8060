//! Per-directive handlers.
//!
//! One handler per directive, keyed from the tables in `conf::mod`. A
//! handler validates the raw value, converts it, and writes the result into
//! its target (the task builder, or the global option record). Handlers also
//! reject contexts they are not meant for; the shared `ENV_SET` and
//! `FILTER_DEFINE` logic is reachable from both universes but never from the
//! kernel command line.

use std::path::PathBuf;

use crate::cgroup::CgroupConfig;
use crate::elos::EventFilter;
use crate::error::{Error, Result};
use crate::global_opts::GlobalOpts;
use crate::task::{Command, DepRef, IoRedirect, TaskBuilder};

use super::{ConfigContext, convert, parser};

fn expect_context(ctx: ConfigContext, wanted: ConfigContext, key: &str) -> Result<()> {
    if ctx != wanted {
        return Err(Error::Conflict(format!(
            "directive {key} is not allowed in {ctx:?} context"
        )));
    }
    Ok(())
}

/* Task-specific handlers */

pub(super) fn task_name(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "NAME")?;
    if val.is_empty() {
        return Err(Error::InvalidInput("NAME must not be empty".into()));
    }
    if val.contains(char::is_whitespace) || val.contains(':') {
        return Err(Error::InvalidInput(format!(
            "NAME must not contain whitespace or ':': {val}"
        )));
    }
    tgt.name = Some(val.to_owned());
    Ok(())
}

pub(super) fn task_command(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "COMMAND")?;
    tgt.start_cmds.push(Command::parse(val)?);
    Ok(())
}

pub(super) fn task_stop_command(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "STOP_COMMAND")?;
    tgt.stop_cmds.push(Command::parse(val)?);
    Ok(())
}

fn parse_dep_list(val: &str) -> Result<Vec<DepRef>> {
    val.split_ascii_whitespace().map(DepRef::parse).collect()
}

pub(super) fn task_depends(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "DEPENDS")?;
    tgt.deps.extend(parse_dep_list(val)?);
    Ok(())
}

pub(super) fn task_trigger(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "TRIGGER")?;
    tgt.trig.extend(parse_dep_list(val)?);
    Ok(())
}

pub(super) fn task_provides(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "PROVIDES")?;
    for name in val.split_ascii_whitespace() {
        if name.contains(':') {
            return Err(Error::InvalidInput(format!(
                "PROVIDES names a plain event, not name:event: {name}"
            )));
        }
        tgt.provides.push(name.to_owned());
    }
    Ok(())
}

pub(super) fn task_respawn(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "RESPAWN")?;
    tgt.respawn = Some(convert::parse_bool(val)?);
    Ok(())
}

pub(super) fn task_respawn_retries(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "RESPAWN_RETRIES")?;
    let retries = convert::parse_i64(val)?;
    if retries < -1 {
        return Err(Error::InvalidInput(format!(
            "RESPAWN_RETRIES must be >= -1: {retries}"
        )));
    }
    tgt.respawn_retries = Some(retries);
    Ok(())
}

pub(super) fn task_io_redirect(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "IO_REDIRECT")?;
    tgt.ioredir.push(IoRedirect::parse(val)?);
    Ok(())
}

pub(super) fn task_env_set(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "ENV_SET")?;
    tgt.env.parse_and_set(val)
}

pub(super) fn task_filter_define(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "FILTER_DEFINE")?;
    tgt.filters.push(EventFilter::parse(val)?);
    Ok(())
}

pub(super) fn task_user(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "USER")?;
    tgt.user = Some(convert::resolve_user(val)?);
    Ok(())
}

pub(super) fn task_group(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "GROUP")?;
    let (primary, sup) = convert::resolve_group_list(val)?;
    tgt.group = Some(primary);
    tgt.sup_groups = sup;
    Ok(())
}

pub(super) fn task_caps_ambient(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "CAPABILITIES_AMBIENT")?;
    tgt.caps_ambient = Some(crate::capabilities::parse_cap_list(val)?);
    Ok(())
}

pub(super) fn task_caps_inheritable(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "CAPABILITIES_INHERITABLE")?;
    tgt.caps_inheritable = Some(crate::capabilities::parse_cap_list(val)?);
    Ok(())
}

pub(super) fn task_cgroup_name(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "CGROUP_NAME")?;
    let val = val.trim();
    if val.is_empty() || val.ends_with('/') || val.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "CGROUP_NAME must be name or parent/name: {val}"
        )));
    }
    tgt.cgroup_name = Some(val.to_owned());
    Ok(())
}

pub(super) fn task_cgroup_params(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    _opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "CGROUP_PARAMS")?;
    tgt.cgroup_params.extend(CgroupConfig::parse_params(val)?);
    Ok(())
}

pub(super) fn task_include(
    tgt: &mut TaskBuilder,
    val: &str,
    ctx: ConfigContext,
    opts: &GlobalOpts,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Task, "INCLUDE")?;
    let name = val.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("INCLUDE without a file name".into()));
    }
    let path = parser::include_path(opts, name);
    let lines = parser::read_conf_lines(&path)?;
    parser::dispatch_task_lines(tgt, &lines, opts, true)
}

/* Series / global-option handlers */

pub(super) fn series_debug(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "DEBUG")?;
    tgt.debug = convert::parse_bool(val)?;
    Ok(())
}

pub(super) fn series_use_syslog(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "USE_SYSLOG")?;
    tgt.use_syslog = convert::parse_bool(val)?;
    Ok(())
}

pub(super) fn series_use_elos(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "USE_ELOS")?;
    tgt.use_elos = convert::parse_bool(val)?;
    Ok(())
}

pub(super) fn series_elos_server(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "ELOS_SERVER")?;
    if val.is_empty() {
        return Err(Error::InvalidInput("ELOS_SERVER must not be empty".into()));
    }
    tgt.elos_server = val.to_owned();
    Ok(())
}

pub(super) fn series_elos_port(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "ELOS_PORT")?;
    tgt.elos_port = convert::parse_u16(val)?;
    Ok(())
}

pub(super) fn series_elos_poll_interval(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "ELOS_EVENT_POLL_INTERVAL")?;
    let micros = convert::parse_u64(val)?;
    if micros == 0 {
        return Err(Error::InvalidInput(
            "ELOS_EVENT_POLL_INTERVAL must be non-zero".into(),
        ));
    }
    tgt.elos_poll_interval = std::time::Duration::from_micros(micros);
    Ok(())
}

pub(super) fn series_shutdown_grace_period(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "SHUTDOWN_GRACE_PERIOD_US")?;
    tgt.shutdown_grace_period = std::time::Duration::from_micros(convert::parse_u64(val)?);
    Ok(())
}

fn absolute_path(val: &str, key: &str) -> Result<PathBuf> {
    let val = val.trim();
    if !val.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "{key} must be an absolute path: {val}"
        )));
    }
    Ok(PathBuf::from(val))
}

pub(super) fn series_launcher_cmd(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "LAUNCHER_CMD")?;
    tgt.launcher_cmd = absolute_path(val, "LAUNCHER_CMD")?;
    Ok(())
}

pub(super) fn series_task_dir(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "TASKDIR")?;
    tgt.task_dir = absolute_path(val, "TASKDIR")?;
    Ok(())
}

pub(super) fn series_task_suffix(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "TASK_SUFFIX")?;
    if val.is_empty() {
        return Err(Error::InvalidInput("TASK_SUFFIX must not be empty".into()));
    }
    tgt.task_suffix = val.to_owned();
    Ok(())
}

pub(super) fn series_task_dir_symlinks(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "TASKDIR_FOLLOW_SYMLINKS")?;
    tgt.task_dir_follow_symlinks = convert::parse_bool(val)?;
    Ok(())
}

pub(super) fn series_tasks(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "TASKS")?;
    for name in val.split_ascii_whitespace() {
        tgt.tasks.push(name.to_owned());
    }
    Ok(())
}

pub(super) fn series_include_dir(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "INCLUDEDIR")?;
    tgt.include_dir = Some(absolute_path(val, "INCLUDEDIR")?);
    Ok(())
}

pub(super) fn series_include_suffix(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "INCLUDE_SUFFIX")?;
    if val.is_empty() {
        return Err(Error::InvalidInput(
            "INCLUDE_SUFFIX must not be empty".into(),
        ));
    }
    tgt.include_suffix = val.to_owned();
    Ok(())
}

pub(super) fn series_env_set(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "ENV_SET")?;
    tgt.env.parse_and_set(val)
}

pub(super) fn series_filter_define(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "FILTER_DEFINE")?;
    tgt.filters.push(EventFilter::parse(val)?);
    Ok(())
}

/// `CGROUP` declares a root-level cgroup: first word is the name, the rest
/// are `file=value` parameters.
pub(super) fn series_cgroup(tgt: &mut GlobalOpts, val: &str, ctx: ConfigContext) -> Result<()> {
    expect_context(ctx, ConfigContext::Series, "CGROUP")?;
    let words = shlex::split(val)
        .ok_or_else(|| Error::InvalidInput(format!("unbalanced quoting in CGROUP: {val}")))?;
    let Some((name, param_words)) = words.split_first() else {
        return Err(Error::InvalidInput("CGROUP without a name".into()));
    };
    if name.contains('/') {
        return Err(Error::InvalidInput(format!(
            "root CGROUP name must not be nested: {name}"
        )));
    }
    let mut params = Vec::new();
    for word in param_words {
        params.extend(CgroupConfig::parse_params(word)?);
    }
    tgt.root_cgroups.push(CgroupConfig {
        name: name.clone(),
        params,
        parent: None,
    });
    Ok(())
}

/* Kernel command line handlers */

pub(super) fn kcmdline_sigkeydir(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::KernelCmdline, "sigkeydir")?;
    tgt.sigkey_dir = absolute_path(val, "crinit.sigkeydir")?;
    Ok(())
}

pub(super) fn kcmdline_signatures(
    tgt: &mut GlobalOpts,
    val: &str,
    ctx: ConfigContext,
) -> Result<()> {
    expect_context(ctx, ConfigContext::KernelCmdline, "signatures")?;
    tgt.signatures = convert::parse_bool(val)?;
    Ok(())
}
