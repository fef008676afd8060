//! File reading and directive dispatch.
//!
//! Configuration files are UTF-8 text, one `KEY = VALUE` per line, at most
//! 4096 bytes per line. A line whose first non-blank character is `#` or `;`
//! is a comment; there are no inline comments, so a `#` inside a value is
//! part of the value.

use std::path::{Path, PathBuf};

use log::trace;

use crate::error::{Error, Result};
use crate::global_opts::GlobalOpts;
use crate::task::{Task, TaskBuilder};

use super::{ConfigContext, find_series_directive, find_task_directive};

/// Maximum length of one configuration line, excluding the newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Read a configuration file into a `(key, value)` stream.
pub fn read_conf_lines(path: &Path) -> Result<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::io(format!("reading config file {}", path.display()), e))?;
    parse_conf_text(&content, path)
}

fn parse_conf_text(content: &str, path: &Path) -> Result<Vec<(String, String)>> {
    let mut lines = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.len() > MAX_LINE_LEN {
            return Err(Error::InvalidInput(format!(
                "{}:{}: line exceeds {MAX_LINE_LEN} bytes",
                path.display(),
                lineno + 1
            )));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        let (key, value) = trimmed.split_once('=').ok_or_else(|| {
            Error::InvalidInput(format!(
                "{}:{}: line is not KEY = VALUE: {trimmed}",
                path.display(),
                lineno + 1
            ))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{}:{}: empty directive key",
                path.display(),
                lineno + 1
            )));
        }
        lines.push((key.to_owned(), value.trim().to_owned()));
    }
    Ok(lines)
}

/// Parse one task file into a validated [`Task`].
pub fn parse_task_file(path: &Path, opts: &GlobalOpts) -> Result<Task> {
    trace!("Parsing task file {}", path.display());
    let lines = read_conf_lines(path)?;
    let mut builder = TaskBuilder::new();
    dispatch_task_lines(&mut builder, &lines, opts, false)?;
    builder.build()
}

/// Run every `(key, value)` of a task file through its directive handler.
///
/// `via_include` marks lines spliced in by an `INCLUDE` directive; such
/// lines may only carry include-safe directives. The duplicate check for
/// non-repeatable directives spans the whole splice so an include cannot
/// silently override the main file.
pub(super) fn dispatch_task_lines(
    builder: &mut TaskBuilder,
    lines: &[(String, String)],
    opts: &GlobalOpts,
    via_include: bool,
) -> Result<()> {
    for (key, value) in lines {
        let def = find_task_directive(key).ok_or_else(|| {
            Error::NotFound(format!("unknown task directive: {key}"))
        })?;
        if via_include && !def.include_safe {
            return Err(Error::Conflict(format!(
                "directive {key} is not allowed in an included file"
            )));
        }
        if !def.array_like {
            builder.mark_seen(def.key)?;
        }
        (def.handler)(builder, value, ConfigContext::Task, opts)?;
    }
    Ok(())
}

/// Resolve an `INCLUDE` name to its file under the include directory.
pub(super) fn include_path(opts: &GlobalOpts, name: &str) -> PathBuf {
    let mut file = String::from(name);
    if !file.ends_with(&opts.include_suffix) {
        file.push_str(&opts.include_suffix);
    }
    opts.include_dir().join(file)
}

/// Parse the series file, overwriting fields of `opts`.
pub fn parse_series_file(path: &Path, opts: &mut GlobalOpts) -> Result<()> {
    trace!("Parsing series file {}", path.display());
    let lines = read_conf_lines(path)?;
    let mut seen: Vec<&'static str> = Vec::new();
    for (key, value) in &lines {
        let def = find_series_directive(key).ok_or_else(|| {
            Error::NotFound(format!("unknown series directive: {key}"))
        })?;
        if !def.array_like {
            if seen.contains(&def.key) {
                return Err(Error::Conflict(format!(
                    "duplicate directive {key} in series file"
                )));
            }
            seen.push(def.key);
        }
        (def.handler)(opts, value, ConfigContext::Series)?;
    }
    Ok(())
}
