//! Launcher invocation.
//!
//! The supervisor never drops privileges or applies capabilities and cgroups
//! itself; an external helper binary does, and is handed everything it needs
//! on its command line. This module builds that argument vector:
//!
//! ```text
//! <launcher> --cmd=<argv0>
//!            --user=<uid>
//!            --group=<gid>[,<supgid>…]
//!            [--capabilities-ambient=<mask-hex>]
//!            [--capabilities-inheritable=<mask-hex>]
//!            [--cgroup=<path>]
//!            -- <argv1> <argv2> …
//! ```
//!
//! The vector is `CString`s ready for `execv(3)`; the launcher path comes
//! from the `LAUNCHER_CMD` global option.

use std::ffi::CString;
use std::path::Path;

use crate::error::{Error, Result};
use crate::task::{Command, Task};

fn cstring(s: String) -> Result<CString> {
    CString::new(s)
        .map_err(|_| Error::InvalidInput("NUL byte in launcher argument".into()))
}

/// Build the launcher argument vector for one command of `task`.
pub fn build_launcher_argv(launcher: &Path, task: &Task, cmd: &Command) -> Result<Vec<CString>> {
    let mut argv = Vec::with_capacity(cmd.argv.len() + 7);
    argv.push(cstring(launcher.to_string_lossy().into_owned())?);
    argv.push(cstring(format!("--cmd={}", cmd.argv[0]))?);
    argv.push(cstring(format!("--user={}", task.user))?);

    let mut group_arg = format!("--group={}", task.group);
    for gid in &task.sup_groups {
        group_arg.push(',');
        group_arg.push_str(&gid.to_string());
    }
    argv.push(cstring(group_arg)?);

    if task.caps_ambient != 0 {
        argv.push(cstring(format!(
            "--capabilities-ambient={:x}",
            task.caps_ambient
        ))?);
    }
    if task.caps_inheritable != 0 {
        argv.push(cstring(format!(
            "--capabilities-inheritable={:x}",
            task.caps_inheritable
        ))?);
    }
    if let Some(cg) = &task.cgroup {
        argv.push(cstring(format!("--cgroup={}", cg.path().display()))?);
    }

    argv.push(cstring("--".to_owned())?);
    for arg in &cmd.argv[1..] {
        argv.push(cstring(arg.clone())?);
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Command, TaskBuilder};

    fn task() -> Task {
        let mut b = TaskBuilder::new();
        b.name = Some("hello".into());
        b.start_cmds.push(Command::parse("/bin/echo hi").unwrap());
        b.build().unwrap()
    }

    fn strings(argv: &[CString]) -> Vec<String> {
        argv.iter()
            .map(|c| c.to_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn minimal_task_argv_shape() {
        let t = task();
        let argv =
            build_launcher_argv(Path::new("/usr/bin/crinit-launch"), &t, &t.start_cmds[0])
                .unwrap();
        assert_eq!(
            strings(&argv),
            vec![
                "/usr/bin/crinit-launch",
                "--cmd=/bin/echo",
                "--user=0",
                "--group=0",
                "--",
                "hi",
            ]
        );
    }

    #[test]
    fn groups_caps_and_cgroup_are_encoded() {
        let mut t = task();
        t.user = 100;
        t.group = 200;
        t.sup_groups = vec![201, 202];
        t.caps_ambient = 0x400; // CAP_NET_BIND_SERVICE
        t.caps_inheritable = 0x3;
        t.cgroup = Some(crate::cgroup::CgroupConfig {
            name: "web".into(),
            params: vec![],
            parent: Some("services".into()),
        });
        let argv =
            build_launcher_argv(Path::new("/usr/bin/crinit-launch"), &t, &t.start_cmds[0])
                .unwrap();
        assert_eq!(
            strings(&argv),
            vec![
                "/usr/bin/crinit-launch",
                "--cmd=/bin/echo",
                "--user=100",
                "--group=200,201,202",
                "--capabilities-ambient=400",
                "--capabilities-inheritable=3",
                "--cgroup=/sys/fs/cgroup/services/web",
                "--",
                "hi",
            ]
        );
    }

    #[test]
    fn nul_byte_is_rejected() {
        let mut t = task();
        t.start_cmds[0].argv[1] = "bad\0arg".into();
        assert!(
            build_launcher_argv(Path::new("/usr/bin/crinit-launch"), &t, &t.start_cmds[0])
                .is_err()
        );
    }
}
