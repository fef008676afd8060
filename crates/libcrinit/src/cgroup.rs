//! Cgroup v2 handling.
//!
//! Tasks may name a cgroup to run in (`CGROUP_NAME` / `CGROUP_PARAMS`), and
//! the series file may declare global cgroups (`CGROUP`) that per-task groups
//! nest under. A cgroup record is a name, an ordered list of
//! `(controller-file, value)` parameters, and an optional parent. Configure
//! creates the directory under `/sys/fs/cgroup` and writes the parameter
//! files; assignment writes a PID into `cgroup.procs`.

use std::path::{Path, PathBuf};

use log::trace;

use crate::error::{Error, Result};

pub const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupParam {
    /// Controller file name, e.g. `memory.max` or `cpu.weight`.
    pub file: String,
    /// Option text written to the file verbatim.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupConfig {
    pub name: String,
    pub params: Vec<CgroupParam>,
    /// Name of a global cgroup this one nests under, if any.
    pub parent: Option<String>,
}

impl CgroupConfig {
    /// Parse the value of a `CGROUP` / `CGROUP_PARAMS` style directive:
    /// whitespace-separated `file=value` assignments, values optionally
    /// quoted.
    pub fn parse_params(text: &str) -> Result<Vec<CgroupParam>> {
        let words = shlex::split(text).ok_or_else(|| {
            Error::InvalidInput(format!("unbalanced quoting in cgroup parameters: {text}"))
        })?;
        let mut params = Vec::new();
        for word in words {
            let (file, value) = word.split_once('=').ok_or_else(|| {
                Error::InvalidInput(format!("cgroup parameter is not file=value: {word}"))
            })?;
            if file.is_empty() || value.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "cgroup parameter has empty file or value: {word}"
                )));
            }
            params.push(CgroupParam {
                file: file.to_owned(),
                value: value.to_owned(),
            });
        }
        Ok(params)
    }

    /// Filesystem path of this cgroup under `root`.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        match &self.parent {
            Some(parent) => root.join(parent).join(&self.name),
            None => root.join(&self.name),
        }
    }

    /// Absolute path under the standard cgroup v2 mount.
    pub fn path(&self) -> PathBuf {
        self.path_under(Path::new(CGROUP_FS_ROOT))
    }

    /// Create the cgroup directory and write all parameter files.
    pub fn configure_under(&self, root: &Path) -> Result<()> {
        let dir = self.path_under(root);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating cgroup {}", dir.display()), e))?;
        for param in &self.params {
            let file = dir.join(&param.file);
            trace!(
                "cgroup {}: writing '{}' to {}",
                self.name,
                param.value,
                file.display()
            );
            std::fs::write(&file, &param.value)
                .map_err(|e| Error::io(format!("writing cgroup parameter {}", file.display()), e))?;
        }
        Ok(())
    }

    pub fn configure(&self) -> Result<()> {
        self.configure_under(Path::new(CGROUP_FS_ROOT))
    }

    /// Move `pid` into this cgroup by writing it to `cgroup.procs`.
    pub fn assign_pid_under(&self, root: &Path, pid: libc::pid_t) -> Result<()> {
        let procs = self.path_under(root).join("cgroup.procs");
        std::fs::write(&procs, format!("{pid}\n"))
            .map_err(|e| Error::io(format!("assigning pid {pid} to {}", procs.display()), e))
    }

    pub fn assign_pid(&self, pid: libc::pid_t) -> Result<()> {
        self.assign_pid_under(Path::new(CGROUP_FS_ROOT), pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_splits_assignments() {
        let params = CgroupConfig::parse_params("memory.max=100M cpu.weight=50").unwrap();
        assert_eq!(
            params,
            vec![
                CgroupParam {
                    file: "memory.max".into(),
                    value: "100M".into()
                },
                CgroupParam {
                    file: "cpu.weight".into(),
                    value: "50".into()
                },
            ]
        );
    }

    #[test]
    fn parse_params_honors_quotes() {
        let params = CgroupConfig::parse_params("io.max=\"8:0 rbps=1048576\"").unwrap();
        assert_eq!(params[0].value, "8:0 rbps=1048576");
    }

    #[test]
    fn parse_params_rejects_bare_words() {
        assert!(CgroupConfig::parse_params("memory.max").is_err());
        assert!(CgroupConfig::parse_params("=100M").is_err());
    }

    #[test]
    fn nested_path_includes_parent() {
        let cg = CgroupConfig {
            name: "net".into(),
            params: vec![],
            parent: Some("services".into()),
        };
        assert_eq!(
            cg.path_under(Path::new("/sys/fs/cgroup")),
            PathBuf::from("/sys/fs/cgroup/services/net")
        );
    }

    #[test]
    fn configure_writes_param_files() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupConfig {
            name: "workers".into(),
            params: vec![CgroupParam {
                file: "cpu.weight".into(),
                value: "200".into(),
            }],
            parent: None,
        };
        cg.configure_under(root.path()).unwrap();
        let content = std::fs::read_to_string(root.path().join("workers/cpu.weight")).unwrap();
        assert_eq!(content, "200");
    }

    #[test]
    fn assign_writes_cgroup_procs() {
        let root = tempfile::tempdir().unwrap();
        let cg = CgroupConfig {
            name: "workers".into(),
            params: vec![],
            parent: None,
        };
        cg.configure_under(root.path()).unwrap();
        cg.assign_pid_under(root.path(), 4711).unwrap();
        let content = std::fs::read_to_string(root.path().join("workers/cgroup.procs")).unwrap();
        assert_eq!(content, "4711\n");
    }
}
